//! sfdisk adapter: read the live GPT as JSON, write a table from a script.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::disk::{Partition, PartitionTable};
use crate::process::Cmd;

#[derive(Debug, Deserialize)]
struct SfdiskDump {
    partitiontable: SfdiskTable,
}

#[derive(Debug, Deserialize)]
struct SfdiskTable {
    label: String,
    id: Option<String>,
    #[serde(default)]
    sectorsize: Option<u64>,
    #[serde(default)]
    partitions: Vec<SfdiskPartition>,
}

#[derive(Debug, Deserialize)]
struct SfdiskPartition {
    node: String,
    start: u64,
    size: u64,
    #[serde(rename = "type")]
    type_guid: String,
    uuid: Option<String>,
    name: Option<String>,
}

/// Parse `sfdisk --json` output into a [`PartitionTable`].
pub fn parse_dump(json: &str) -> Result<PartitionTable> {
    let dump: SfdiskDump =
        serde_json::from_str(json).context("sfdisk --json output is not valid JSON")?;
    let table = dump.partitiontable;

    if table.label != "gpt" {
        bail!("expected a GPT label, found '{}'", table.label);
    }
    if let Some(size) = table.sectorsize {
        if size != crate::disk::SECTOR_SIZE {
            bail!("unsupported sector size {}", size);
        }
    }

    let mut partitions = Vec::with_capacity(table.partitions.len());
    for (position, part) in table.partitions.into_iter().enumerate() {
        if part.size == 0 {
            bail!("partition {} has zero size", part.node);
        }
        let index = node_index(&part.node).unwrap_or(position as u32 + 1);
        partitions.push(Partition {
            index,
            start_sector: part.start,
            end_sector: part.start + part.size - 1,
            type_guid: part.type_guid.to_uppercase(),
            uuid: part.uuid,
            name: part.name.filter(|n| !n.is_empty()),
        });
    }

    Ok(PartitionTable {
        disk_guid: table.id,
        partitions,
    })
}

/// Trailing partition number of a node such as `disk.img3` or `/dev/loop0p3`.
fn node_index(node: &str) -> Option<u32> {
    let digits: String = node
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().ok()
}

/// Read the partition table of an image file or block device.
pub fn read_table(device: &Path) -> Result<PartitionTable> {
    let result = Cmd::new("sfdisk")
        .arg("--json")
        .arg_path(device)
        .error_msg(format!("sfdisk could not read {}", device.display()))
        .run()?;
    parse_dump(&result.stdout)
        .with_context(|| format!("unreadable partition table on {}", device.display()))
}

/// Write `table` to `device`, replacing any existing label.
pub fn write_table(device: &Path, table: &PartitionTable) -> Result<()> {
    Cmd::new("sfdisk")
        .args(["--quiet", "--no-reread", "--no-tell-kernel"])
        .arg_path(device)
        .stdin(table.to_sfdisk_script())
        .error_msg("sfdisk failed to write partition table")
        .run()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::PartitionRole;

    const DUMP: &str = r#"{
   "partitiontable": {
      "label": "gpt",
      "id": "5B0E3D5C-1A2B-4C3D-8E9F-0A1B2C3D4E5F",
      "device": "minimage-debian-bookworm.img",
      "unit": "sectors",
      "firstlba": 2048,
      "lastlba": 2097118,
      "sectorsize": 512,
      "partitions": [
         {
            "node": "minimage-debian-bookworm.img1",
            "start": 2048, "size": 2048,
            "type": "21686148-6449-6E6F-744E-656564454649",
            "uuid": "11111111-2222-4333-8444-555555555551",
            "name": "bios"
         },{
            "node": "minimage-debian-bookworm.img2",
            "start": 4096, "size": 131072,
            "type": "C12A7328-F81F-11D2-BA4B-00A0C93EC93B",
            "uuid": "11111111-2222-4333-8444-555555555552",
            "name": "esp"
         },{
            "node": "minimage-debian-bookworm.img3",
            "start": 135168, "size": 1959936,
            "type": "0fc63daf-8483-4772-8e79-3d69d8477de4",
            "uuid": "11111111-2222-4333-8444-555555555553"
         }
      ]
   }
}"#;

    #[test]
    fn test_parse_dump() {
        let table = parse_dump(DUMP).unwrap();
        table.validate().unwrap();

        assert_eq!(
            table.disk_guid.as_deref(),
            Some("5B0E3D5C-1A2B-4C3D-8E9F-0A1B2C3D4E5F")
        );
        let root = table.root();
        assert_eq!(root.index, 3);
        assert_eq!(root.start_sector, 135168);
        assert_eq!(root.end_sector, 135168 + 1959936 - 1);
        assert!(root.has_type(PartitionRole::Root));
        assert_eq!(root.name, None);
        assert_eq!(table.partitions[1].name.as_deref(), Some("esp"));
    }

    #[test]
    fn test_parse_matches_initial_layout() {
        let parsed = parse_dump(DUMP).unwrap();
        let expected = crate::disk::PartitionTable::initial(1024, 64).unwrap();
        for (a, b) in parsed.partitions.iter().zip(&expected.partitions) {
            assert_eq!(a.start_sector, b.start_sector);
            assert_eq!(a.end_sector, b.end_sector);
            assert!(a.type_guid.eq_ignore_ascii_case(&b.type_guid));
        }
    }

    #[test]
    fn test_parse_rejects_mbr() {
        let json = r#"{"partitiontable": {"label": "dos", "id": "0x1234", "partitions": []}}"#;
        assert!(parse_dump(json).is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_dump("sfdisk: cannot open").is_err());
    }

    #[test]
    fn test_node_index() {
        assert_eq!(node_index("/dev/loop7p3"), Some(3));
        assert_eq!(node_index("disk.img12"), Some(12));
        assert_eq!(node_index("disk"), None);
    }
}
