//! Partition table model and sector arithmetic.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Sector size in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// All partition boundaries sit on 1 MiB.
pub const ALIGNMENT_SECTORS: u64 = 2048;

/// First partition starts at 1 MiB, after the protective MBR and primary GPT.
pub const FIRST_PARTITION_SECTOR: u64 = ALIGNMENT_SECTORS;

/// Size of the BIOS boot partition (GRUB core image).
pub const BIOS_BOOT_SECTORS: u64 = ALIGNMENT_SECTORS;

/// Tail of the image kept free for the backup GPT.
pub const BACKUP_RESERVE_SECTORS: u64 = ALIGNMENT_SECTORS;

pub const MIB: u64 = 1024 * 1024;

/// What a partition is for, in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionRole {
    BiosBoot,
    System,
    Root,
}

impl PartitionRole {
    pub const ORDER: [PartitionRole; 3] = [
        PartitionRole::BiosBoot,
        PartitionRole::System,
        PartitionRole::Root,
    ];

    /// GPT partition type GUID.
    pub fn type_guid(self) -> &'static str {
        match self {
            PartitionRole::BiosBoot => "21686148-6449-6E6F-744E-656564454649",
            PartitionRole::System => "C12A7328-F81F-11D2-BA4B-00A0C93EC93B",
            PartitionRole::Root => "0FC63DAF-8483-4772-8E79-3D69D8477DE4",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PartitionRole::BiosBoot => "bios",
            PartitionRole::System => "esp",
            PartitionRole::Root => "root",
        }
    }
}

/// One GPT entry. Sectors are inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub index: u32,
    pub start_sector: u64,
    pub end_sector: u64,
    pub type_guid: String,
    pub uuid: Option<String>,
    pub name: Option<String>,
}

impl Partition {
    pub fn size_sectors(&self) -> u64 {
        self.end_sector + 1 - self.start_sector
    }

    pub fn offset_bytes(&self) -> u64 {
        self.start_sector * SECTOR_SIZE
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_sectors() * SECTOR_SIZE
    }

    pub fn has_type(&self, role: PartitionRole) -> bool {
        self.type_guid.eq_ignore_ascii_case(role.type_guid())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTable {
    /// GPT disk GUID, kept across a rewrite.
    pub disk_guid: Option<String>,
    pub partitions: Vec<Partition>,
}

impl PartitionTable {
    /// Layout for a fresh image of `image_size_mb` with an ESP of `esp_size_mb`.
    ///
    /// The root partition takes everything up to the last aligned sector,
    /// leaving [`BACKUP_RESERVE_SECTORS`] at the tail.
    pub fn initial(image_size_mb: u64, esp_size_mb: u64) -> Result<Self> {
        if esp_size_mb == 0 {
            bail!("system partition size must be non-zero");
        }
        let total_sectors = image_size_mb * MIB / SECTOR_SIZE;
        let esp_sectors = esp_size_mb * MIB / SECTOR_SIZE;

        let bios_start = FIRST_PARTITION_SECTOR;
        let bios_end = bios_start + BIOS_BOOT_SECTORS - 1;
        let esp_start = bios_end + 1;
        let esp_end = esp_start + esp_sectors - 1;
        let root_start = esp_end + 1;
        let root_end = align_down(
            total_sectors.saturating_sub(BACKUP_RESERVE_SECTORS),
            ALIGNMENT_SECTORS,
        )
        .saturating_sub(1);

        if root_end <= root_start {
            bail!(
                "{} MiB image has no room for a root partition after a {} MiB ESP",
                image_size_mb,
                esp_size_mb
            );
        }

        let entry = |index: u32, role: PartitionRole, start: u64, end: u64| Partition {
            index,
            start_sector: start,
            end_sector: end,
            type_guid: role.type_guid().to_string(),
            uuid: None,
            name: Some(role.label().to_string()),
        };

        let table = Self {
            disk_guid: None,
            partitions: vec![
                entry(1, PartitionRole::BiosBoot, bios_start, bios_end),
                entry(2, PartitionRole::System, esp_start, esp_end),
                entry(3, PartitionRole::Root, root_start, root_end),
            ],
        };
        table.validate()?;
        Ok(table)
    }

    /// Check the three-partition hybrid layout invariants.
    pub fn validate(&self) -> Result<()> {
        if self.partitions.len() != 3 {
            bail!(
                "expected exactly 3 partitions, found {}",
                self.partitions.len()
            );
        }

        let mut previous_end: Option<u64> = None;
        for (part, role) in self.partitions.iter().zip(PartitionRole::ORDER) {
            if !part.has_type(role) {
                bail!(
                    "partition {} has type {}, expected {} ({:?})",
                    part.index,
                    part.type_guid,
                    role.type_guid(),
                    role
                );
            }
            if part.end_sector < part.start_sector {
                bail!("partition {} ends before it starts", part.index);
            }
            if part.start_sector % ALIGNMENT_SECTORS != 0
                || (part.end_sector + 1) % ALIGNMENT_SECTORS != 0
            {
                bail!(
                    "partition {} ({}..={}) is not {}-sector aligned",
                    part.index,
                    part.start_sector,
                    part.end_sector,
                    ALIGNMENT_SECTORS
                );
            }
            if let Some(prev) = previous_end {
                if part.start_sector <= prev {
                    bail!(
                        "partition {} starts at {} which overlaps or precedes sector {}",
                        part.index,
                        part.start_sector,
                        prev
                    );
                }
            }
            previous_end = Some(part.end_sector);
        }
        Ok(())
    }

    pub fn partition(&self, role: PartitionRole) -> &Partition {
        let position = PartitionRole::ORDER
            .iter()
            .position(|r| *r == role)
            .unwrap_or(0);
        &self.partitions[position]
    }

    pub fn root(&self) -> &Partition {
        self.partition(PartitionRole::Root)
    }

    /// Copy of this table with only the root partition's end moved.
    pub fn with_root_end(&self, end_sector: u64) -> Self {
        let mut table = self.clone();
        if let Some(root) = table.partitions.last_mut() {
            root.end_sector = end_sector;
        }
        table
    }

    /// Image length in sectors implied by the root end plus the backup tail.
    pub fn total_sectors(&self) -> u64 {
        self.root().end_sector + 1 + BACKUP_RESERVE_SECTORS
    }

    /// Render as an sfdisk input script.
    pub fn to_sfdisk_script(&self) -> String {
        let mut script = String::from("label: gpt\nunit: sectors\nsector-size: 512\n");
        if let Some(guid) = &self.disk_guid {
            script.push_str(&format!("label-id: {}\n", guid));
        }
        script.push('\n');
        for part in &self.partitions {
            let mut line = format!(
                "start={}, size={}, type={}",
                part.start_sector,
                part.size_sectors(),
                part.type_guid
            );
            if let Some(uuid) = &part.uuid {
                line.push_str(&format!(", uuid={}", uuid));
            }
            if let Some(name) = &part.name {
                line.push_str(&format!(", name=\"{}\"", name));
            }
            script.push_str(&line);
            script.push('\n');
        }
        script
    }
}

pub fn align_up(sectors: u64, alignment: u64) -> u64 {
    sectors.div_ceil(alignment) * alignment
}

pub fn align_down(sectors: u64, alignment: u64) -> u64 {
    sectors / alignment * alignment
}

/// Sectors needed to hold `bytes`, rounded up.
pub fn bytes_to_sectors(bytes: u64) -> u64 {
    bytes.div_ceil(SECTOR_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_layout_1g() {
        let table = PartitionTable::initial(1024, 64).unwrap();
        let [bios, esp, root] = [&table.partitions[0], &table.partitions[1], &table.partitions[2]];

        assert_eq!((bios.start_sector, bios.end_sector), (2048, 4095));
        assert_eq!((esp.start_sector, esp.end_sector), (4096, 4096 + 131072 - 1));
        assert_eq!(root.start_sector, 135168);
        // 1 GiB = 2097152 sectors, last 2048 reserved.
        assert_eq!(root.end_sector, 2097152 - 2048 - 1);
        assert_eq!(table.total_sectors() * SECTOR_SIZE, 1024 * MIB);
    }

    #[test]
    fn test_initial_layout_is_aligned_ascending() {
        for (size, esp) in [(512, 64), (1024, 128), (4096, 64), (777, 100)] {
            let table = PartitionTable::initial(size, esp).unwrap();
            table.validate().unwrap();
            for pair in table.partitions.windows(2) {
                assert!(pair[0].end_sector < pair[1].start_sector);
            }
        }
    }

    #[test]
    fn test_initial_layout_too_small() {
        assert!(PartitionTable::initial(64, 64).is_err());
    }

    #[test]
    fn test_validate_rejects_misaligned() {
        let mut table = PartitionTable::initial(1024, 64).unwrap();
        table.partitions[2].end_sector -= 1;
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_overlap_and_order() {
        let mut table = PartitionTable::initial(1024, 64).unwrap();
        table.partitions[2].start_sector = table.partitions[1].start_sector;
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_wrong_type_or_count() {
        let mut table = PartitionTable::initial(1024, 64).unwrap();
        table.partitions[1].type_guid = PartitionRole::Root.type_guid().into();
        assert!(table.validate().is_err());

        let mut table = PartitionTable::initial(1024, 64).unwrap();
        table.partitions.pop();
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_type_comparison_is_case_insensitive() {
        let mut table = PartitionTable::initial(1024, 64).unwrap();
        table.partitions[0].type_guid = table.partitions[0].type_guid.to_lowercase();
        table.validate().unwrap();
    }

    #[test]
    fn test_with_root_end_only_moves_root() {
        let table = PartitionTable::initial(1024, 64).unwrap();
        let shrunk = table.with_root_end(409599);
        assert_eq!(shrunk.partitions[..2], table.partitions[..2]);
        assert_eq!(shrunk.root().start_sector, table.root().start_sector);
        assert_eq!(shrunk.total_sectors(), 409600 + 2048);
    }

    #[test]
    fn test_sfdisk_script() {
        let mut table = PartitionTable::initial(1024, 64).unwrap();
        table.disk_guid = Some("0D3F0E6C-0B0A-4C2B-9C6F-8E1F3C7A2B11".into());
        table.partitions[2].uuid = Some("A1B2C3D4-0000-4000-8000-000000000003".into());
        let script = table.to_sfdisk_script();

        assert!(script.starts_with("label: gpt\n"));
        assert!(script.contains("label-id: 0D3F0E6C-0B0A-4C2B-9C6F-8E1F3C7A2B11"));
        assert!(script.contains(
            "start=2048, size=2048, type=21686148-6449-6E6F-744E-656564454649, name=\"bios\""
        ));
        assert!(script.contains("uuid=A1B2C3D4-0000-4000-8000-000000000003"));
        assert_eq!(script.lines().filter(|l| l.starts_with("start=")).count(), 3);
    }

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_up(0, 2048), 0);
        assert_eq!(align_up(1, 2048), 2048);
        assert_eq!(align_up(2048, 2048), 2048);
        assert_eq!(align_down(4095, 2048), 2048);
        assert_eq!(bytes_to_sectors(513), 2);
        assert_eq!(bytes_to_sectors(512), 1);
    }
}
