//! e2fsprogs adapters: consistency check, minimal resize, superblock info.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::process::Cmd;

/// Superblock facts read from `dumpe2fs -h`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemInfo {
    pub uuid: String,
    pub block_count: u64,
    pub block_size: u64,
    pub free_blocks: Option<u64>,
}

impl FilesystemInfo {
    /// Bytes spanned by the filesystem.
    pub fn size_bytes(&self) -> u64 {
        self.block_count * self.block_size
    }

    /// Parse the header printed by `dumpe2fs -h`.
    pub fn parse(output: &str) -> Result<Self> {
        let mut uuid = None;
        let mut block_count = None;
        let mut block_size = None;
        let mut free_blocks = None;

        for line in output.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "Filesystem UUID" => uuid = Some(value.to_string()),
                "Block count" => block_count = Some(parse_number("Block count", value)?),
                "Block size" => block_size = Some(parse_number("Block size", value)?),
                "Free blocks" => free_blocks = Some(parse_number("Free blocks", value)?),
                _ => {}
            }
        }

        let info = Self {
            uuid: uuid.context("dumpe2fs output has no 'Filesystem UUID'")?,
            block_count: block_count.context("dumpe2fs output has no 'Block count'")?,
            block_size: block_size.context("dumpe2fs output has no 'Block size'")?,
            free_blocks,
        };
        if info.block_count == 0 || !info.block_size.is_power_of_two() {
            bail!(
                "implausible geometry: {} blocks of {} bytes",
                info.block_count,
                info.block_size
            );
        }
        Ok(info)
    }
}

fn parse_number(field: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .with_context(|| format!("dumpe2fs field '{}' is not a number: '{}'", field, value))
}

pub fn read_info(device: &Path) -> Result<FilesystemInfo> {
    let result = Cmd::new("dumpe2fs")
        .arg("-h")
        .arg_path(device)
        .error_msg(format!("dumpe2fs could not read {}", device.display()))
        .run()?;
    FilesystemInfo::parse(&result.stdout)
        .with_context(|| format!("unexpected dumpe2fs output for {}", device.display()))
}

/// How aggressively e2fsck may fix things.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsckMode {
    /// `-p`: only fixes that are safe without a human.
    Preen,
    /// `-y`: answer yes to every repair.
    ForceRepair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsckOutcome {
    Clean,
    Repaired,
}

/// Interpret an e2fsck exit code.
///
/// 0 is clean, 1 and 2 mean errors were corrected; anything else
/// (uncorrected errors, operational error, usage, cancel) is a failure.
pub fn fsck_outcome(code: i32) -> Option<FsckOutcome> {
    match code {
        0 => Some(FsckOutcome::Clean),
        1 | 2 => Some(FsckOutcome::Repaired),
        _ => None,
    }
}

/// Force a full check of `device`.
pub fn check(device: &Path, mode: FsckMode) -> Result<FsckOutcome> {
    let flag = match mode {
        FsckMode::Preen => "-p",
        FsckMode::ForceRepair => "-y",
    };
    let result = Cmd::new("e2fsck")
        .args(["-f", flag])
        .arg_path(device)
        .allow_fail()
        .run()?;

    match fsck_outcome(result.code()) {
        Some(outcome) => Ok(outcome),
        None => bail!(
            "e2fsck {} {} exited with {}:\n{}",
            flag,
            device.display(),
            result.code(),
            result.stdout_trimmed()
        ),
    }
}

/// Shrink the filesystem on `device` to its minimum size.
pub fn shrink_to_minimum(device: &Path) -> Result<()> {
    Cmd::new("resize2fs")
        .arg("-M")
        .arg_path(device)
        .error_msg("resize2fs -M failed")
        .run()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMPE2FS: &str = "\
dumpe2fs 1.47.0 (5-Feb-2023)
Filesystem volume name:   root
Last mounted on:          /
Filesystem UUID:          3e6be9de-8139-4b3a-9106-a43f08d823a6
Filesystem magic number:  0xEF53
Filesystem features:      ext_attr resize_inode dir_index filetype extent 64bit flex_bg sparse_super large_file huge_file dir_nlink extra_isize metadata_csum
Inode count:              65536
Block count:              41247
Reserved block count:     412
Free blocks:              1933
Free inodes:              58190
First block:              0
Block size:               4096
Fragment size:            4096
";

    #[test]
    fn test_parse_dumpe2fs_header() {
        let info = FilesystemInfo::parse(DUMPE2FS).unwrap();
        assert_eq!(info.uuid, "3e6be9de-8139-4b3a-9106-a43f08d823a6");
        assert_eq!(info.block_count, 41247);
        assert_eq!(info.block_size, 4096);
        assert_eq!(info.free_blocks, Some(1933));
        assert_eq!(info.size_bytes(), 41247 * 4096);
    }

    #[test]
    fn test_parse_missing_field() {
        let truncated = DUMPE2FS.replace("Block size:               4096\n", "");
        let err = FilesystemInfo::parse(&truncated).unwrap_err();
        assert!(err.to_string().contains("Block size"));
    }

    #[test]
    fn test_parse_bad_number() {
        let bad = DUMPE2FS.replace("41247", "lots");
        assert!(FilesystemInfo::parse(&bad).is_err());
    }

    #[test]
    fn test_parse_rejects_odd_block_size() {
        let bad = DUMPE2FS.replace("Block size:               4096", "Block size:               3000");
        assert!(FilesystemInfo::parse(&bad).is_err());
    }

    #[test]
    fn test_fsck_exit_codes() {
        assert_eq!(fsck_outcome(0), Some(FsckOutcome::Clean));
        assert_eq!(fsck_outcome(1), Some(FsckOutcome::Repaired));
        assert_eq!(fsck_outcome(2), Some(FsckOutcome::Repaired));
        assert_eq!(fsck_outcome(4), None);
        assert_eq!(fsck_outcome(8), None);
        assert_eq!(fsck_outcome(-1), None);
    }
}
