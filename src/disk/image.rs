//! Image file allocation, partitioning and formatting.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use tracing::info;

use super::layout::{PartitionTable, MIB};
use crate::process::Cmd;
use crate::tools::sfdisk;

/// Create a sparse file of exactly `size_mb` MiB, replacing any existing file.
pub fn create_image(path: &Path, size_mb: u64) -> Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let size_bytes = size_mb * MIB;
    let file = fs::File::create(path)
        .with_context(|| format!("Failed to create image {}", path.display()))?;
    file.set_len(size_bytes)
        .with_context(|| format!("Failed to size image {} to {} bytes", path.display(), size_bytes))?;
    info!("created sparse image {} ({} MiB)", path.display(), size_mb);
    Ok(size_bytes)
}

/// Write `layout` to the image and return the table as read back from disk.
pub fn partition(image: &Path, layout: &PartitionTable) -> Result<PartitionTable> {
    layout.validate().context("refusing to write an invalid layout")?;
    sfdisk::write_table(image, layout)?;

    let live = sfdisk::read_table(image)?;
    live.validate()
        .context("partition table read back from the image violates the layout")?;
    for (written, read) in layout.partitions.iter().zip(&live.partitions) {
        if written.start_sector != read.start_sector || written.end_sector != read.end_sector {
            bail!(
                "partition {} landed at {}..={} instead of {}..={}",
                written.index,
                read.start_sector,
                read.end_sector,
                written.start_sector,
                written.end_sector
            );
        }
    }
    Ok(live)
}

/// Format the system partition FAT32 and the root partition ext4.
///
/// The root filesystem has no journal and 1% reserved blocks to keep
/// non-data overhead down.
pub fn format(esp_device: &Path, root_device: &Path) -> Result<()> {
    info!("formatting {} as FAT32", esp_device.display());
    Cmd::new("mkfs.vfat")
        .args(["-F", "32", "-n", "EFI"])
        .arg_path(esp_device)
        .error_msg("mkfs.vfat failed")
        .run()?;

    info!("formatting {} as ext4 (no journal)", root_device.display());
    Cmd::new("mkfs.ext4")
        .args(["-F", "-q", "-L", "root", "-O", "^has_journal", "-m", "1"])
        .arg_path(root_device)
        .error_msg("mkfs.ext4 failed")
        .run()?;
    Ok(())
}
