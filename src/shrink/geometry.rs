//! Sector arithmetic for shrinking the root partition.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::disk::{align_up, bytes_to_sectors, PartitionTable, ALIGNMENT_SECTORS, SECTOR_SIZE};

/// The new geometry of a shrunk image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShrinkPlan {
    pub root_start: u64,
    pub old_root_end: u64,
    pub new_root_end: u64,
    pub new_total_sectors: u64,
    pub table: PartitionTable,
}

impl ShrinkPlan {
    /// Plan the shrink from the live table and the minimal filesystem size.
    ///
    /// The root keeps its start; its end moves to the first alignment
    /// boundary that holds `fs_bytes`, and the image keeps one alignment
    /// unit after it for the backup table.
    pub fn compute(live: &PartitionTable, fs_bytes: u64) -> Result<Self> {
        live.validate()?;
        if fs_bytes == 0 {
            bail!("filesystem reports zero size");
        }

        let root = live.root();
        let root_start = root.start_sector;
        let new_root_end = align_up(root_start + bytes_to_sectors(fs_bytes), ALIGNMENT_SECTORS) - 1;

        if new_root_end > root.end_sector {
            bail!(
                "minimal filesystem ({} bytes) does not fit the current root partition \
                 (sectors {}..={})",
                fs_bytes,
                root_start,
                root.end_sector
            );
        }

        let table = live.with_root_end(new_root_end);
        table.validate()?;

        Ok(Self {
            root_start,
            old_root_end: root.end_sector,
            new_root_end,
            new_total_sectors: table.total_sectors(),
            table,
        })
    }

    pub fn new_len_bytes(&self) -> u64 {
        self.new_total_sectors * SECTOR_SIZE
    }

    pub fn root_bytes(&self) -> u64 {
        (self.new_root_end - self.root_start + 1) * SECTOR_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{PartitionRole, MIB};

    #[test]
    fn test_end_is_aligned_and_holds_filesystem() {
        let live = PartitionTable::initial(1024, 64).unwrap();
        let fs_bytes = 150 * MIB + 12_345;
        let plan = ShrinkPlan::compute(&live, fs_bytes).unwrap();

        assert_eq!(plan.root_start, live.root().start_sector);
        assert_eq!((plan.new_root_end + 1) % ALIGNMENT_SECTORS, 0);
        assert!(plan.root_bytes() >= fs_bytes);
        assert!(plan.root_bytes() - fs_bytes < ALIGNMENT_SECTORS * SECTOR_SIZE);
    }

    #[test]
    fn test_gigabyte_image_with_small_content() {
        let live = PartitionTable::initial(1024, 64).unwrap();
        let plan = ShrinkPlan::compute(&live, 150 * MIB).unwrap();

        assert!(plan.new_len_bytes() < 400 * MIB);
        assert!(plan.new_len_bytes() <= 1024 * MIB);
        assert_eq!(plan.new_len_bytes() % 512, 0);
        assert_eq!(plan.table.root().start_sector, 135168);
        assert_eq!(plan.new_root_end, 442367);
        assert_eq!(plan.new_total_sectors, 442368 + 2048);
    }

    #[test]
    fn test_only_root_end_changes() {
        let live = PartitionTable::initial(2048, 128).unwrap();
        let plan = ShrinkPlan::compute(&live, 300 * MIB).unwrap();

        for role in [PartitionRole::BiosBoot, PartitionRole::System] {
            assert_eq!(plan.table.partition(role), live.partition(role));
        }
        assert_eq!(plan.table.root().type_guid, live.root().type_guid);
        assert_eq!(plan.table.disk_guid, live.disk_guid);
    }

    #[test]
    fn test_exact_boundary_does_not_round_past() {
        let live = PartitionTable::initial(1024, 64).unwrap();
        let start = live.root().start_sector;
        // Fills the root up to exactly one alignment boundary.
        let sectors = align_up(start + 1, ALIGNMENT_SECTORS) - start;
        let plan = ShrinkPlan::compute(&live, sectors * SECTOR_SIZE).unwrap();
        assert_eq!(plan.new_root_end + 1, start + sectors);
    }

    #[test]
    fn test_filesystem_larger_than_partition_fails() {
        let live = PartitionTable::initial(512, 64).unwrap();
        assert!(ShrinkPlan::compute(&live, 600 * MIB).is_err());
        assert!(ShrinkPlan::compute(&live, 0).is_err());
    }
}
