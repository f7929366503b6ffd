//! Disk image construction.
//!
//! Layout (GPT, 512-byte sectors, 1 MiB alignment):
//!
//! ```text
//! sector 0          protective MBR, bytes [0,440) hold legacy boot code
//! sectors 1..2047   primary GPT
//! p1  2048..4095    BIOS boot partition (GRUB core, no filesystem)
//! p2  4096..        EFI system partition (FAT32)
//! p3  ..            root partition (ext4, no journal)
//! last 2048         reserved for the backup GPT
//! ```

mod image;
mod layout;

pub use image::{create_image, format, partition};
pub use layout::{
    align_down, align_up, bytes_to_sectors, Partition, PartitionRole, PartitionTable,
    ALIGNMENT_SECTORS, BACKUP_RESERVE_SECTORS, BIOS_BOOT_SECTORS, FIRST_PARTITION_SECTOR, MIB,
    SECTOR_SIZE,
};
