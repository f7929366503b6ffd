//! Typed adapters over external disk tools.
//!
//! Each adapter runs one tool through [`crate::process::Cmd`] and returns a
//! structured value, so call sites never scrape free-form output.

pub mod blkid;
pub mod ext;
pub mod sfdisk;

pub use ext::{FilesystemInfo, FsckMode, FsckOutcome};
