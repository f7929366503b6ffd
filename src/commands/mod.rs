//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `build` - Build a disk image
//! - `clean` - Remove build state and artifacts
//! - `show` - Display information
//! - `preflight` - Run preflight checks

pub mod build;
pub mod clean;
mod preflight;
pub mod show;

pub use build::cmd_build;
pub use clean::cmd_clean;
pub use preflight::cmd_preflight;
pub use show::cmd_show;
