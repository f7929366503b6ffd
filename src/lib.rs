//! minimage library exports.
//!
//! The binary is a thin CLI over these modules; integration tests use them
//! directly.

pub mod backend;
pub mod config;
pub mod digest;
pub mod disk;
pub mod error;
pub mod interrupt;
pub mod orchestrator;
pub mod output;
pub mod payload;
pub mod phases;
pub mod preflight;
pub mod process;
pub mod report;
pub mod session;
pub mod shrink;
pub mod state;
pub mod timing;
pub mod tools;

pub use config::{BaseSystem, BuildConfig, OutputFormat};
pub use error::{BuildError, BuildResult};
pub use phases::{Phase, ResumePoint};
