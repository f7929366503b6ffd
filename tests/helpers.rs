//! Shared test utilities for minimage tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use minimage::{BaseSystem, BuildConfig};

/// Scratch base directory with a config rooted in it.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    pub base_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base_dir = temp_dir.path().to_path_buf();
        Self {
            _temp_dir: temp_dir,
            base_dir,
        }
    }

    pub fn config(&self, base: BaseSystem) -> BuildConfig {
        BuildConfig::new(base, &self.base_dir)
    }
}

/// Write a file of `len` bytes whose first sector carries recognisable
/// boot code and an MBR signature.
pub fn create_fake_image(path: &Path, len: usize) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create image dir");
    }
    let mut data = vec![0u8; len];
    for (i, byte) in data.iter_mut().take(440).enumerate() {
        *byte = 0x90 ^ (i as u8);
    }
    data[510] = 0x55;
    data[511] = 0xAA;
    fs::write(path, data).expect("Failed to write fake image");
}

/// Whether `tool` is available; tests needing it return early otherwise.
pub fn have_tool(tool: &str) -> bool {
    let found = which::which(tool).is_ok();
    if !found {
        eprintln!("skipping: {} not installed", tool);
    }
    found
}
