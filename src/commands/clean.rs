//! Clean command - removes build state and artifacts.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use minimage::config::BuildConfig;
use minimage::session;

/// Execute the clean command.
///
/// Always unmounts leftovers under the mount point, detaches loop devices
/// still bound to the image and removes the work directory. With `all`, the cache and output directories go too.
pub fn cmd_clean(config: &BuildConfig, all: bool) -> Result<()> {
    let mount_dir = config.paths.mount_dir();
    if mount_dir.exists() {
        let count = session::unmount_stale(&mount_dir)?;
        if count > 0 {
            println!("Unmounted {} stale mount(s) under {}", count, mount_dir.display());
        }
    }

    let image = config.image_path();
    if image.exists() {
        let count = session::detach_stale(&image)?;
        if count > 0 {
            println!("Detached {} stale loop device(s) for {}", count, image.display());
        }
    }

    remove_dir(&config.paths.work_dir)?;
    if all {
        remove_dir(&config.paths.cache_dir)?;
        remove_dir(&config.paths.output_dir)?;
    }
    Ok(())
}

fn remove_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        println!("Removing {}...", dir.display());
        fs::remove_dir_all(dir).with_context(|| format!("Failed to remove {}", dir.display()))?;
    }
    Ok(())
}
