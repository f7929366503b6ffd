//! Loop device binding for the image file.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::process::Cmd;

/// Bounded wait for partition nodes to appear after binding.
#[derive(Debug, Clone, Copy)]
pub struct NodeWait {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for NodeWait {
    fn default() -> Self {
        Self {
            attempts: 20,
            delay: Duration::from_millis(250),
        }
    }
}

impl NodeWait {
    /// Poll `ready` until it returns true, calling `rescan` between checks.
    ///
    /// Returns false once all attempts are used up.
    pub fn poll<R, S>(&self, mut ready: R, mut rescan: S) -> bool
    where
        R: FnMut() -> bool,
        S: FnMut(),
    {
        for attempt in 0..self.attempts {
            if ready() {
                return true;
            }
            debug!("partition nodes not ready (attempt {})", attempt + 1);
            rescan();
            thread::sleep(self.delay);
        }
        ready()
    }
}

/// An attached loop device. Detached exactly once, on [`LoopDevice::detach`]
/// or on drop.
#[derive(Debug)]
pub struct LoopDevice {
    device: PathBuf,
    image: PathBuf,
    attached: bool,
}

impl LoopDevice {
    /// Bind `image` to the first free loop device with partition scanning.
    pub fn attach(image: &Path) -> Result<Self> {
        if !image.is_file() {
            bail!("image {} does not exist", image.display());
        }

        let result = Cmd::new("losetup")
            .args(["--find", "--show", "--partscan"])
            .arg_path(image)
            .error_msg("losetup failed")
            .run()?;

        let device = PathBuf::from(result.stdout_trimmed());
        if device.as_os_str().is_empty() {
            bail!("losetup printed no device for {}", image.display());
        }
        info!("attached {} to {}", image.display(), device.display());

        let loop_dev = Self {
            device,
            image: image.to_path_buf(),
            attached: true,
        };

        if !loop_dev.device.exists() {
            bail!("loop device {} has no block node", loop_dev.device.display());
        }
        Ok(loop_dev)
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn image(&self) -> &Path {
        &self.image
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Block device node of partition `index`.
    pub fn partition_path(&self, index: u32) -> PathBuf {
        partition_node(&self.device, index)
    }

    /// Wait until nodes for partitions `1..=count` exist.
    pub fn wait_for_partitions(&self, count: u32, wait: NodeWait) -> Result<()> {
        let nodes: Vec<PathBuf> = (1..=count).map(|i| self.partition_path(i)).collect();
        let ready = || nodes.iter().all(|n| n.exists());
        let rescan = || {
            let _ = Cmd::new("partx")
                .arg("--update")
                .arg_path(&self.device)
                .allow_fail()
                .run();
        };

        if !wait.poll(ready, rescan) {
            let missing: Vec<String> = nodes
                .iter()
                .filter(|n| !n.exists())
                .map(|n| n.display().to_string())
                .collect();
            bail!("partition nodes never appeared: {}", missing.join(", "));
        }
        Ok(())
    }

    /// Detach the device. Calling this again after success is a no-op.
    pub fn detach(&mut self) -> Result<()> {
        if !self.attached {
            return Ok(());
        }
        Cmd::new("losetup")
            .arg("--detach")
            .arg_path(&self.device)
            .cleanup()
            .error_msg(format!("Failed to detach {}", self.device.display()))
            .run()
            .with_context(|| format!("loop device for {}", self.image.display()))?;
        self.attached = false;
        info!("detached {}", self.device.display());
        Ok(())
    }

    /// Give up ownership without detaching.
    pub fn abandon(mut self) {
        self.attached = false;
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        if self.attached {
            if let Err(e) = self.detach() {
                warn!("{:#}", e);
            }
        }
    }
}

/// Devices listed by `losetup --associated`.
pub fn parse_associated(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(device, _)| PathBuf::from(device.trim()))
        .filter(|device| !device.as_os_str().is_empty())
        .collect()
}

/// Detach every loop device still bound to `image` by an earlier build.
pub fn detach_stale(image: &Path) -> Result<usize> {
    let result = Cmd::new("losetup")
        .arg("--associated")
        .arg_path(image)
        .cleanup()
        .error_msg("losetup --associated failed")
        .run()?;
    let devices = parse_associated(&result.stdout);
    for device in &devices {
        info!("detaching stale {}", device.display());
        Cmd::new("losetup")
            .arg("--detach")
            .arg_path(device)
            .cleanup()
            .error_msg(format!("Failed to detach {}", device.display()))
            .run()?;
    }
    Ok(devices.len())
}

/// `/dev/loop0` + 2 gives `/dev/loop0p2`.
pub fn partition_node(device: &Path, index: u32) -> PathBuf {
    PathBuf::from(format!("{}p{}", device.display(), index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_partition_node() {
        assert_eq!(
            partition_node(Path::new("/dev/loop0"), 3),
            PathBuf::from("/dev/loop0p3")
        );
        assert_eq!(
            partition_node(Path::new("/dev/loop12"), 1),
            PathBuf::from("/dev/loop12p1")
        );
    }

    #[test]
    fn test_parse_associated() {
        let output = "/dev/loop3: [66306]:1835011 (/srv/out/minimage-debian-bookworm.img)\n\
                      /dev/loop7: [66306]:1835011 (/srv/out/minimage-debian-bookworm.img)\n";
        assert_eq!(
            parse_associated(output),
            vec![PathBuf::from("/dev/loop3"), PathBuf::from("/dev/loop7")]
        );
        assert!(parse_associated("").is_empty());
    }

    #[test]
    fn test_attach_missing_image_fails() {
        let err = LoopDevice::attach(Path::new("/nonexistent/minimage.img")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_node_wait_rescans_until_ready() {
        let checks = Cell::new(0);
        let rescans = Cell::new(0);
        let wait = NodeWait {
            attempts: 5,
            delay: Duration::ZERO,
        };

        let ready = wait.poll(
            || {
                checks.set(checks.get() + 1);
                checks.get() >= 3
            },
            || rescans.set(rescans.get() + 1),
        );
        assert!(ready);
        assert_eq!(rescans.get(), 2);
    }

    #[test]
    fn test_node_wait_is_bounded() {
        let rescans = Cell::new(0);
        let wait = NodeWait {
            attempts: 4,
            delay: Duration::ZERO,
        };
        assert!(!wait.poll(|| false, || rescans.set(rescans.get() + 1)));
        assert_eq!(rescans.get(), 4);
    }
}
