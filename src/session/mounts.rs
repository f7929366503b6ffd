//! Ordered mount points, released strictly in reverse.

use anyhow::{bail, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::process::Cmd;

/// One escalation step when unmounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountStep {
    Plain,
    RetryAfterDelay,
    Force,
    Lazy,
}

impl UnmountStep {
    pub const ESCALATION: [UnmountStep; 4] = [
        UnmountStep::Plain,
        UnmountStep::RetryAfterDelay,
        UnmountStep::Force,
        UnmountStep::Lazy,
    ];

    fn flag(self) -> Option<&'static str> {
        match self {
            UnmountStep::Plain | UnmountStep::RetryAfterDelay => None,
            UnmountStep::Force => Some("-f"),
            UnmountStep::Lazy => Some("-l"),
        }
    }
}

/// Run `attempt` for each escalation step until one succeeds.
///
/// Returns the step that worked, or the last error.
pub fn escalate<F>(retry_delay: Duration, mut attempt: F) -> Result<UnmountStep>
where
    F: FnMut(UnmountStep) -> Result<()>,
{
    let mut last_err = None;
    for step in UnmountStep::ESCALATION {
        if step == UnmountStep::RetryAfterDelay {
            thread::sleep(retry_delay);
        }
        match attempt(step) {
            Ok(()) => return Ok(step),
            Err(e) => {
                debug!("unmount step {:?} failed: {:#}", step, e);
                last_err = Some(e);
            }
        }
    }
    match last_err {
        Some(e) => Err(e),
        None => bail!("no unmount step attempted"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Mount {
    target: PathBuf,
    label: String,
}

/// Mount points owned by a build session.
#[derive(Debug)]
pub struct MountSet {
    mounts: Vec<Mount>,
    retry_delay: Duration,
}

impl MountSet {
    pub fn new() -> Self {
        Self {
            mounts: Vec::new(),
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn contains(&self, target: &Path) -> bool {
        self.mounts.iter().any(|m| m.target == target)
    }

    /// Mount a block device (`fstype` None lets mount probe it).
    pub fn mount_device(&mut self, device: &Path, target: &Path, fstype: Option<&str>) -> Result<()> {
        let mut cmd = Cmd::new("mount");
        if let Some(fstype) = fstype {
            cmd = cmd.args(["-t", fstype]);
        }
        let cmd = cmd.arg_path(device).arg_path(target);
        self.mount_with(cmd, target, &device.display().to_string())
    }

    /// Mount a block device read-only.
    pub fn mount_readonly(&mut self, device: &Path, target: &Path, fstype: &str) -> Result<()> {
        let cmd = Cmd::new("mount")
            .args(["-o", "ro", "-t", fstype])
            .arg_path(device)
            .arg_path(target);
        self.mount_with(cmd, target, &device.display().to_string())
    }

    /// Mount a pseudo filesystem such as `proc` or `sysfs`.
    pub fn mount_pseudo(&mut self, fstype: &str, target: &Path) -> Result<()> {
        let cmd = Cmd::new("mount")
            .args(["-t", fstype, fstype])
            .arg_path(target);
        self.mount_with(cmd, target, fstype)
    }

    /// Bind-mount `source` onto `target`.
    pub fn bind(&mut self, source: &Path, target: &Path) -> Result<()> {
        let cmd = Cmd::new("mount").arg("--bind").arg_path(source).arg_path(target);
        self.mount_with(cmd, target, &source.display().to_string())
    }

    fn mount_with(&mut self, cmd: Cmd, target: &Path, label: &str) -> Result<()> {
        if self.contains(target) {
            debug!("{} already mounted", target.display());
            return Ok(());
        }
        fs::create_dir_all(target)?;
        cmd.error_msg(format!("Failed to mount {} on {}", label, target.display()))
            .run()?;
        debug!("mounted {} on {}", label, target.display());
        self.mounts.push(Mount {
            target: target.to_path_buf(),
            label: label.to_string(),
        });
        Ok(())
    }

    /// Unmount everything in reverse order.
    ///
    /// Every mount is attempted even if an earlier one fails; the first
    /// failure is returned.
    pub fn unmount_all(&mut self) -> Result<()> {
        let mut first_err = None;
        while let Some(mount) = self.mounts.pop() {
            match unmount(&mount.target, self.retry_delay) {
                Ok(UnmountStep::Plain) => debug!("unmounted {}", mount.target.display()),
                Ok(step) => info!("unmounted {} ({:?})", mount.target.display(), step),
                Err(e) => {
                    warn!("could not unmount {} ({}): {:#}", mount.target.display(), mount.label, e);
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for MountSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MountSet {
    fn drop(&mut self) {
        if !self.mounts.is_empty() {
            let _ = self.unmount_all();
        }
    }
}

/// Unmount `target`, escalating through retry, force and lazy unmount.
pub fn unmount(target: &Path, retry_delay: Duration) -> Result<UnmountStep> {
    escalate(retry_delay, |step| {
        let mut cmd = Cmd::new("umount").cleanup();
        if let Some(flag) = step.flag() {
            cmd = cmd.arg(flag);
        }
        cmd.arg_path(target).run().map(|_| ())
    })
}

/// Mount points at or below `root` listed in a `/proc/mounts` dump,
/// deepest first.
pub fn mounted_under(proc_mounts: &str, root: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = proc_mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(field.replace("\\040", " ")))
        .filter(|target| target.starts_with(root))
        .collect();
    found.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    found.dedup();
    found
}

/// Unmount anything left mounted under `root` by an earlier, killed build.
pub fn unmount_stale(root: &Path) -> Result<usize> {
    let proc_mounts = fs::read_to_string("/proc/mounts")?;
    let stale = mounted_under(&proc_mounts, root);
    for target in &stale {
        info!("unmounting stale {}", target.display());
        unmount(target, Duration::from_secs(1))?;
    }
    Ok(stale.len())
}
