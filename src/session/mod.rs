//! Build session: the loop binding, mounts and live partition table of one
//! build.
//!
//! Resources are acquired in order (loop device, root, system partition,
//! pseudo filesystems) and released in exact reverse by
//! [`BuildSession::release`], which is idempotent and also runs on drop.

mod loopdev;
mod mounts;

pub use loopdev::{detach_stale, parse_associated, partition_node, LoopDevice, NodeWait};
pub use mounts::{escalate, mounted_under, unmount, unmount_stale, MountSet, UnmountStep};

use anyhow::{anyhow, Context};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::backend::Target;
use crate::config::BuildConfig;
use crate::disk::{PartitionRole, PartitionTable};
use crate::error::{BuildError, BuildResult};
use crate::tools::{blkid, sfdisk};

pub struct BuildSession<'a> {
    config: &'a BuildConfig,
    image: PathBuf,
    mount_root: PathBuf,
    // Declared before the loop device: on drop, mounts go first.
    mounts: MountSet,
    loop_dev: Option<LoopDevice>,
    table: Option<PartitionTable>,
    root_uuid: Option<String>,
    esp_uuid: Option<String>,
}

impl<'a> BuildSession<'a> {
    pub fn new(config: &'a BuildConfig) -> Self {
        Self {
            config,
            image: config.image_path(),
            mount_root: config.paths.mount_dir(),
            mounts: MountSet::new(),
            loop_dev: None,
            table: None,
            root_uuid: None,
            esp_uuid: None,
        }
    }

    pub fn config(&self) -> &'a BuildConfig {
        self.config
    }

    pub fn image(&self) -> &Path {
        &self.image
    }

    pub fn is_attached(&self) -> bool {
        self.loop_dev.as_ref().is_some_and(LoopDevice::is_attached)
    }

    pub fn is_mounted(&self) -> bool {
        self.mounts.contains(&self.mount_root)
    }

    pub fn mounts(&self) -> &MountSet {
        &self.mounts
    }

    pub fn loop_device(&self) -> Option<&Path> {
        self.loop_dev.as_ref().map(LoopDevice::device)
    }

    /// Partition table as last read from the image.
    pub fn table(&self) -> BuildResult<&PartitionTable> {
        self.table
            .as_ref()
            .ok_or_else(|| BuildError::resource(anyhow!("partition table has not been read")))
    }

    /// Fail unless the image file exists.
    pub fn require_image(&self) -> BuildResult<()> {
        if self.image.is_file() {
            Ok(())
        } else {
            Err(BuildError::resource(anyhow!(
                "image {} does not exist; cannot reattach",
                self.image.display()
            )))
        }
    }

    /// Bind the image to a loop device and wait for its partition nodes.
    pub fn attach(&mut self) -> BuildResult<()> {
        if self.is_attached() {
            return Ok(());
        }
        self.require_image()?;

        let loop_dev = LoopDevice::attach(&self.image).map_err(BuildError::resource)?;
        // Stored before waiting so a timeout still detaches.
        let loop_dev = self.loop_dev.insert(loop_dev);
        loop_dev
            .wait_for_partitions(PartitionRole::ORDER.len() as u32, NodeWait::default())
            .map_err(BuildError::resource)?;
        Ok(())
    }

    fn attached(&self) -> BuildResult<&LoopDevice> {
        self.loop_dev
            .as_ref()
            .filter(|l| l.is_attached())
            .ok_or_else(|| BuildError::resource(anyhow!("image is not attached")))
    }

    pub fn partition_device(&self, role: PartitionRole) -> BuildResult<PathBuf> {
        let index = self.table()?.partition(role).index;
        Ok(self.attached()?.partition_path(index))
    }

    /// Read the live partition table and filesystem UUIDs.
    pub fn identify(&mut self) -> BuildResult<()> {
        let table = sfdisk::read_table(&self.image)
            .and_then(|t| t.validate().map(|()| t))
            .with_context(|| format!("unexpected partition table in {}", self.image.display()))
            .map_err(BuildError::resource)?;
        self.table = Some(table);

        let root = self.partition_device(PartitionRole::Root)?;
        let esp = self.partition_device(PartitionRole::System)?;
        self.root_uuid = Some(blkid::filesystem_uuid(&root).map_err(BuildError::resource)?);
        self.esp_uuid = Some(blkid::filesystem_uuid(&esp).map_err(BuildError::resource)?);
        Ok(())
    }

    /// Mount the root partition, then the system partition at `boot/efi`.
    pub fn mount_image(&mut self) -> BuildResult<()> {
        let root = self.partition_device(PartitionRole::Root)?;
        let esp = self.partition_device(PartitionRole::System)?;
        let mount_root = self.mount_root.clone();

        self.mounts
            .mount_device(&root, &mount_root, Some("ext4"))
            .map_err(BuildError::resource)?;
        self.mounts
            .mount_device(&esp, &mount_root.join("boot/efi"), Some("vfat"))
            .map_err(BuildError::resource)?;
        info!("mounted image at {}", mount_root.display());
        Ok(())
    }

    /// Mount only the root partition, read-only, for inspection.
    pub fn mount_root_readonly(&mut self) -> BuildResult<PathBuf> {
        let root = self.partition_device(PartitionRole::Root)?;
        self.mounts
            .mount_readonly(&root, &self.mount_root, "ext4")
            .map_err(BuildError::resource)?;
        Ok(self.mount_root.clone())
    }

    /// Mount proc, sys, dev and dev/pts inside the root. Safe to repeat.
    pub fn mount_pseudo(&mut self) -> BuildResult<()> {
        if !self.is_mounted() {
            return Err(BuildError::resource(anyhow!("root filesystem is not mounted")));
        }
        let root = self.mount_root.clone();
        let result = self
            .mounts
            .mount_pseudo("proc", &root.join("proc"))
            .and_then(|()| self.mounts.mount_pseudo("sysfs", &root.join("sys")))
            .and_then(|()| self.mounts.bind(Path::new("/dev"), &root.join("dev")))
            .and_then(|()| self.mounts.mount_pseudo("devpts", &root.join("dev/pts")));
        result.map_err(BuildError::resource)
    }

    /// Handle to the mounted root for backend operations.
    pub fn target(&self) -> BuildResult<Target<'a>> {
        if !self.is_mounted() {
            return Err(BuildError::resource(anyhow!("root filesystem is not mounted")));
        }
        let missing = || BuildError::resource(anyhow!("filesystem UUIDs have not been read"));
        Ok(Target::new(
            self.config,
            self.mount_root.clone(),
            self.attached()?.device().to_path_buf(),
            self.root_uuid.clone().ok_or_else(missing)?,
            self.esp_uuid.clone().ok_or_else(missing)?,
        ))
    }

    /// Unmount everything, in reverse acquisition order.
    pub fn unmount_all(&mut self) -> BuildResult<()> {
        self.mounts.unmount_all().map_err(BuildError::resource)
    }

    /// Detach the loop device. Mounts must be gone first.
    pub fn detach(&mut self) -> BuildResult<()> {
        if !self.mounts.is_empty() {
            return Err(BuildError::resource(anyhow!(
                "cannot detach with {} mount(s) active",
                self.mounts.len()
            )));
        }
        if let Some(loop_dev) = self.loop_dev.as_mut() {
            // Kept on failure so a later release can retry.
            loop_dev.detach().map_err(BuildError::resource)?;
        }
        self.loop_dev = None;
        Ok(())
    }

    /// Release every held resource. Calling this again is harmless.
    pub fn release(&mut self) -> BuildResult<()> {
        if self.mounts.is_empty() && self.loop_dev.is_none() {
            return Ok(());
        }
        info!("releasing build resources");
        let unmounted = self.unmount_all();
        // A mount that would not go away keeps the loop device busy.
        if unmounted.is_err() {
            if let Some(loop_dev) = self.loop_dev.take() {
                warn!("leaving {} attached", loop_dev.device().display());
                loop_dev.abandon();
            }
            return unmounted;
        }
        self.detach()
    }
}

impl Drop for BuildSession<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("cleanup incomplete: {}", e);
        }
    }
}
