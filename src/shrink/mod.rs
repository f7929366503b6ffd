//! Shrink and repartition the finished image.
//!
//! Order matters: content cleanup and the tree digest happen while mounted;
//! the filesystem is checked and shrunk once unmounted, then remounted
//! read-only to confirm the digest; the loop device is detached before the
//! partition table or file length is touched.

mod bootcode;
mod geometry;

pub use bootcode::{BootCode, BOOT_CODE_LEN};
pub use geometry::ShrinkPlan;

use anyhow::{anyhow, bail, Context};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::backend::{self, Backend, Operation};
use crate::digest::{self, MOUNT_POINTS};
use crate::disk::{PartitionRole, PartitionTable};
use crate::error::{BuildError, BuildResult};
use crate::interrupt;
use crate::output::{self, Artifact};
use crate::process::Cmd;
use crate::session::BuildSession;
use crate::tools::{ext, sfdisk, FilesystemInfo, FsckMode, FsckOutcome};

/// What the shrink did, for the build report.
#[derive(Debug, Clone, Serialize)]
pub struct ShrinkSummary {
    pub original_bytes: u64,
    pub final_bytes: u64,
    pub filesystem: FilesystemInfo,
    pub fsck_repaired: bool,
    pub tree_digest: String,
    pub plan: ShrinkPlan,
    pub artifacts: Vec<Artifact>,
    pub transform_failures: Vec<String>,
}

/// Clean, shrink, repartition, truncate and transform the image.
pub fn finalize(session: &mut BuildSession, backend: &dyn Backend) -> BuildResult<ShrinkSummary> {
    let image = session.image().to_path_buf();
    let original_bytes = fs::metadata(&image)?.len();

    let target = session.target()?;
    backend::run(backend, Operation::Cleanup, &target)?;

    let tree_digest = digest::tree_digest(target.root(), MOUNT_POINTS).map_err(BuildError::shrink)?;
    info!("root tree digest {}", tree_digest);
    let expected_uuid = target.root_uuid().to_string();
    drop(target);

    let root_device = session.partition_device(PartitionRole::Root)?;
    session.unmount_all()?;
    interrupt::check()?;

    let fsck = check_filesystem(&root_device)?;

    ext::shrink_to_minimum(&root_device).map_err(BuildError::shrink)?;
    let filesystem = ext::read_info(&root_device).map_err(BuildError::shrink)?;
    if !filesystem.uuid.eq_ignore_ascii_case(&expected_uuid) {
        return Err(BuildError::shrink(anyhow!(
            "filesystem UUID changed from {} to {} during resize",
            expected_uuid,
            filesystem.uuid
        )));
    }
    info!(
        "root filesystem is now {} blocks of {} bytes",
        filesystem.block_count, filesystem.block_size
    );
    verify_tree(session, &tree_digest)?;

    let boot_code = BootCode::capture(&image).map_err(BuildError::shrink)?;

    session.detach()?;
    interrupt::check()?;

    let plan = repartition(&image, &filesystem, &boot_code).map_err(BuildError::shrink)?;
    let final_bytes = plan.new_len_bytes();
    info!(
        "shrunk {} from {} to {} bytes",
        image.display(),
        original_bytes,
        final_bytes
    );

    let transforms = output::transform(session.config(), &image);

    Ok(ShrinkSummary {
        original_bytes,
        final_bytes,
        filesystem,
        fsck_repaired: fsck == FsckOutcome::Repaired,
        tree_digest,
        plan,
        artifacts: transforms.artifacts,
        transform_failures: transforms.failures.iter().map(ToString::to_string).collect(),
    })
}

/// Remount the shrunk root read-only and compare its digest with `expected`.
fn verify_tree(session: &mut BuildSession, expected: &str) -> BuildResult<()> {
    let root = session.mount_root_readonly()?;
    let after = digest::tree_digest(&root, MOUNT_POINTS).map_err(BuildError::shrink);
    session.unmount_all()?;
    digest::ensure_unchanged(expected, &after?).map_err(BuildError::shrink)?;
    info!("root tree unchanged by the shrink");
    Ok(())
}

/// `e2fsck -f -p`, then once more with `-f -y` if that fails.
fn check_filesystem(device: &Path) -> BuildResult<FsckOutcome> {
    match ext::check(device, FsckMode::Preen) {
        Ok(outcome) => Ok(outcome),
        Err(first) => {
            warn!("preen check failed, retrying with forced repair: {:#}", first);
            ext::check(device, FsckMode::ForceRepair)
                .with_context(|| format!("after preen failure: {:#}", first))
                .map_err(BuildError::shrink)
        }
    }
}

/// Rewrite the table around the shrunk root and cut the file to fit.
///
/// The image must not be attached to a loop device. Once the file has been
/// truncated any failure leaves it unbootable, so it is moved aside to
/// `<image>.invalid` before the error is returned.
pub fn repartition(
    image: &Path,
    filesystem: &FilesystemInfo,
    boot_code: &BootCode,
) -> anyhow::Result<ShrinkPlan> {
    // Start sector comes from what is on disk, not what was planned.
    let live = sfdisk::read_table(image)?;
    let plan = ShrinkPlan::compute(&live, filesystem.size_bytes())?;

    let current = fs::metadata(image)?.len();
    if plan.new_len_bytes() > current {
        bail!(
            "planned length {} exceeds current image length {}",
            plan.new_len_bytes(),
            current
        );
    }

    match rewrite(image, &live, &plan, boot_code) {
        Ok(()) => Ok(plan),
        Err(e) => Err(discard(image, e)),
    }
}

fn rewrite(
    image: &Path,
    live: &PartitionTable,
    plan: &ShrinkPlan,
    boot_code: &BootCode,
) -> anyhow::Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(image)
        .with_context(|| format!("Failed to open {}", image.display()))?;
    file.set_len(plan.new_len_bytes())
        .with_context(|| format!("Failed to truncate {}", image.display()))?;
    file.sync_all()?;
    drop(file);

    Cmd::new("wipefs")
        .args(["--all", "--force"])
        .arg_path(image)
        .error_msg("wipefs failed")
        .run()?;
    sfdisk::write_table(image, &plan.table)?;

    let written = sfdisk::read_table(image)?;
    verify_repartition(live, &written, plan)?;

    boot_code.restore(image)?;
    boot_code.verify(image)
}

/// Path a half-rewritten image is moved to.
pub fn invalid_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_owned();
    name.push(".invalid");
    PathBuf::from(name)
}

fn discard(image: &Path, error: anyhow::Error) -> anyhow::Error {
    let invalid = invalid_path(image);
    let moved = fs::rename(image, &invalid)
        .map(|()| format!("moved to {}", invalid.display()))
        .or_else(|_| fs::remove_file(image).map(|()| "removed".to_string()));
    match moved {
        Ok(what) => {
            warn!("partially rewritten image {} {}", image.display(), what);
            error.context(format!(
                "image {} is unusable ({}); rebuild from phase 1",
                image.display(),
                what
            ))
        }
        Err(e) => error.context(format!(
            "image {} is unusable and could not be removed ({}); delete it and rebuild from phase 1",
            image.display(),
            e
        )),
    }
}

/// p1 and p2 unchanged, p3 keeps its start and gets the planned end.
fn verify_repartition(
    before: &PartitionTable,
    after: &PartitionTable,
    plan: &ShrinkPlan,
) -> anyhow::Result<()> {
    after.validate()?;
    for role in [PartitionRole::BiosBoot, PartitionRole::System] {
        let (old, new) = (before.partition(role), after.partition(role));
        if old.start_sector != new.start_sector
            || old.end_sector != new.end_sector
            || !new.type_guid.eq_ignore_ascii_case(&old.type_guid)
        {
            bail!(
                "partition {} moved from {}..={} to {}..={}",
                old.index,
                old.start_sector,
                old.end_sector,
                new.start_sector,
                new.end_sector
            );
        }
    }
    let root = after.root();
    if root.start_sector != plan.root_start || root.end_sector != plan.new_root_end {
        bail!(
            "root partition is {}..={}, expected {}..={}",
            root.start_sector,
            root.end_sector,
            plan.root_start,
            plan.new_root_end
        );
    }
    if let (Some(old), Some(new)) = (&before.disk_guid, &after.disk_guid) {
        if !old.eq_ignore_ascii_case(new) {
            bail!("disk GUID changed from {} to {}", old, new);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MIB;
    use tempfile::TempDir;

    #[test]
    fn test_failed_rewrite_moves_image_aside() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("minimage-debian-bookworm.img");
        fs::write(&image, vec![0u8; 4096]).unwrap();

        let err = discard(&image, anyhow!("sfdisk failed to write partition table"));
        let message = format!("{:#}", err);

        assert!(!image.exists());
        assert!(invalid_path(&image).exists());
        assert!(invalid_path(&image).ends_with("minimage-debian-bookworm.img.invalid"));
        assert!(message.contains("rebuild from phase 1"));
        assert!(message.contains("sfdisk failed"));
    }

    #[test]
    fn test_changed_tree_is_integrity_failure() {
        let err = digest::ensure_unchanged("aa11", "bb22").map_err(BuildError::shrink).unwrap_err();
        assert!(matches!(err, BuildError::ShrinkIntegrity(_)));
        assert!(digest::ensure_unchanged("aa11", "aa11").is_ok());
    }

    #[test]
    fn test_verify_accepts_planned_table() {
        let mut live = PartitionTable::initial(1024, 64).unwrap();
        live.disk_guid = Some("9B2C4A1E-0D4F-4C53-8C0B-2E1F6B7D8A90".into());
        let plan = ShrinkPlan::compute(&live, 150 * MIB).unwrap();

        let mut read_back = plan.table.clone();
        read_back.disk_guid = Some("9b2c4a1e-0d4f-4c53-8c0b-2e1f6b7d8a90".into());
        verify_repartition(&live, &read_back, &plan).unwrap();
    }

    #[test]
    fn test_verify_rejects_moved_system_partition() {
        let live = PartitionTable::initial(1024, 64).unwrap();
        let plan = ShrinkPlan::compute(&live, 150 * MIB).unwrap();

        let mut moved = plan.table.clone();
        moved.partitions[1].end_sector -= 2048;
        moved.partitions[2].start_sector -= 2048;
        assert!(verify_repartition(&live, &moved, &plan).is_err());
    }

    #[test]
    fn test_verify_rejects_changed_disk_guid() {
        let mut live = PartitionTable::initial(1024, 64).unwrap();
        live.disk_guid = Some("9B2C4A1E-0D4F-4C53-8C0B-2E1F6B7D8A90".into());
        let plan = ShrinkPlan::compute(&live, 150 * MIB).unwrap();

        let mut other = plan.table.clone();
        other.disk_guid = Some("00000000-0D4F-4C53-8C0B-2E1F6B7D8A90".into());
        assert!(verify_repartition(&live, &other, &plan).is_err());
    }
}
