//! Content digest of a directory tree.
//!
//! Covers relative paths, entry types, permission bits, file contents and
//! symlink targets, in sorted order. Two trees with the same digest have the
//! same installed content regardless of how their filesystems are laid out.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use walkdir::WalkDir;

/// Mount points inside the image root whose contents belong to another
/// filesystem (pseudo filesystems, tmpfs, the system partition).
pub const MOUNT_POINTS: &[&str] = &["proc", "sys", "dev", "run", "tmp", "boot/efi"];

/// Digest of everything under `root`, skipping the contents of `skip`
/// (paths relative to `root`).
///
/// A skipped directory contributes only its name: its mode is that of
/// whatever happens to be mounted on it.
pub fn tree_digest(root: &Path, skip: &[&str]) -> Result<String> {
    let mut hasher = Sha256::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_skipped(root, entry.path(), skip));

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let meta = entry
            .path()
            .symlink_metadata()
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
        let file_type = entry.file_type();

        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        if skip.iter().any(|s| rel == Path::new(s)) {
            hasher.update(b"M");
            hasher.update([0u8]);
            continue;
        }
        hasher.update(format!("{:o}", meta.permissions().mode() & 0o7777).as_bytes());

        if file_type.is_symlink() {
            hasher.update(b"L");
            let dest = fs::read_link(entry.path())?;
            hasher.update(dest.to_string_lossy().as_bytes());
        } else if file_type.is_file() {
            hasher.update(b"F");
            let mut file = fs::File::open(entry.path())
                .with_context(|| format!("Failed to open {}", entry.path().display()))?;
            io::copy(&mut file, &mut hasher)?;
        } else if file_type.is_dir() {
            hasher.update(b"D");
        } else {
            hasher.update(b"S");
        }
        hasher.update([0u8]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Whether `path` lies strictly inside one of the `skip` directories.
fn is_skipped(root: &Path, path: &Path, skip: &[&str]) -> bool {
    let Ok(rel) = path.strip_prefix(root) else {
        return false;
    };
    skip.iter().any(|s| {
        let dir = Path::new(s);
        rel.starts_with(dir) && rel != dir
    })
}

/// Fail if a digest taken after an operation differs from the one before.
pub fn ensure_unchanged(before: &str, after: &str) -> Result<()> {
    if before != after {
        anyhow::bail!("root tree content changed: digest {} became {}", before, after);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn populate(root: &Path) {
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::create_dir_all(root.join("proc/1")).unwrap();
        fs::write(root.join("etc/hostname"), "edge\n").unwrap();
        std::os::unix::fs::symlink("/usr/share/zoneinfo/UTC", root.join("etc/localtime")).unwrap();
    }

    #[test]
    fn test_identical_trees_match() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        populate(a.path());
        populate(b.path());
        assert_eq!(
            tree_digest(a.path(), MOUNT_POINTS).unwrap(),
            tree_digest(b.path(), MOUNT_POINTS).unwrap()
        );
    }

    #[test]
    fn test_content_change_detected() {
        let temp = TempDir::new().unwrap();
        populate(temp.path());
        let before = tree_digest(temp.path(), MOUNT_POINTS).unwrap();

        fs::write(temp.path().join("etc/hostname"), "core\n").unwrap();
        assert_ne!(before, tree_digest(temp.path(), MOUNT_POINTS).unwrap());
    }

    #[test]
    fn test_system_partition_contents_ignored() {
        let temp = TempDir::new().unwrap();
        populate(temp.path());
        fs::create_dir_all(temp.path().join("boot/efi")).unwrap();
        fs::write(temp.path().join("boot/vmlinuz"), "kernel").unwrap();
        let before = tree_digest(temp.path(), MOUNT_POINTS).unwrap();

        fs::create_dir_all(temp.path().join("boot/efi/EFI/BOOT")).unwrap();
        fs::write(temp.path().join("boot/efi/EFI/BOOT/BOOTX64.EFI"), "grub").unwrap();
        assert_eq!(before, tree_digest(temp.path(), MOUNT_POINTS).unwrap());

        fs::write(temp.path().join("boot/vmlinuz"), "other kernel").unwrap();
        assert_ne!(before, tree_digest(temp.path(), MOUNT_POINTS).unwrap());
    }

    #[test]
    fn test_mount_point_mode_ignored() {
        let temp = TempDir::new().unwrap();
        populate(temp.path());
        let proc_dir = temp.path().join("proc");
        fs::set_permissions(&proc_dir, fs::Permissions::from_mode(0o555)).unwrap();
        let mounted = tree_digest(temp.path(), MOUNT_POINTS).unwrap();

        fs::set_permissions(&proc_dir, fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(mounted, tree_digest(temp.path(), MOUNT_POINTS).unwrap());
    }

    #[test]
    fn test_ensure_unchanged() {
        let temp = TempDir::new().unwrap();
        populate(temp.path());
        let before = tree_digest(temp.path(), MOUNT_POINTS).unwrap();
        ensure_unchanged(&before, &tree_digest(temp.path(), MOUNT_POINTS).unwrap()).unwrap();

        fs::remove_file(temp.path().join("etc/hostname")).unwrap();
        let after = tree_digest(temp.path(), MOUNT_POINTS).unwrap();
        let err = ensure_unchanged(&before, &after).unwrap_err();
        assert!(err.to_string().contains("content changed"));
    }

    #[test]
    fn test_volatile_contents_ignored() {
        let temp = TempDir::new().unwrap();
        populate(temp.path());
        let before = tree_digest(temp.path(), MOUNT_POINTS).unwrap();

        fs::write(temp.path().join("proc/1/status"), "State: R\n").unwrap();
        assert_eq!(before, tree_digest(temp.path(), MOUNT_POINTS).unwrap());
    }
}
