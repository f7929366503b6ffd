//! The mounted root filesystem as seen by backend operations.
//!
//! Every path handed to a [`Target`] is relative to the image root; absolute
//! paths and `..` components are rejected so no operation can write outside
//! the target tree.

use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use crate::config::BuildConfig;
use crate::process::Cmd;

const CHROOT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

pub struct Target<'a> {
    pub config: &'a BuildConfig,
    root: PathBuf,
    /// Whole-disk loop device, for boot loader installation.
    boot_device: PathBuf,
    root_uuid: String,
    esp_uuid: String,
}

impl<'a> Target<'a> {
    pub fn new(
        config: &'a BuildConfig,
        root: PathBuf,
        boot_device: PathBuf,
        root_uuid: String,
        esp_uuid: String,
    ) -> Self {
        Self {
            config,
            root,
            boot_device,
            root_uuid,
            esp_uuid,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn boot_device(&self) -> &Path {
        &self.boot_device
    }

    pub fn root_uuid(&self) -> &str {
        &self.root_uuid
    }

    pub fn esp_uuid(&self) -> &str {
        &self.esp_uuid
    }

    /// Resolve `rel` inside the target.
    pub fn path(&self, rel: impl AsRef<Path>) -> Result<PathBuf> {
        let rel = rel.as_ref();
        for component in rel.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => bail!("path '{}' escapes the target root", rel.display()),
            }
        }
        Ok(self.root.join(rel))
    }

    pub fn exists(&self, rel: impl AsRef<Path>) -> bool {
        self.path(rel).map(|p| p.exists()).unwrap_or(false)
    }

    pub fn create_dir(&self, rel: impl AsRef<Path>) -> Result<PathBuf> {
        let path = self.path(rel)?;
        fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(path)
    }

    pub fn write_file(&self, rel: impl AsRef<Path>, content: &str) -> Result<PathBuf> {
        let path = self.path(rel)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    pub fn write_executable(&self, rel: impl AsRef<Path>, content: &str) -> Result<PathBuf> {
        let path = self.write_file(rel, content)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    /// Append `line` unless the file already contains it.
    pub fn ensure_line(&self, rel: impl AsRef<Path>, line: &str) -> Result<()> {
        let path = self.path(rel)?;
        let mut content = fs::read_to_string(&path).unwrap_or_default();
        if content.lines().any(|l| l == line) {
            return Ok(());
        }
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(line);
        content.push('\n');
        fs::write(&path, content).with_context(|| format!("Failed to update {}", path.display()))
    }

    /// Create (or replace) a symlink at `rel` pointing to `dest`.
    ///
    /// `dest` is stored verbatim and resolved inside the booted image.
    pub fn symlink(&self, rel: impl AsRef<Path>, dest: &str) -> Result<()> {
        let link = self.path(rel)?;
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent)?;
        }
        if link.is_symlink() || link.exists() {
            fs::remove_file(&link)
                .with_context(|| format!("Failed to replace {}", link.display()))?;
        }
        std::os::unix::fs::symlink(dest, &link)
            .with_context(|| format!("Failed to link {} -> {}", link.display(), dest))
    }

    /// Remove a file or directory tree. Missing paths are fine.
    pub fn remove(&self, rel: impl AsRef<Path>) -> Result<()> {
        let path = self.path(rel)?;
        remove_path(&path)
    }

    /// Remove everything inside a directory, keeping the directory itself.
    pub fn clear_dir(&self, rel: impl AsRef<Path>) -> Result<u64> {
        self.prune_dir(rel, |_| false)
    }

    /// Remove entries of a directory for which `keep` returns false.
    ///
    /// Returns the number of entries removed.
    pub fn prune_dir<F>(&self, rel: impl AsRef<Path>, keep: F) -> Result<u64>
    where
        F: Fn(&str) -> bool,
    {
        let dir = self.path(rel)?;
        if !dir.is_dir() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if keep(&name.to_string_lossy()) {
                continue;
            }
            remove_path(&entry.path())?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Build a command that runs `script` with `/bin/sh` inside the target.
    pub fn chroot_shell(&self, script: &str) -> Cmd {
        Cmd::new("chroot")
            .arg_path(&self.root)
            .args(["/bin/sh", "-c", script])
            .env("PATH", CHROOT_PATH)
            .env("LC_ALL", "C")
    }

    /// Build a command that runs `program` directly inside the target.
    pub fn chroot<I, S>(&self, program: &str, args: I) -> Cmd
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Cmd::new("chroot")
            .arg_path(&self.root)
            .arg(program)
            .args(args)
            .env("PATH", CHROOT_PATH)
            .env("LC_ALL", "C")
    }
}

fn remove_path(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", path.display())),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
    .with_context(|| format!("Failed to remove {}", path.display()))
}
