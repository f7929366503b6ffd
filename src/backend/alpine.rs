//! Alpine backend: apk.static, apk and OpenRC.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::files::{self, CONSOLE_ARGS, EXPAND_SERVICE};
use super::system;
use super::{Backend, Target};
use crate::error::{BuildError, BuildResult};
use crate::process::{self, Cmd};

pub const PACKAGES: &[&str] = &[
    "linux-virt",
    "grub",
    "grub-bios",
    "grub-efi",
    "ifupdown-ng",
    "e2fsprogs",
    "e2fsprogs-extra",
    "sgdisk",
    "cloud-utils-growpart",
    "tzdata",
];

/// Services per runlevel for a bootable system.
const RUNLEVELS: &[(&str, &[&str])] = &[
    ("sysinit", &["devfs", "dmesg", "mdev", "hwdrivers"]),
    (
        "boot",
        &["modules", "sysctl", "hostname", "bootmisc", "syslog", "hwclock", "networking"],
    ),
    ("shutdown", &["killprocs", "mount-ro", "savecache"]),
];

const INTERFACES: &str = "\
auto lo
iface lo inet loopback

auto eth0
iface eth0 inet dhcp
";

/// Where the host keeps the Alpine release signing keys.
const HOST_APK_KEYS: &str = "/etc/apk/keys";

const SERIAL_GETTY: &str = "ttyS0::respawn:/sbin/getty -L 115200 ttyS0 vt100";

pub struct Alpine;

impl Alpine {
    /// Host apk binary: the static build if available.
    fn apk_binary() -> Option<&'static str> {
        ["apk.static", "apk"].into_iter().find(|b| process::exists(b))
    }

    fn apk_add(&self, target: &Target, packages: &[&str]) -> Result<()> {
        target
            .chroot("apk", ["add", "--no-progress"])
            .args(packages)
            .error_msg("apk add failed")
            .run_interactive()?;
        Ok(())
    }
}

/// `/etc/apk/repositories` for a release.
pub fn repositories(mirror: &str, version: &str) -> String {
    let mirror = mirror.trim_end_matches('/');
    format!("{mirror}/{version}/main\n{mirror}/{version}/community\n")
}

/// Public keys (`*.pub`) in `dir`, sorted.
fn signing_keys(dir: &Path) -> Vec<PathBuf> {
    let mut keys: Vec<PathBuf> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "pub"))
                .collect()
        })
        .unwrap_or_default();
    keys.sort();
    keys
}

/// Copy the release signing keys from `host_dir` into the target so apk
/// verifies every package it installs there.
pub fn install_signing_keys(target: &Target, host_dir: &Path) -> Result<usize> {
    let keys = signing_keys(host_dir);
    if keys.is_empty() {
        bail!(
            "no Alpine signing keys in {} (install alpine-keys)",
            host_dir.display()
        );
    }
    let dest = target.create_dir("etc/apk/keys")?;
    for key in &keys {
        if let Some(name) = key.file_name() {
            fs::copy(key, dest.join(name))
                .with_context(|| format!("Failed to copy {}", key.display()))?;
        }
    }
    Ok(keys.len())
}

/// Link `/etc/init.d/<service>` into a runlevel. Existing links are kept.
pub fn enable_service(target: &Target, service: &str, runlevel: &str) -> Result<()> {
    let link = format!("etc/runlevels/{}/{}", runlevel, service);
    if target.path(&link)?.is_symlink() {
        return Ok(());
    }
    target.symlink(&link, &format!("/etc/init.d/{}", service))
}

impl Backend for Alpine {
    fn name(&self) -> &'static str {
        "alpine"
    }

    fn check_dependencies(&self) -> BuildResult<()> {
        let mut missing = Vec::new();
        if Self::apk_binary().is_none() {
            missing.push("  apk.static (install: apk-tools-static)".to_string());
        }
        if signing_keys(Path::new(HOST_APK_KEYS)).is_empty() {
            missing.push(format!("  signing keys in {} (install: alpine-keys)", HOST_APK_KEYS));
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(BuildError::DependencyMissing {
                context: "alpine backend".to_string(),
                missing,
            })
        }
    }

    fn bootstrap(&self, target: &Target) -> Result<()> {
        let config = target.config;
        let apk = Self::apk_binary().context("neither apk.static nor apk is installed")?;
        let main_repo = format!("{}/{}/main", config.mirror.trim_end_matches('/'), config.version);
        info!("{} --initdb from {}", apk, main_repo);

        let keys = install_signing_keys(target, Path::new(HOST_APK_KEYS))?;
        info!("trusting {} signing key(s)", keys);

        Cmd::new(apk)
            .args(["--arch", "x86_64", "-X", main_repo.as_str(), "-U"])
            .arg("--root")
            .arg_path(target.root())
            .args(["--initdb", "add", "alpine-keys", "alpine-base"])
            .error_msg("apk --initdb failed")
            .run_interactive()?;

        target.write_file(
            "etc/apk/repositories",
            &repositories(&config.mirror, &config.version),
        )?;
        // apk inside the chroot needs name resolution.
        system::copy_host_resolver(target, Path::new("/etc/resolv.conf"))
    }

    fn configure(&self, target: &Target) -> Result<()> {
        let cmdline = format!("{} rootfstype=ext4 modules=sd-mod,usb-storage,ext4", CONSOLE_ARGS);
        target.write_file("etc/default/grub", &files::grub_defaults("Alpine", &cmdline))?;
        self.apk_add(target, PACKAGES)?;

        system::write_base_config(target)?;
        target.write_file("etc/network/interfaces", INTERFACES)?;

        for (runlevel, services) in RUNLEVELS {
            for service in *services {
                enable_service(target, service, runlevel)?;
            }
        }
        target.ensure_line("etc/inittab", SERIAL_GETTY)?;

        system::set_root_password(target)?;
        system::install_grub(target, &["grub-mkconfig", "-o", "/boot/grub/grub.cfg"])
    }

    fn install_services(&self, target: &Target) -> Result<()> {
        system::write_expand_script(target)?;
        target.write_executable(
            format!("etc/init.d/{}", EXPAND_SERVICE),
            &files::openrc_expand_script(),
        )?;
        enable_service(target, EXPAND_SERVICE, "default")?;

        if let Some(payload) = &target.config.payload {
            target.write_executable(
                format!("etc/init.d/{}", payload.name),
                &files::openrc_payload_script(&payload.name),
            )?;
            enable_service(target, &payload.name, "default")?;
        }
        Ok(())
    }

    fn install_docker(&self, target: &Target) -> Result<()> {
        self.apk_add(target, &["docker"])?;
        enable_service(target, "cgroups", "boot")?;
        enable_service(target, "docker", "default")
    }

    fn cleanup(&self, target: &Target) -> Result<()> {
        let mut removed = 0;
        removed += target.clear_dir("var/cache/apk")?;
        removed += target.clear_dir("usr/share/man")?;
        removed += target.clear_dir("usr/share/doc")?;
        removed += target.clear_dir("tmp")?;
        removed += target.clear_dir("var/tmp")?;
        info!("removed {} cache/doc entries", removed);
        Ok(())
    }
}
