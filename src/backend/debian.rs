//! Debian backend: debootstrap, apt and systemd.

use anyhow::Result;
use std::path::Path;
use tracing::{info, warn};

use super::files::{self, CONSOLE_ARGS, EXPAND_SERVICE};
use super::system;
use super::{Backend, Target};
use crate::error::{BuildError, BuildResult};
use crate::preflight::missing_tools;
use crate::process::Cmd;

/// Packages installed on top of the minbase bootstrap.
pub const PACKAGES: &[&str] = &[
    "linux-image-amd64",
    "grub-pc-bin",
    "grub-efi-amd64-bin",
    "grub2-common",
    "systemd-sysv",
    "systemd-resolved",
    "locales",
    "tzdata",
    "cloud-guest-utils",
    "gdisk",
    "e2fsprogs",
    "dosfstools",
    "ca-certificates",
];

const POLICY_RC_D: &str = "usr/sbin/policy-rc.d";

const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";

const WIRED_NETWORK: &str = "\
[Match]
Name=en* eth*

[Network]
DHCP=yes
";

pub struct Debian;

impl Debian {
    fn apt_install(&self, target: &Target, packages: &[&str]) -> Result<()> {
        // Once systemd-resolved is installed resolv.conf points into /run.
        system::copy_host_resolver(target, Path::new(HOST_RESOLV_CONF))?;
        target
            .chroot("apt-get", ["update", "-q"])
            .env("DEBIAN_FRONTEND", "noninteractive")
            .error_msg("apt-get update failed")
            .run_interactive()?;
        target
            .chroot("apt-get", ["install", "-y", "-q", "--no-install-recommends"])
            .args(packages)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .error_msg("apt-get install failed")
            .run_interactive()?;
        Ok(())
    }

    fn enable_units(&self, target: &Target, units: &[&str]) -> Result<()> {
        target
            .chroot("systemctl", ["enable"])
            .args(units)
            .error_msg("systemctl enable failed")
            .run()?;
        Ok(())
    }
}

/// `sources.list` for a release, with updates and security suites.
pub fn sources_list(mirror: &str, version: &str) -> String {
    format!(
        "deb {mirror} {version} main\n\
         deb {mirror} {version}-updates main\n\
         deb http://security.debian.org/debian-security {version}-security main\n"
    )
}

impl Backend for Debian {
    fn name(&self) -> &'static str {
        "debian"
    }

    fn check_dependencies(&self) -> BuildResult<()> {
        let missing = missing_tools(&[("debootstrap", "debootstrap")]);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(BuildError::DependencyMissing {
                context: "debian backend".to_string(),
                missing,
            })
        }
    }

    fn bootstrap(&self, target: &Target) -> Result<()> {
        let config = target.config;
        info!("debootstrap {} from {}", config.version, config.mirror);
        Cmd::new("debootstrap")
            .args(["--variant=minbase", "--arch=amd64"])
            .arg(&config.version)
            .arg_path(target.root())
            .arg(&config.mirror)
            .error_msg("debootstrap failed")
            .run_interactive()?;

        // Keep package scripts from starting daemons inside the chroot.
        target.write_executable(POLICY_RC_D, "#!/bin/sh\nexit 101\n")?;
        Ok(())
    }

    fn configure(&self, target: &Target) -> Result<()> {
        let config = target.config;

        target.write_file(
            "etc/apt/sources.list",
            &sources_list(&config.mirror, &config.version),
        )?;
        target.write_file(
            "etc/default/grub",
            &files::grub_defaults("Debian", CONSOLE_ARGS),
        )?;
        self.apt_install(target, PACKAGES)?;

        system::write_base_config(target)?;

        target.write_file("etc/locale.gen", "en_US.UTF-8 UTF-8\n")?;
        target.chroot("locale-gen", std::iter::empty::<&str>()).run()?;
        target.write_file("etc/default/locale", "LANG=en_US.UTF-8\n")?;

        target.write_file("etc/systemd/network/20-wired.network", WIRED_NETWORK)?;
        self.enable_units(
            target,
            &[
                "systemd-networkd.service",
                "systemd-resolved.service",
                "serial-getty@ttyS0.service",
            ],
        )?;

        system::set_root_password(target)?;
        system::install_grub(target, &["update-grub"])
    }

    fn install_services(&self, target: &Target) -> Result<()> {
        system::write_expand_script(target)?;
        target.write_file(
            format!("etc/systemd/system/{}.service", EXPAND_SERVICE),
            &files::systemd_expand_unit(),
        )?;
        let mut units = vec![format!("{}.service", EXPAND_SERVICE)];

        if let Some(payload) = &target.config.payload {
            target.write_file(
                format!("etc/systemd/system/{}.service", payload.name),
                &files::systemd_payload_unit(&payload.name),
            )?;
            units.push(format!("{}.service", payload.name));
        }

        let units: Vec<&str> = units.iter().map(String::as_str).collect();
        self.enable_units(target, &units)
    }

    fn install_docker(&self, target: &Target) -> Result<()> {
        self.apt_install(target, &["docker.io"])?;
        self.enable_units(target, &["docker.service", "containerd.service"])
    }

    fn cleanup(&self, target: &Target) -> Result<()> {
        if let Err(e) = target.chroot("apt-get", ["clean"]).run() {
            warn!("apt-get clean failed: {:#}", e);
        }
        target.remove(POLICY_RC_D)?;

        let mut removed = 0;
        removed += target.clear_dir("var/lib/apt/lists")?;
        removed += target.clear_dir("var/cache/apt")?;
        removed += target.clear_dir("usr/share/doc")?;
        removed += target.clear_dir("usr/share/man")?;
        removed += target.prune_dir("usr/share/locale", |name| {
            name.starts_with("en") || name == "locale.alias"
        })?;
        removed += target.clear_dir("var/log/apt")?;
        removed += target.clear_dir("tmp")?;
        removed += target.clear_dir("var/tmp")?;
        info!("removed {} cache/doc entries", removed);

        // Regenerated on first boot.
        target.write_file("etc/machine-id", "")?;
        target.remove("var/lib/dbus/machine-id")?;
        target.symlink("etc/resolv.conf", "../run/systemd/resolve/stub-resolv.conf")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::target::tests::target_in;
    use crate::config::{BaseSystem, BuildConfig};
    use tempfile::TempDir;

    #[test]
    fn test_sources_list() {
        let list = sources_list("http://deb.debian.org/debian", "bookworm");
        assert!(list.starts_with("deb http://deb.debian.org/debian bookworm main\n"));
        assert!(list.contains("bookworm-updates main"));
        assert!(list.contains("debian-security bookworm-security main"));
    }

    #[test]
    fn test_packages_cover_both_boot_paths() {
        assert!(PACKAGES.contains(&"grub-pc-bin"));
        assert!(PACKAGES.contains(&"grub-efi-amd64-bin"));
        assert!(PACKAGES.contains(&"cloud-guest-utils"));
    }

    #[test]
    fn test_cleanup_trims_tree() {
        let temp = TempDir::new().unwrap();
        let config = BuildConfig::new(BaseSystem::Debian, temp.path());
        let target = target_in(&config, &temp);

        target.write_executable(POLICY_RC_D, "#!/bin/sh\nexit 101\n").unwrap();
        target.write_file("var/lib/apt/lists/deb.debian.org_dists_bookworm_InRelease", "x").unwrap();
        target.write_file("usr/share/doc/bash/copyright", "x").unwrap();
        target.write_file("usr/share/man/man1/ls.1.gz", "x").unwrap();
        target.create_dir("usr/share/locale/en_GB").unwrap();
        target.create_dir("usr/share/locale/ja").unwrap();
        target.write_file("etc/machine-id", "0123456789abcdef\n").unwrap();

        // apt-get clean through chroot is allowed to fail here.
        Debian.cleanup(&target).unwrap();

        assert!(!target.exists(POLICY_RC_D));
        assert!(target.exists("var/lib/apt/lists"));
        assert!(!target.exists("usr/share/doc/bash"));
        assert!(!target.exists("usr/share/man/man1"));
        assert!(target.exists("usr/share/locale/en_GB"));
        assert!(!target.exists("usr/share/locale/ja"));
        assert_eq!(std::fs::read_to_string(temp.path().join("etc/machine-id")).unwrap(), "");
        assert!(temp.path().join("etc/resolv.conf").is_symlink());
    }
}
