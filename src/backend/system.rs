//! Configuration steps shared by both backends.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::warn;

use super::files;
use super::Target;

/// Hostname, hosts, fstab and timezone.
pub fn write_base_config(target: &Target) -> Result<()> {
    let config = target.config;

    target.write_file("etc/hostname", &format!("{}\n", config.hostname))?;
    target.write_file("etc/hosts", &files::hosts(&config.hostname))?;
    target.write_file("etc/fstab", &files::fstab(target.root_uuid(), target.esp_uuid()))?;

    target.symlink(
        "etc/localtime",
        &format!("/usr/share/zoneinfo/{}", config.timezone),
    )?;
    target.write_file("etc/timezone", &format!("{}\n", config.timezone))?;
    Ok(())
}

/// Give the chroot the host's name servers, replacing whatever
/// `etc/resolv.conf` is (often a symlink into an unmounted `/run`).
pub fn copy_host_resolver(target: &Target, host: &Path) -> Result<()> {
    let resolv = match fs::read_to_string(host) {
        Ok(resolv) => resolv,
        Err(e) => {
            warn!("cannot read {}: {}; chroot may lack DNS", host.display(), e);
            return Ok(());
        }
    };
    target.remove("etc/resolv.conf")?;
    target.write_file("etc/resolv.conf", &resolv)?;
    Ok(())
}

pub fn set_root_password(target: &Target) -> Result<()> {
    target
        .chroot("chpasswd", std::iter::empty::<&str>())
        .stdin(format!("root:{}\n", target.config.root_password))
        .error_msg("chpasswd failed")
        .run()?;
    Ok(())
}

/// Install GRUB for BIOS (into the whole disk) and for EFI (removable path),
/// then generate its config with `mkconfig`.
pub fn install_grub(target: &Target, mkconfig: &[&str]) -> Result<()> {
    let device = target.boot_device().to_string_lossy().into_owned();

    target
        .chroot("grub-install", ["--target=i386-pc", "--boot-directory=/boot", device.as_str()])
        .error_msg("grub-install (BIOS) failed")
        .run()
        .with_context(|| format!("installing BIOS boot code on {}", device))?;

    target
        .chroot(
            "grub-install",
            [
                "--target=x86_64-efi",
                "--efi-directory=/boot/efi",
                "--boot-directory=/boot",
                "--removable",
                "--no-nvram",
            ],
        )
        .error_msg("grub-install (EFI) failed")
        .run()?;

    let (program, args) = mkconfig
        .split_first()
        .context("empty grub config command")?;
    target
        .chroot(program, args)
        .error_msg("generating grub.cfg failed")
        .run()?;
    Ok(())
}

/// Install the first-boot expansion helper script.
pub fn write_expand_script(target: &Target) -> Result<()> {
    target.write_executable(files::EXPAND_SCRIPT_PATH, &files::expand_rootfs_script())?;
    Ok(())
}
