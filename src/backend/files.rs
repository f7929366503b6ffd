//! Configuration files and service definitions shared by both backends.

/// Name of the first-boot expansion helper and its service.
pub const EXPAND_SERVICE: &str = "minimage-expand-rootfs";

/// Path of the expansion helper inside the image.
pub const EXPAND_SCRIPT_PATH: &str = "usr/local/sbin/minimage-expand-rootfs";

/// Kernel console arguments: VGA plus first serial port for headless VMs.
pub const CONSOLE_ARGS: &str = "console=tty0 console=ttyS0,115200";

pub fn fstab(root_uuid: &str, esp_uuid: &str) -> String {
    format!(
        "# <file system>  <mount point>  <type>  <options>  <dump>  <pass>\n\
         UUID={}  /          ext4  defaults,noatime  0  1\n\
         UUID={}  /boot/efi  vfat  umask=0077        0  2\n",
        root_uuid, esp_uuid
    )
}

pub fn hosts(hostname: &str) -> String {
    format!(
        "127.0.0.1\tlocalhost\n\
         127.0.1.1\t{hostname}\n\
         ::1\t\tlocalhost ip6-localhost ip6-loopback\n"
    )
}

/// `/etc/default/grub` with a short timeout and serial console enabled.
pub fn grub_defaults(distributor: &str, cmdline: &str) -> String {
    format!(
        "GRUB_DEFAULT=0\n\
         GRUB_TIMEOUT=1\n\
         GRUB_DISTRIBUTOR=\"{distributor}\"\n\
         GRUB_CMDLINE_LINUX_DEFAULT=\"{cmdline}\"\n\
         GRUB_CMDLINE_LINUX=\"\"\n\
         GRUB_TERMINAL=\"console serial\"\n\
         GRUB_SERIAL_COMMAND=\"serial --speed=115200 --unit=0 --word=8 --parity=no --stop=1\"\n\
         GRUB_DISABLE_OS_PROBER=true\n"
    )
}

/// First-boot helper: move the backup GPT to the real end of the disk,
/// grow the root partition into the free space, then grow the filesystem.
///
/// Only relies on /proc, sysfs, sgdisk, growpart and resize2fs so it runs on
/// both glibc and busybox userlands.
pub fn expand_rootfs_script() -> String {
    r#"#!/bin/sh
set -eu

root_dev=$(awk '$2 == "/" { print $1 }' /proc/mounts | tail -n 1)
name=$(basename "$root_dev")
part=$(cat "/sys/class/block/$name/partition")
disk="/dev/$(basename "$(readlink -f "/sys/class/block/$name/..")")"

sgdisk -e "$disk"
# growpart exits 1 when there is nothing to grow
growpart "$disk" "$part" || [ $? -eq 1 ]
resize2fs "$root_dev"
"#
    .to_string()
}

pub fn systemd_expand_unit() -> String {
    format!(
        "[Unit]\n\
         Description=Expand root filesystem to fill the disk\n\
         After=local-fs.target\n\
         ConditionPathExists=/{script}\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         ExecStart=/{script}\n\
         ExecStartPost=/bin/systemctl disable {service}.service\n\
         RemainAfterExit=yes\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        script = EXPAND_SCRIPT_PATH,
        service = EXPAND_SERVICE
    )
}

pub fn systemd_payload_unit(name: &str) -> String {
    format!(
        "[Unit]\n\
         Description={name}\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         ExecStart=/opt/{name}/{name}\n\
         WorkingDirectory=/opt/{name}\n\
         Restart=on-failure\n\
         RestartSec=5\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n"
    )
}

pub fn openrc_expand_script() -> String {
    format!(
        "#!/sbin/openrc-run\n\
         \n\
         description=\"Expand root filesystem to fill the disk\"\n\
         \n\
         depend() {{\n\
         \tneed localmount\n\
         }}\n\
         \n\
         start() {{\n\
         \tebegin \"Expanding root filesystem\"\n\
         \t/{script}\n\
         \teend $? && rc-update del {service} default\n\
         }}\n",
        script = EXPAND_SCRIPT_PATH,
        service = EXPAND_SERVICE
    )
}

pub fn openrc_payload_script(name: &str) -> String {
    format!(
        "#!/sbin/openrc-run\n\
         \n\
         name=\"{name}\"\n\
         command=\"/opt/{name}/{name}\"\n\
         command_background=true\n\
         directory=\"/opt/{name}\"\n\
         pidfile=\"/run/${{RC_SVCNAME}}.pid\"\n\
         \n\
         depend() {{\n\
         \tneed net\n\
         \tafter firewall\n\
         }}\n"
    )
}
