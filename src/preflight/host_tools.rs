//! Host tool availability checks.

use crate::config::{BuildConfig, OutputFormat};
use crate::process;

use super::types::CheckResult;

/// Tools every build needs, with the package that provides them.
pub const DISK_TOOLS: &[(&str, &str)] = &[
    ("losetup", "util-linux"),
    ("partx", "util-linux"),
    ("sfdisk", "util-linux"),
    ("wipefs", "util-linux"),
    ("blkid", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("chroot", "coreutils"),
    ("mkfs.vfat", "dosfstools"),
    ("mkfs.ext4", "e2fsprogs"),
    ("e2fsck", "e2fsprogs"),
    ("resize2fs", "e2fsprogs"),
    ("dumpe2fs", "e2fsprogs"),
];

/// Tools needed only to fetch a payload.
pub const PAYLOAD_TOOLS: &[(&str, &str)] = &[("curl", "curl"), ("tar", "tar")];

/// `tool (install: package)` lines for every tool not found in PATH.
pub fn missing_tools(tools: &[(&str, &str)]) -> Vec<String> {
    tools
        .iter()
        .filter(|(tool, _)| !process::exists(tool))
        .map(|(tool, package)| format!("  {} (install: {})", tool, package))
        .collect()
}

/// Check host tools are installed.
pub fn check_host_tools(config: &BuildConfig) -> Vec<CheckResult> {
    let mut results = Vec::new();

    for (tool, package) in DISK_TOOLS {
        results.push(check_tool_exists(tool, package, "Required for image assembly", true));
    }

    if config.payload.is_some() {
        for (tool, package) in PAYLOAD_TOOLS {
            results.push(check_tool_exists(tool, package, "Required to fetch the payload", true));
        }
    }

    // Conversion failures never invalidate the raw image, so this only warns.
    if config.output_format != OutputFormat::Raw {
        results.push(check_tool_exists(
            "qemu-img",
            "qemu-utils",
            "Required for qcow2/vmdk conversion",
            false,
        ));
    }

    results
}

fn check_tool_exists(tool: &str, package: &str, purpose: &str, required: bool) -> CheckResult {
    match which::which(tool) {
        Ok(path) => CheckResult::pass_with(tool, &path.to_string_lossy()),
        Err(_) => {
            let msg = format!("Not found. Install '{}' package. {}", package, purpose);
            if required {
                CheckResult::fail(tool, &msg)
            } else {
                CheckResult::warn(tool, &msg)
            }
        }
    }
}
