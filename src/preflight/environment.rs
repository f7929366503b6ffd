//! Build environment checks (privileges, loop support, directories).

use std::fs;
use std::path::Path;

use crate::config::BuildConfig;

use super::types::CheckResult;

pub fn check_build_environment(config: &BuildConfig) -> Vec<CheckResult> {
    let mut results = Vec::new();

    // Loop devices, mounts and chroot all need root.
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        results.push(CheckResult::pass("root privileges"));
    } else {
        results.push(CheckResult::fail(
            "root privileges",
            &format!("Running as uid {}. Re-run with sudo.", euid),
        ));
    }

    if std::env::consts::ARCH == "x86_64" {
        results.push(CheckResult::pass("host architecture"));
    } else {
        results.push(CheckResult::fail(
            "host architecture",
            &format!(
                "{} host cannot chroot into an x86_64 image",
                std::env::consts::ARCH
            ),
        ));
    }

    if Path::new("/dev/loop-control").exists() {
        results.push(CheckResult::pass("loop device support"));
    } else {
        results.push(CheckResult::fail(
            "loop device support",
            "/dev/loop-control missing. Load the 'loop' kernel module.",
        ));
    }

    for (label, dir) in [
        ("work dir", &config.paths.work_dir),
        ("cache dir", &config.paths.cache_dir),
        ("output dir", &config.paths.output_dir),
    ] {
        results.push(check_writable(label, dir));
    }

    results
}

/// Create `dir` if needed and prove we can write into it.
pub fn check_writable(label: &str, dir: &Path) -> CheckResult {
    let name = format!("{} writable", label);
    if let Err(e) = fs::create_dir_all(dir) {
        return CheckResult::fail(&name, &format!("Cannot create {}: {}", dir.display(), e));
    }
    let marker = dir.join(".preflight-test");
    match fs::write(&marker, "test") {
        Ok(()) => {
            let _ = fs::remove_file(&marker);
            CheckResult::pass_with(&name, &dir.to_string_lossy())
        }
        Err(e) => CheckResult::fail(&name, &format!("Cannot write to {}: {}", dir.display(), e)),
    }
}
