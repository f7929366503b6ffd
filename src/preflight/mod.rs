//! Preflight checks.
//!
//! Validates host tools, privileges and directories before anything is
//! written. Run with `minimage preflight` to check a host is ready; phase 1
//! of every build runs the same checks and stops on any failure.

mod environment;
mod host_tools;
mod types;

pub use host_tools::{missing_tools, DISK_TOOLS, PAYLOAD_TOOLS};
pub use types::{CheckResult, CheckStatus, PreflightReport};

use crate::backend::Backend;
use crate::config::BuildConfig;
use crate::error::{BuildError, BuildResult};

/// Run all preflight checks.
pub fn run_preflight(config: &BuildConfig, backend: &dyn Backend) -> PreflightReport {
    let mut checks = Vec::new();

    println!("Running preflight checks...\n");

    println!("Checking host tools...");
    checks.extend(host_tools::check_host_tools(config));

    println!("Checking {} backend tools...", backend.name());
    let name = format!("{} backend tools", backend.name());
    match backend.check_dependencies() {
        Ok(()) => checks.push(CheckResult::pass(&name)),
        Err(BuildError::DependencyMissing { missing, .. }) => {
            let missing: Vec<&str> = missing.iter().map(|m| m.trim()).collect();
            checks.push(CheckResult::fail(&name, &missing.join(", ")));
        }
        Err(e) => checks.push(CheckResult::fail(&name, &e.to_string())),
    }

    println!("Checking build environment...");
    checks.extend(environment::check_build_environment(config));

    println!();

    PreflightReport { checks }
}

/// Run preflight and fail with [`BuildError::DependencyMissing`] on any failure.
pub fn run_preflight_or_fail(config: &BuildConfig, backend: &dyn Backend) -> BuildResult<()> {
    let report = run_preflight(config, backend);
    report.print();

    if !report.all_passed() {
        return Err(BuildError::DependencyMissing {
            context: "preflight".to_string(),
            missing: report.failures().map(CheckResult::summary).collect(),
        });
    }

    println!("All preflight checks passed!\n");
    Ok(())
}
