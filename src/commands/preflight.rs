//! Preflight command - runs preflight checks.

use minimage::backend;
use minimage::config::BuildConfig;
use minimage::error::BuildResult;
use minimage::preflight;

/// Execute the preflight command.
pub fn cmd_preflight(config: &BuildConfig, strict: bool) -> BuildResult<()> {
    let backend = backend::for_base_system(config.base_system);
    if strict {
        preflight::run_preflight_or_fail(config, backend.as_ref())?;
    } else {
        let report = preflight::run_preflight(config, backend.as_ref());
        report.print();
        if !report.all_passed() {
            println!("Some checks failed. Use --strict to exit non-zero.");
        }
    }
    Ok(())
}
