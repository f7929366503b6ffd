//! Build command - builds a disk image.

use std::time::Instant;

use minimage::config::BuildConfig;
use minimage::error::BuildResult;
use minimage::orchestrator;
use minimage::phases::ResumePoint;
use minimage::timing::format_duration;

/// Execute the build command.
pub fn cmd_build(config: &BuildConfig, resume: ResumePoint) -> BuildResult<()> {
    let start = Instant::now();
    let report = orchestrator::build(config, resume)?;
    report.print();
    println!("Report: {}", config.report_path().display());
    println!("Total time: {}", format_duration(start.elapsed()));
    Ok(())
}
