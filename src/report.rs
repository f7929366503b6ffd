//! Build report, written as JSON next to the image.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{BaseSystem, BuildConfig, OutputFormat};
use crate::disk::{Partition, MIB};
use crate::phases::Phase;
use crate::shrink::ShrinkSummary;
use crate::timing::format_duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Completed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub image: PathBuf,
    pub base_system: BaseSystem,
    pub version: String,
    pub with_docker: bool,
    pub output_format: OutputFormat,
    pub payload: Option<String>,
    pub image_bytes: u64,
    pub partitions: Vec<Partition>,
    pub resumed_from: u8,
    pub phases: Vec<PhaseRecord>,
    /// Absent when the build resumed at the report phase.
    pub shrink: Option<ShrinkSummary>,
}

impl BuildReport {
    pub fn new(
        config: &BuildConfig,
        image_bytes: u64,
        partitions: Vec<Partition>,
        resumed_from: u8,
        phases: Vec<PhaseRecord>,
        shrink: Option<ShrinkSummary>,
    ) -> Self {
        Self {
            image: config.image_path(),
            base_system: config.base_system,
            version: config.version.clone(),
            with_docker: config.with_docker,
            output_format: config.output_format,
            payload: config.payload.as_ref().map(|p| p.name.clone()),
            image_bytes,
            partitions,
            resumed_from,
            phases,
            shrink,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn print(&self) {
        println!("\n=== Build Complete ===\n");
        println!("  Image:   {}", self.image.display());
        println!(
            "  Size:    {:.1} MiB ({} bytes)",
            self.image_bytes as f64 / MIB as f64,
            self.image_bytes
        );
        println!("  System:  {} {}", self.base_system, self.version);
        if self.with_docker {
            println!("  Docker:  yes");
        }
        if let Some(payload) = &self.payload {
            println!("  Payload: {}", payload);
        }

        println!("\n  Partitions:");
        for part in &self.partitions {
            println!(
                "    p{}  {:>10}..{:<10}  {:>8.1} MiB  {}",
                part.index,
                part.start_sector,
                part.end_sector,
                part.size_bytes() as f64 / MIB as f64,
                part.name.as_deref().unwrap_or("")
            );
        }

        if let Some(shrink) = &self.shrink {
            println!(
                "\n  Shrunk from {:.1} MiB to {:.1} MiB",
                shrink.original_bytes as f64 / MIB as f64,
                shrink.final_bytes as f64 / MIB as f64
            );
            println!("  Tree digest: {}", shrink.tree_digest);
            for artifact in &shrink.artifacts {
                println!("  [OK] {} {}", artifact.kind, artifact.path.display());
            }
            for failure in &shrink.transform_failures {
                println!("  [WARN] {}", failure);
            }
        }

        println!("\n  Phases:");
        for record in &self.phases {
            match record.status {
                PhaseStatus::Completed => println!(
                    "    [{}] {}",
                    format_duration(std::time::Duration::from_secs_f64(record.seconds)),
                    record.phase
                ),
                PhaseStatus::Skipped => println!("    [skip] {}", record.phase),
            }
        }
        println!();
    }
}
