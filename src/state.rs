//! Progress record kept in the working directory.
//!
//! Written after every completed phase so a failed or interrupted build can
//! tell the operator where to resume.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{BaseSystem, BuildConfig};
use crate::phases::Phase;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildState {
    pub base_system: BaseSystem,
    pub version: String,
    pub with_docker: bool,
    pub image: PathBuf,
    pub last_completed: Option<Phase>,
    /// Seconds since the epoch of the last update.
    pub updated_at: u64,
}

impl BuildState {
    pub fn for_config(config: &BuildConfig) -> Self {
        Self {
            base_system: config.base_system,
            version: config.version.clone(),
            with_docker: config.with_docker,
            image: config.image_path(),
            last_completed: None,
            updated_at: now(),
        }
    }

    /// Load a state file. A missing file is `None`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        let state = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(state))
    }

    /// Write atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    pub fn mark_completed(&mut self, phase: Phase) {
        self.last_completed = Some(phase);
        self.updated_at = now();
    }

    /// Differences between this record and `config` that make a resume
    /// suspicious.
    pub fn mismatches(&self, config: &BuildConfig) -> Vec<String> {
        let mut diffs = Vec::new();
        if self.base_system != config.base_system {
            diffs.push(format!(
                "base system was {}, now {}",
                self.base_system, config.base_system
            ));
        }
        if self.version != config.version {
            diffs.push(format!("version was {}, now {}", self.version, config.version));
        }
        if self.with_docker != config.with_docker {
            diffs.push(format!(
                "docker was {}, now {}",
                self.with_docker, config.with_docker
            ));
        }
        diffs
    }

    /// The phase a resume should start from.
    pub fn suggested_resume(&self) -> u8 {
        self.last_completed.map_or(1, |p| p.number() + 1)
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
