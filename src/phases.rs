//! The eight build phases and the resume point.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BuildError, BuildResult};

/// One ordered stage of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Preflight = 1,
    CreateImage = 2,
    Bootstrap = 3,
    Configure = 4,
    InstallPayload = 5,
    InstallDocker = 6,
    Finalize = 7,
    Report = 8,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Preflight,
        Phase::CreateImage,
        Phase::Bootstrap,
        Phase::Configure,
        Phase::InstallPayload,
        Phase::InstallDocker,
        Phase::Finalize,
        Phase::Report,
    ];

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn from_number(n: u8) -> Option<Phase> {
        Self::ALL.iter().copied().find(|p| p.number() == n)
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Preflight => "preflight",
            Phase::CreateImage => "create-image",
            Phase::Bootstrap => "bootstrap",
            Phase::Configure => "configure",
            Phase::InstallPayload => "install-payload",
            Phase::InstallDocker => "install-docker",
            Phase::Finalize => "finalize",
            Phase::Report => "report",
        }
    }

    /// What must hold on disk once this phase has succeeded.
    ///
    /// Resuming at phase N assumes the postconditions of every phase below N.
    pub fn postcondition(self) -> &'static str {
        match self {
            Phase::Preflight => "host tools and privileges verified; nothing written",
            Phase::CreateImage => {
                "image file exists at full size with a three-entry GPT and formatted ESP and root"
            }
            Phase::Bootstrap => "root partition holds a self-consistent minimal system",
            Phase::Configure => "kernel, boot loader, network, accounts and locale installed",
            Phase::InstallPayload => "payload files and first-boot services registered",
            Phase::InstallDocker => "container runtime installed when requested",
            Phase::Finalize => {
                "image cleaned, shrunk, repartitioned, truncated and optional siblings written"
            }
            Phase::Report => "build report written next to the image",
        }
    }

    /// Whether re-running this phase over its own postcondition is safe.
    ///
    /// Bootstrap expects an empty target and finalize shrinks in place, so
    /// resuming at either after it already succeeded is not supported.
    pub fn is_idempotent(self) -> bool {
        !matches!(self, Phase::Bootstrap | Phase::Finalize | Phase::CreateImage)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.number(), self.name())
    }
}

/// Where a build starts. Zero runs everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResumePoint(u8);

impl ResumePoint {
    pub fn new(n: u8) -> BuildResult<Self> {
        if n > Phase::Report.number() {
            return Err(BuildError::Configuration(format!(
                "resume phase must be between 0 and {}, got {}",
                Phase::Report.number(),
                n
            )));
        }
        Ok(Self(n))
    }

    pub fn fresh() -> Self {
        Self(0)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn is_resume(self) -> bool {
        self.0 > 0
    }

    /// Whether `phase` runs under this resume point.
    pub fn runs(self, phase: Phase) -> bool {
        phase.number() >= self.0
    }

    /// First phase that will run.
    pub fn first_phase(self) -> Phase {
        Phase::from_number(self.0.max(1)).unwrap_or(Phase::Preflight)
    }

    /// Whether the build must bind and mount an existing image instead of
    /// creating a new one.
    pub fn needs_reattach(self) -> bool {
        self.0 > Phase::CreateImage.number() && self.0 < Phase::Report.number()
    }
}
