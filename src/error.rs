//! Error taxonomy for image builds.
//!
//! Module internals work with `anyhow::Result`; every component boundary
//! maps its failure into one of these categories so the orchestrator can
//! decide whether cleanup is needed and how to label the diagnostic.

use thiserror::Error;

use crate::phases::Phase;

/// Result alias used at component boundaries.
pub type BuildResult<T> = std::result::Result<T, BuildError>;

#[derive(Debug, Error)]
pub enum BuildError {
    /// Invalid inputs, caught before any mutation.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Required host tools are absent.
    #[error("missing host tools for {context}:\n{}", .missing.join("\n"))]
    DependencyMissing {
        context: String,
        missing: Vec<String>,
    },

    /// Loop binding or mount failure.
    #[error("resource acquisition failed: {0:#}")]
    ResourceAcquisition(anyhow::Error),

    #[error("{backend} backend: {operation} failed: {error:#}")]
    BackendOperation {
        backend: &'static str,
        operation: &'static str,
        error: anyhow::Error,
    },

    /// Consistency check, resize or repartition failure.
    #[error("shrink failed: {0:#}")]
    ShrinkIntegrity(anyhow::Error),

    /// Format conversion or compression failure. Never invalidates the raw image.
    #[error("output transform failed: {0:#}")]
    OutputTransform(anyhow::Error),

    #[error("phase {} ({}) failed: {source}", .phase.number(), .phase.name())]
    Phase {
        phase: Phase,
        #[source]
        source: Box<BuildError>,
    },

    #[error("build interrupted by signal")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    pub fn resource(error: impl Into<anyhow::Error>) -> Self {
        Self::ResourceAcquisition(error.into())
    }

    pub fn shrink(error: impl Into<anyhow::Error>) -> Self {
        Self::ShrinkIntegrity(error.into())
    }

    /// Label this error with the phase it escaped from.
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            // Already labelled, keep the innermost phase.
            BuildError::Phase { .. } => self,
            other => BuildError::Phase {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// The error with phase labels peeled off.
    pub fn root_cause(&self) -> &BuildError {
        match self {
            BuildError::Phase { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self.root_cause(), BuildError::Interrupted)
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self.root_cause() {
            BuildError::Interrupted => 130,
            BuildError::Configuration(_) => 2,
            BuildError::DependencyMissing { .. } => 3,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_label_in_message() {
        let err = BuildError::BackendOperation {
            backend: "debian",
            operation: "configure",
            error: anyhow::anyhow!("apt-get exited with 100"),
        }
        .in_phase(Phase::Configure);

        let msg = err.to_string();
        assert!(msg.starts_with("phase 4 (configure) failed"), "{msg}");
        assert!(msg.contains("debian backend: configure failed"));
        assert!(msg.contains("apt-get exited with 100"));
    }

    #[test]
    fn test_in_phase_keeps_innermost_label() {
        let err = BuildError::Interrupted
            .in_phase(Phase::Bootstrap)
            .in_phase(Phase::Finalize);
        match err {
            BuildError::Phase { phase, .. } => assert_eq!(phase, Phase::Bootstrap),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(BuildError::Interrupted.in_phase(Phase::Report).exit_code(), 130);
        assert_eq!(BuildError::Configuration("x".into()).exit_code(), 2);
        assert_eq!(
            BuildError::resource(anyhow::anyhow!("no loop")).exit_code(),
            1
        );
    }

    #[test]
    fn test_dependency_missing_lists_tools() {
        let err = BuildError::DependencyMissing {
            context: "alpine".into(),
            missing: vec!["  apk.static (install: apk-tools-static)".into()],
        };
        assert!(err.to_string().contains("apk.static"));
    }
}
