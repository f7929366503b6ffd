//! Base-system backends.
//!
//! A backend populates and configures the mounted root of the image. Both
//! variants work only through a [`Target`], so every file they write lands
//! inside the image.

mod alpine;
mod debian;
pub mod files;
mod system;
pub(crate) mod target;

pub use alpine::Alpine;
pub use debian::Debian;
pub use target::Target;

use anyhow::Result;
use tracing::info;

use crate::config::BaseSystem;
use crate::error::{BuildError, BuildResult};
use crate::interrupt;

pub trait Backend {
    /// Short name used in diagnostics ("debian", "alpine").
    fn name(&self) -> &'static str;

    /// Verify the host has the backend's bootstrap tools.
    fn check_dependencies(&self) -> BuildResult<()>;

    /// Populate the empty root filesystem with a minimal base system.
    fn bootstrap(&self, target: &Target) -> Result<()>;

    /// Install kernel, boot loader, networking, accounts and locale.
    fn configure(&self, target: &Target) -> Result<()>;

    /// Register the first-boot expansion service and the payload service.
    fn install_services(&self, target: &Target) -> Result<()>;

    /// Install and enable the container runtime.
    fn install_docker(&self, target: &Target) -> Result<()>;

    /// Remove caches, docs and other content not needed at runtime.
    fn cleanup(&self, target: &Target) -> Result<()>;
}

/// Pick the backend for a base system.
pub fn for_base_system(base: BaseSystem) -> Box<dyn Backend> {
    match base {
        BaseSystem::Debian => Box::new(Debian),
        BaseSystem::Alpine => Box::new(Alpine),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Bootstrap,
    Configure,
    InstallServices,
    InstallDocker,
    Cleanup,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Operation::Bootstrap => "bootstrap",
            Operation::Configure => "configure",
            Operation::InstallServices => "install_services",
            Operation::InstallDocker => "install_docker",
            Operation::Cleanup => "cleanup",
        }
    }
}

/// Run one backend operation, mapping failures into [`BuildError`].
pub fn run(backend: &dyn Backend, op: Operation, target: &Target) -> BuildResult<()> {
    interrupt::check()?;
    info!("{}: {}", backend.name(), op.name());

    let result = match op {
        Operation::Bootstrap => backend.bootstrap(target),
        Operation::Configure => backend.configure(target),
        Operation::InstallServices => backend.install_services(target),
        Operation::InstallDocker => backend.install_docker(target),
        Operation::Cleanup => backend.cleanup(target),
    };

    result.map_err(|error| {
        if interrupt::is_interrupted() {
            BuildError::Interrupted
        } else {
            BuildError::BackendOperation {
                backend: backend.name(),
                operation: op.name(),
                error,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use anyhow::bail;
    use tempfile::TempDir;

    struct Failing;

    impl Backend for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn check_dependencies(&self) -> BuildResult<()> {
            Ok(())
        }
        fn bootstrap(&self, _: &Target) -> Result<()> {
            Ok(())
        }
        fn configure(&self, _: &Target) -> Result<()> {
            bail!("grub-install exited with 1")
        }
        fn install_services(&self, _: &Target) -> Result<()> {
            Ok(())
        }
        fn install_docker(&self, _: &Target) -> Result<()> {
            Ok(())
        }
        fn cleanup(&self, _: &Target) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_factory_picks_variant() {
        assert_eq!(for_base_system(BaseSystem::Debian).name(), "debian");
        assert_eq!(for_base_system(BaseSystem::Alpine).name(), "alpine");
    }

    #[test]
    fn test_run_names_backend_and_operation() {
        let temp = TempDir::new().unwrap();
        let config = BuildConfig::new(BaseSystem::Debian, temp.path());
        let target = target::tests::target_in(&config, &temp);

        run(&Failing, Operation::Bootstrap, &target).unwrap();
        let err = run(&Failing, Operation::Configure, &target).unwrap_err();
        match err {
            BuildError::BackendOperation { backend, operation, .. } => {
                assert_eq!(backend, "failing");
                assert_eq!(operation, "configure");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
