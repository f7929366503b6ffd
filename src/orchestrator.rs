//! Phase orchestration.
//!
//! Runs phases 1..=8 in order from a resume point. Every failure is labelled
//! with its phase, triggers exactly one cleanup pass and then propagates.

use anyhow::anyhow;
use std::fs;
use tracing::{error, info, warn};

use crate::backend::{self, Backend, Operation};
use crate::config::BuildConfig;
use crate::disk::{self, PartitionRole, PartitionTable};
use crate::error::{BuildError, BuildResult};
use crate::interrupt;
use crate::payload;
use crate::phases::{Phase, ResumePoint};
use crate::preflight;
use crate::report::{BuildReport, PhaseRecord, PhaseStatus};
use crate::session::BuildSession;
use crate::shrink::{self, ShrinkSummary};
use crate::state::BuildState;
use crate::timing::Timer;
use crate::tools::sfdisk;

/// Build an image, starting at `resume`.
pub fn build(config: &BuildConfig, resume: ResumePoint) -> BuildResult<BuildReport> {
    config.validate()?;
    interrupt::install();

    let backend = backend::for_base_system(config.base_system);
    let state = initial_state(config, resume);

    let mut run = BuildRun {
        config,
        backend: backend.as_ref(),
        session: BuildSession::new(config),
        state,
        records: Vec::new(),
        shrink: None,
    };

    match run.execute(resume) {
        Ok(report) => Ok(report),
        Err(err) => {
            run.fail(&err);
            Err(err)
        }
    }
}

/// State to resume from, or a fresh record.
fn initial_state(config: &BuildConfig, resume: ResumePoint) -> BuildState {
    if !resume.is_resume() {
        return BuildState::for_config(config);
    }
    match BuildState::load(&config.paths.state_file()) {
        Ok(Some(state)) => {
            for diff in state.mismatches(config) {
                warn!("resuming a different build: {}", diff);
            }
            if let Some(last) = state.last_completed {
                if last.number() + 1 < resume.value() {
                    warn!(
                        "last completed phase was {}, resuming at {} skips work",
                        last,
                        resume.value()
                    );
                }
            }
            BuildState {
                base_system: config.base_system,
                version: config.version.clone(),
                with_docker: config.with_docker,
                ..state
            }
        }
        Ok(None) => BuildState::for_config(config),
        Err(e) => {
            warn!("ignoring unreadable build state: {:#}", e);
            BuildState::for_config(config)
        }
    }
}

struct BuildRun<'a> {
    config: &'a BuildConfig,
    backend: &'a dyn Backend,
    session: BuildSession<'a>,
    state: BuildState,
    records: Vec<PhaseRecord>,
    shrink: Option<ShrinkSummary>,
}

impl BuildRun<'_> {
    fn execute(&mut self, resume: ResumePoint) -> BuildResult<BuildReport> {
        println!(
            "=== minimage: {} {}{} ===\n",
            self.config.base_system,
            self.config.version,
            if self.config.with_docker { " + docker" } else { "" }
        );
        if resume.is_resume() {
            println!("Resuming at phase {}\n", resume.first_phase());
        }

        for phase in Phase::ALL {
            if !resume.runs(phase) {
                self.records.push(PhaseRecord {
                    phase,
                    status: PhaseStatus::Skipped,
                    seconds: 0.0,
                });
                continue;
            }

            // The first phase after a skipped range binds the existing image.
            if phase == resume.first_phase() && resume.needs_reattach() {
                self.reattach().map_err(|e| self.label(e, phase))?;
            }

            if phase == Phase::Report {
                return self.report(resume).map_err(|e| self.label(e, phase));
            }

            println!("--- Phase {} ---", phase);
            let timer = Timer::start(phase.name());
            self.run_phase(phase).map_err(|e| self.label(e, phase))?;
            let elapsed = timer.finish();

            self.records.push(PhaseRecord {
                phase,
                status: PhaseStatus::Completed,
                seconds: elapsed.as_secs_f64(),
            });
            self.state.mark_completed(phase);
            if phase != Phase::Preflight {
                if let Err(e) = self.state.save(&self.config.paths.state_file()) {
                    warn!("could not record progress: {:#}", e);
                }
            }
        }

        // Phase::ALL ends with Report, which returns above.
        Err(BuildError::Configuration("no phases to run".into()))
    }

    /// Label `err` with its phase. An interrupt wins over whatever failure it
    /// caused.
    fn label(&self, err: BuildError, phase: Phase) -> BuildError {
        if interrupt::is_interrupted() && !err.is_interrupted() {
            warn!("{}", err);
            return BuildError::Interrupted.in_phase(phase);
        }
        err.in_phase(phase)
    }

    /// Bind the existing image for a resumed build. Host tools are checked
    /// first since preflight was skipped.
    fn reattach(&mut self) -> BuildResult<()> {
        self.session.require_image()?;
        self.backend.check_dependencies()?;
        info!("reattaching {}", self.session.image().display());
        self.session.attach()?;
        self.session.identify()?;
        self.session.mount_image()
    }

    fn run_phase(&mut self, phase: Phase) -> BuildResult<()> {
        interrupt::check()?;
        match phase {
            Phase::Preflight => preflight::run_preflight_or_fail(self.config, self.backend),
            Phase::CreateImage => self.create_image(),
            Phase::Bootstrap => {
                let target = self.session.target()?;
                backend::run(self.backend, Operation::Bootstrap, &target)
            }
            Phase::Configure => {
                self.session.mount_pseudo()?;
                let target = self.session.target()?;
                backend::run(self.backend, Operation::Configure, &target)
            }
            Phase::InstallPayload => self.install_payload(),
            Phase::InstallDocker => {
                if !self.config.with_docker {
                    println!("  docker not requested, nothing to do");
                    return Ok(());
                }
                self.session.mount_pseudo()?;
                let target = self.session.target()?;
                backend::run(self.backend, Operation::InstallDocker, &target)
            }
            Phase::Finalize => {
                self.shrink = Some(shrink::finalize(&mut self.session, self.backend)?);
                Ok(())
            }
            Phase::Report => Ok(()),
        }
    }

    fn create_image(&mut self) -> BuildResult<()> {
        let image = self.session.image().to_path_buf();
        let layout = PartitionTable::initial(self.config.image_size_mb, self.config.esp_size_mb)
            .map_err(|e| BuildError::Configuration(format!("{:#}", e)))?;

        disk::create_image(&image, self.config.image_size_mb).map_err(BuildError::resource)?;
        disk::partition(&image, &layout).map_err(BuildError::resource)?;

        self.session.attach()?;
        let esp = self.session_partition(&layout, PartitionRole::System)?;
        let root = self.session_partition(&layout, PartitionRole::Root)?;
        disk::format(&esp, &root).map_err(BuildError::resource)?;

        self.session.identify()?;
        self.session.mount_image()
    }

    fn session_partition(
        &self,
        layout: &PartitionTable,
        role: PartitionRole,
    ) -> BuildResult<std::path::PathBuf> {
        let device = self
            .session
            .loop_device()
            .ok_or_else(|| BuildError::resource(anyhow!("image is not attached")))?;
        Ok(crate::session::partition_node(
            device,
            layout.partition(role).index,
        ))
    }

    fn install_payload(&mut self) -> BuildResult<()> {
        self.session.mount_pseudo()?;
        let target = self.session.target()?;

        if let Some(payload) = &self.config.payload {
            let map = |error| BuildError::BackendOperation {
                backend: self.backend.name(),
                operation: "install_payload",
                error,
            };
            let fetched = payload::fetch(self.config, payload).map_err(map)?;
            payload::install(&target, payload, &fetched).map_err(map)?;
        } else {
            println!("  no payload configured");
        }

        backend::run(self.backend, Operation::InstallServices, &target)
    }

    fn report(&mut self, resume: ResumePoint) -> BuildResult<BuildReport> {
        let timer = Timer::start(Phase::Report.name());

        // Resuming straight at the report never attached anything.
        self.session.release()?;
        let image = self.session.image();
        let image_bytes = fs::metadata(image)
            .map_err(|e| {
                BuildError::resource(anyhow!("cannot read image {}: {}", image.display(), e))
            })?
            .len();
        let table = sfdisk::read_table(image).map_err(BuildError::resource)?;

        let mut records = std::mem::take(&mut self.records);
        records.push(PhaseRecord {
            phase: Phase::Report,
            status: PhaseStatus::Completed,
            seconds: timer.finish().as_secs_f64(),
        });

        let report = BuildReport::new(
            self.config,
            image_bytes,
            table.partitions,
            resume.value(),
            records,
            self.shrink.take(),
        );
        report
            .write(&self.config.report_path())
            .map_err(BuildError::resource)?;

        self.state.mark_completed(Phase::Report);
        if let Err(e) = self.state.save(&self.config.paths.state_file()) {
            warn!("could not record progress: {:#}", e);
        }
        Ok(report)
    }

    /// The single cleanup pass after a failure.
    fn fail(&mut self, err: &BuildError) {
        if let Err(e) = self.session.release() {
            error!("cleanup after failure was incomplete: {}", e);
        }

        if let BuildError::Phase {
            phase: Phase::CreateImage,
            ..
        } = err
        {
            let image = self.session.image();
            if image.exists() {
                match fs::remove_file(image) {
                    Ok(()) => info!("removed partial image {}", image.display()),
                    Err(e) => warn!("could not remove partial image {}: {}", image.display(), e),
                }
            }
        }

        let image_gone = !self.session.image().exists();
        match self.state.last_completed {
            Some(last) if !image_gone => eprintln!(
                "\n[FAIL] {}\n       Last completed phase: {}. Resume with --resume {}.",
                err,
                last,
                self.state.suggested_resume()
            ),
            Some(_) => {
                // Nothing left to resume from.
                let state_file = self.config.paths.state_file();
                if let Err(e) = fs::remove_file(&state_file) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("could not remove {}: {}", state_file.display(), e);
                    }
                }
                eprintln!(
                    "\n[FAIL] {}\n       The image was discarded. Rebuild from phase 1 without --resume.",
                    err
                );
            }
            None => eprintln!("\n[FAIL] {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Target;
    use crate::config::BaseSystem;
    use tempfile::TempDir;

    #[test]
    fn test_invalid_config_fails_before_anything() {
        let temp = TempDir::new().unwrap();
        let mut config = BuildConfig::new(BaseSystem::Debian, temp.path());
        config.image_size_mb = 16;

        let err = build(&config, ResumePoint::fresh()).unwrap_err();
        assert!(matches!(err, BuildError::Configuration(_)));
        assert!(!config.paths.work_dir.exists());
    }

    #[test]
    fn test_resume_without_image_fails_to_acquire() {
        let temp = TempDir::new().unwrap();
        let config = BuildConfig::new(BaseSystem::Alpine, temp.path());

        let err = build(&config, ResumePoint::new(5).unwrap()).unwrap_err();
        assert!(
            matches!(err.root_cause(), BuildError::ResourceAcquisition(_)),
            "{err}"
        );
        assert!(err.to_string().starts_with("phase 5 (install-payload) failed"));
        // Nothing was created.
        assert!(!config.paths.work_dir.exists());
        assert!(!config.image_path().exists());
    }

    struct MissingTools;

    impl Backend for MissingTools {
        fn name(&self) -> &'static str {
            "missing-tools"
        }
        fn check_dependencies(&self) -> BuildResult<()> {
            Err(BuildError::DependencyMissing {
                context: "test backend".to_string(),
                missing: vec!["  debootstrap (install: debootstrap)".to_string()],
            })
        }
        fn bootstrap(&self, _: &Target) -> anyhow::Result<()> {
            unreachable!("bootstrap after failed dependency check")
        }
        fn configure(&self, _: &Target) -> anyhow::Result<()> {
            unreachable!("configure after failed dependency check")
        }
        fn install_services(&self, _: &Target) -> anyhow::Result<()> {
            unreachable!("install_services after failed dependency check")
        }
        fn install_docker(&self, _: &Target) -> anyhow::Result<()> {
            unreachable!("install_docker after failed dependency check")
        }
        fn cleanup(&self, _: &Target) -> anyhow::Result<()> {
            unreachable!("cleanup after failed dependency check")
        }
    }

    #[test]
    fn test_resume_checks_tools_before_reattach() {
        let temp = TempDir::new().unwrap();
        let config = BuildConfig::new(BaseSystem::Debian, temp.path());
        let image = config.image_path();
        fs::create_dir_all(image.parent().unwrap()).unwrap();
        fs::write(&image, vec![0u8; 4096]).unwrap();

        let backend = MissingTools;
        let mut run = BuildRun {
            config: &config,
            backend: &backend,
            session: BuildSession::new(&config),
            state: BuildState::for_config(&config),
            records: Vec::new(),
            shrink: None,
        };
        let err = run.execute(ResumePoint::new(5).unwrap()).unwrap_err();

        assert!(matches!(err.root_cause(), BuildError::DependencyMissing { .. }));
        assert_eq!(err.exit_code(), 3);
        assert!(!run.session.is_attached());
        assert_eq!(fs::metadata(&image).unwrap().len(), 4096);
    }

    #[test]
    fn test_report_only_resume_needs_image() {
        let temp = TempDir::new().unwrap();
        let config = BuildConfig::new(BaseSystem::Debian, temp.path());

        let err = build(&config, ResumePoint::new(8).unwrap()).unwrap_err();
        assert!(matches!(err.root_cause(), BuildError::ResourceAcquisition(_)));
        assert!(!config.report_path().exists());
    }
}
