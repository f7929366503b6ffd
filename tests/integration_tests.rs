//! Integration tests across config, orchestrator, state and disk tools.
//!
//! Nothing here needs root. Tests that drive sfdisk on a plain image file
//! return early when it is not installed.

mod helpers;

use helpers::{have_tool, TestEnv};
use minimage::disk::{self, PartitionTable, MIB};
use minimage::phases::Phase;
use minimage::session::BuildSession;
use minimage::shrink::{self, BootCode, BOOT_CODE_LEN};
use minimage::state::BuildState;
use minimage::tools::{sfdisk, FilesystemInfo};
use minimage::{orchestrator, BaseSystem, BuildConfig, BuildError, ResumePoint};
use serial_test::serial;
use std::fs;
use std::io::Write;

#[test]
fn test_resume_at_five_without_image_fails_before_mutation() {
    let env = TestEnv::new();
    let config = env.config(BaseSystem::Debian);

    let err = orchestrator::build(&config, ResumePoint::new(5).unwrap()).unwrap_err();

    assert!(matches!(err.root_cause(), BuildError::ResourceAcquisition(_)));
    assert!(matches!(
        err,
        BuildError::Phase {
            phase: Phase::InstallPayload,
            ..
        }
    ));
    assert_eq!(err.exit_code(), 1);
    assert!(!config.image_path().exists());
    assert!(!config.paths.state_file().exists());
    assert!(!config.paths.mount_dir().exists());
}

#[test]
fn test_resume_past_report_is_configuration_error() {
    let err = ResumePoint::new(9).unwrap_err();
    assert!(matches!(err, BuildError::Configuration(_)));
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn test_reattach_window() {
    for n in 0..=8u8 {
        let resume = ResumePoint::new(n).unwrap();
        assert_eq!(resume.needs_reattach(), (3..=7).contains(&n), "resume {n}");
    }
}

#[test]
fn test_release_twice_is_harmless() {
    let env = TestEnv::new();
    let config = env.config(BaseSystem::Alpine);
    let mut session = BuildSession::new(&config);

    assert!(session.attach().is_err());
    session.release().unwrap();
    session.release().unwrap();
    assert!(!session.is_attached());
}

#[test]
fn test_state_records_resume_point() {
    let env = TestEnv::new();
    let config = env.config(BaseSystem::Debian);
    let path = config.paths.state_file();

    let mut state = BuildState::for_config(&config);
    for phase in [Phase::CreateImage, Phase::Bootstrap, Phase::Configure] {
        state.mark_completed(phase);
        state.save(&path).unwrap();
    }

    let loaded = BuildState::load(&path).unwrap().unwrap();
    assert_eq!(loaded.last_completed, Some(Phase::Configure));
    assert_eq!(loaded.suggested_resume(), 5);
    assert_eq!(loaded.image, config.image_path());
}

#[test]
#[serial]
fn test_env_layering_and_validation() {
    let env = TestEnv::new();
    std::env::set_var("MINIMAGE_BASE", "alpine");
    std::env::set_var("MINIMAGE_DOCKER", "true");
    std::env::set_var("MINIMAGE_SIZE_MB", "2048");

    let config = BuildConfig::from_env(&env.base_dir);

    std::env::remove_var("MINIMAGE_BASE");
    std::env::remove_var("MINIMAGE_DOCKER");
    std::env::remove_var("MINIMAGE_SIZE_MB");

    let config = config.unwrap();
    assert_eq!(config.base_system, BaseSystem::Alpine);
    assert_eq!(config.version, "v3.20");
    assert!(config.with_docker);
    assert_eq!(config.image_size_mb, 2048);
    config.validate().unwrap();
    assert!(config
        .image_path()
        .ends_with("output/minimage-alpine-v3.20-docker.img"));
}

#[test]
fn test_image_and_partition_table_on_plain_file() {
    if !have_tool("sfdisk") || !have_tool("wipefs") {
        return;
    }
    let env = TestEnv::new();
    let image = env.base_dir.join("disk.img");

    let len = disk::create_image(&image, 1024).unwrap();
    assert_eq!(len, 1024 * MIB);

    let layout = PartitionTable::initial(1024, 64).unwrap();
    let live = disk::partition(&image, &layout).unwrap();
    assert_eq!(live.partitions.len(), 3);
    for (planned, written) in layout.partitions.iter().zip(&live.partitions) {
        assert_eq!(planned.start_sector, written.start_sector);
        assert_eq!(planned.end_sector, written.end_sector);
    }

    // Stand-in for GRUB's stage 1.
    let mut head = [0u8; BOOT_CODE_LEN];
    for (i, byte) in head.iter_mut().enumerate() {
        *byte = 0xEB ^ (i as u8);
    }
    let mut file = fs::OpenOptions::new().write(true).open(&image).unwrap();
    file.write_all(&head).unwrap();
    drop(file);
    let boot_code = BootCode::capture(&image).unwrap();

    let filesystem = FilesystemInfo {
        uuid: "3e6be9de-8139-4b3a-9106-a43f08d823a6".into(),
        block_count: 150 * MIB / 4096,
        block_size: 4096,
        free_blocks: None,
    };
    let plan = shrink::repartition(&image, &filesystem, &boot_code).unwrap();

    let shrunk = sfdisk::read_table(&image).unwrap();
    shrunk.validate().unwrap();
    assert_eq!(shrunk.partitions[..2], live.partitions[..2]);
    assert_eq!(shrunk.root().start_sector, live.root().start_sector);
    assert_eq!(shrunk.root().end_sector, plan.new_root_end);
    assert_eq!(shrunk.root().uuid, live.root().uuid);
    assert!(live.disk_guid.is_some());
    assert_eq!(
        shrunk.disk_guid.as_deref().map(str::to_ascii_uppercase),
        live.disk_guid.as_deref().map(str::to_ascii_uppercase)
    );

    let image_len = fs::metadata(&image).unwrap().len();
    assert_eq!(image_len, (plan.new_root_end + 1 + 2048) * 512);
    assert!(image_len < 400 * MIB);
    assert_eq!(&fs::read(&image).unwrap()[..BOOT_CODE_LEN], &head[..]);
    assert!(!shrink::invalid_path(&image).exists());
}
