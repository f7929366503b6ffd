//! Show command - displays information.

use anyhow::Result;

use minimage::config::BuildConfig;
use minimage::disk::{PartitionTable, MIB};
use minimage::phases::Phase;
use minimage::state::BuildState;

/// Show target for the show command.
pub enum ShowTarget {
    /// Show resolved configuration
    Config,
    /// Show the phases and their postconditions
    Phases,
    /// Show the initial partition layout
    Layout,
    /// Show progress of the last build
    Status,
}

/// Execute the show command.
pub fn cmd_show(target: ShowTarget, config: &BuildConfig) -> Result<()> {
    match target {
        ShowTarget::Config => config.print(),
        ShowTarget::Phases => {
            for phase in Phase::ALL {
                let note = if phase.is_idempotent() { "" } else { "  (not re-runnable)" };
                println!("  {:<22} {}{}", phase.to_string(), phase.postcondition(), note);
            }
        }
        ShowTarget::Layout => {
            let table = PartitionTable::initial(config.image_size_mb, config.esp_size_mb)?;
            println!("{} MiB image:", config.image_size_mb);
            for part in &table.partitions {
                println!(
                    "  p{}  {:>10}..{:<10}  {:>8.1} MiB  {}",
                    part.index,
                    part.start_sector,
                    part.end_sector,
                    part.size_bytes() as f64 / MIB as f64,
                    part.name.as_deref().unwrap_or("")
                );
            }
        }
        ShowTarget::Status => match BuildState::load(&config.paths.state_file())? {
            Some(state) => {
                println!("Image:  {}", state.image.display());
                println!("Build:  {} {}", state.base_system, state.version);
                match state.last_completed {
                    Some(phase) => {
                        println!("Last completed phase: {}", phase);
                        if phase != Phase::Report {
                            println!("Resume with: --resume {}", state.suggested_resume());
                        }
                    }
                    None => println!("No phase completed yet."),
                }
            }
            None => println!("No build state in {}", config.paths.work_dir.display()),
        },
    }
    Ok(())
}
