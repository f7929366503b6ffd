//! minimage - minimal bootable disk image builder.
//!
//! Builds a hybrid BIOS/EFI disk image for Debian or Alpine:
//! - Three-partition GPT (BIOS boot, EFI system, ext4 root)
//! - Kernel, GRUB, networking and first-boot root expansion
//! - Optional payload service and Docker
//! - Shrunk to the smallest size that holds its content

mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use minimage::config::{BuildConfig, PayloadConfig};
use minimage::{BaseSystem, BuildError, BuildResult, OutputFormat, ResumePoint};

#[derive(Parser)]
#[command(name = "minimage")]
#[command(about = "Minimal bootable disk image builder")]
#[command(
    after_help = "QUICK START:\n  minimage preflight                 Check host dependencies\n  minimage build --base debian       Build a Debian image\n  minimage build --base alpine --resume 5\n                                     Resume a failed build at phase 5\n  minimage clean                     Remove build state"
)]
struct Cli {
    /// More log output (repeat for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Base directory for work/ and output/ (default: current directory)
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a disk image
    Build {
        #[command(flatten)]
        image: ImageArgs,

        /// Resume at this phase (1-8), reusing the existing image
        #[arg(long, value_name = "N")]
        resume: Option<u8>,
    },

    /// Run preflight checks (verify all dependencies before build)
    Preflight {
        #[command(flatten)]
        image: ImageArgs,

        /// Exit non-zero if any check fails
        #[arg(long)]
        strict: bool,
    },

    /// Show information
    Show {
        #[command(flatten)]
        image: ImageArgs,

        #[command(subcommand)]
        what: ShowTarget,
    },

    /// Remove build state (default: keeps cache and outputs)
    Clean {
        #[command(flatten)]
        image: ImageArgs,

        /// Also remove the download cache and output images
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Show resolved configuration
    Config,
    /// List the build phases
    Phases,
    /// Show the initial partition layout
    Layout,
    /// Show progress of the last build
    Status,
}

/// Flags that override `MINIMAGE_*` settings.
#[derive(Args)]
struct ImageArgs {
    /// Base system: debian or alpine
    #[arg(long)]
    base: Option<String>,

    /// Release to install (e.g. bookworm, v3.20)
    #[arg(long)]
    version: Option<String>,

    /// Install Docker
    #[arg(long)]
    docker: bool,

    /// Output format: raw, qcow2 or vmdk
    #[arg(long)]
    format: Option<String>,

    /// Also write a zstd-compressed copy of the raw image
    #[arg(long)]
    compress: bool,

    /// Initial image size in MiB (before shrinking)
    #[arg(long, value_name = "MB")]
    size_mb: Option<u64>,

    /// EFI system partition size in MiB
    #[arg(long, value_name = "MB")]
    esp_size_mb: Option<u64>,

    #[arg(long)]
    hostname: Option<String>,

    #[arg(long)]
    timezone: Option<String>,

    /// Package mirror URL
    #[arg(long)]
    mirror: Option<String>,

    /// URL of a payload binary to install and run at boot
    #[arg(long)]
    payload_url: Option<String>,

    /// Service name for the payload (default: payload)
    #[arg(long)]
    payload_name: Option<String>,

    /// Expected SHA-256 of the payload binary
    #[arg(long)]
    payload_sha256: Option<String>,

    /// Tarball of static assets extracted next to the payload
    #[arg(long)]
    assets_url: Option<String>,
}

impl ImageArgs {
    /// Layer these flags over a config loaded from the environment.
    fn apply(self, config: &mut BuildConfig) -> BuildResult<()> {
        if let Some(base) = self.base {
            config.set_base_system(base.parse::<BaseSystem>()?);
        }
        if let Some(version) = self.version {
            config.version = version;
        }
        if self.docker {
            config.with_docker = true;
        }
        if let Some(format) = self.format {
            config.output_format = format.parse::<OutputFormat>()?;
        }
        if self.compress {
            config.compress = true;
        }
        if let Some(size) = self.size_mb {
            config.image_size_mb = size;
        }
        if let Some(size) = self.esp_size_mb {
            config.esp_size_mb = size;
        }
        if let Some(hostname) = self.hostname {
            config.hostname = hostname;
        }
        if let Some(timezone) = self.timezone {
            config.timezone = timezone;
        }
        if let Some(mirror) = self.mirror {
            config.mirror = mirror.trim_end_matches('/').to_string();
        }
        if let Some(url) = self.payload_url {
            let previous = config.payload.take();
            config.payload = Some(PayloadConfig {
                name: self
                    .payload_name
                    .clone()
                    .or_else(|| previous.as_ref().map(|p| p.name.clone()))
                    .unwrap_or_else(|| "payload".to_string()),
                url,
                sha256: self.payload_sha256.clone().map(|s| s.to_lowercase()),
                assets_url: self.assets_url.clone(),
            });
        } else if let Some(payload) = config.payload.as_mut() {
            if let Some(name) = self.payload_name {
                payload.name = name;
            }
            if let Some(sha) = self.payload_sha256 {
                payload.sha256 = Some(sha.to_lowercase());
            }
            if let Some(url) = self.assets_url {
                payload.assets_url = Some(url);
            }
        }
        Ok(())
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "minimage=info",
        1 => "minimage=debug",
        _ => "minimage=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(base_dir: &std::path::Path, image: ImageArgs) -> BuildResult<BuildConfig> {
    let mut config = BuildConfig::from_env(base_dir)?;
    image.apply(&mut config)?;
    Ok(config)
}

fn run(cli: Cli) -> Result<()> {
    let base_dir = match cli.base_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };

    match cli.command {
        Commands::Build { image, resume } => {
            let config = load_config(&base_dir, image)?;
            let resume = match resume {
                Some(n) => ResumePoint::new(n)?,
                None => ResumePoint::fresh(),
            };
            commands::cmd_build(&config, resume)?;
        }

        Commands::Preflight { image, strict } => {
            let config = load_config(&base_dir, image)?;
            commands::cmd_preflight(&config, strict)?;
        }

        Commands::Show { image, what } => {
            let config = load_config(&base_dir, image)?;
            let show_target = match what {
                ShowTarget::Config => commands::show::ShowTarget::Config,
                ShowTarget::Phases => commands::show::ShowTarget::Phases,
                ShowTarget::Layout => commands::show::ShowTarget::Layout,
                ShowTarget::Status => commands::show::ShowTarget::Status,
            };
            commands::cmd_show(show_target, &config)?;
        }

        Commands::Clean { image, all } => {
            let config = load_config(&base_dir, image)?;
            commands::cmd_clean(&config, all)?;
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(err) = run(cli) {
        tracing::error!("{:#}", err);
        let code = err
            .downcast_ref::<BuildError>()
            .map_or(1, BuildError::exit_code);
        std::process::exit(code);
    }
    Ok(())
}
