//! Build configuration.
//!
//! Values are layered: `.env` file (loaded by `main` via dotenvy) <
//! process environment (`MINIMAGE_*`) < command-line flags. The resulting
//! [`BuildConfig`] is validated once and never mutated after the build
//! starts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{BuildError, BuildResult};

/// Smallest root partition we are willing to create, in MiB.
pub const MIN_ROOT_MB: u64 = 256;
/// Smallest ESP that still formats as FAT32 with 512-byte sectors.
pub const MIN_ESP_MB: u64 = 64;

pub const DEFAULT_IMAGE_SIZE_MB: u64 = 4096;
pub const DEFAULT_ESP_SIZE_MB: u64 = 64;

/// Base system variant, which also selects the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaseSystem {
    Debian,
    Alpine,
}

impl BaseSystem {
    pub fn as_str(self) -> &'static str {
        match self {
            BaseSystem::Debian => "debian",
            BaseSystem::Alpine => "alpine",
        }
    }

    pub fn default_version(self) -> &'static str {
        match self {
            BaseSystem::Debian => "bookworm",
            BaseSystem::Alpine => "v3.20",
        }
    }

    pub fn default_mirror(self) -> &'static str {
        match self {
            BaseSystem::Debian => "http://deb.debian.org/debian",
            BaseSystem::Alpine => "https://dl-cdn.alpinelinux.org/alpine",
        }
    }
}

impl fmt::Display for BaseSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BaseSystem {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debian" => Ok(BaseSystem::Debian),
            "alpine" => Ok(BaseSystem::Alpine),
            other => Err(BuildError::Configuration(format!(
                "unknown base system '{}' (expected: debian, alpine)",
                other
            ))),
        }
    }
}

/// Container format of the primary output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Raw,
    Qcow2,
    Vmdk,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Raw => "raw",
            OutputFormat::Qcow2 => "qcow2",
            OutputFormat::Vmdk => "vmdk",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Raw => "img",
            OutputFormat::Qcow2 => "qcow2",
            OutputFormat::Vmdk => "vmdk",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "img" => Ok(OutputFormat::Raw),
            "qcow2" => Ok(OutputFormat::Qcow2),
            "vmdk" => Ok(OutputFormat::Vmdk),
            other => Err(BuildError::Configuration(format!(
                "unknown output format '{}' (expected: raw, qcow2, vmdk)",
                other
            ))),
        }
    }
}

/// Application installed into the image and started at boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayloadConfig {
    /// Service and directory name under /opt.
    pub name: String,
    /// URL of the payload binary.
    pub url: String,
    /// Expected SHA-256 of the binary, hex encoded.
    pub sha256: Option<String>,
    /// Optional tarball of static assets, extracted next to the binary.
    pub assets_url: Option<String>,
}

/// Working, cache and output directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildPaths {
    pub work_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl BuildPaths {
    pub fn defaults(base_dir: &Path) -> Self {
        let cache_dir = dirs::cache_dir()
            .map(|d| d.join("minimage"))
            .unwrap_or_else(|| base_dir.join("cache"));
        Self {
            work_dir: base_dir.join("work"),
            cache_dir,
            output_dir: base_dir.join("output"),
        }
    }

    /// Where the root partition is mounted during the build.
    pub fn mount_dir(&self) -> PathBuf {
        self.work_dir.join("mnt")
    }

    pub fn state_file(&self) -> PathBuf {
        self.work_dir.join("build-state.json")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildConfig {
    pub base_system: BaseSystem,
    pub version: String,
    pub with_docker: bool,
    pub output_format: OutputFormat,
    pub compress: bool,
    pub image_size_mb: u64,
    pub esp_size_mb: u64,
    #[serde(skip_serializing)]
    pub root_password: String,
    pub timezone: String,
    pub hostname: String,
    pub mirror: String,
    pub payload: Option<PayloadConfig>,
    pub paths: BuildPaths,
}

impl BuildConfig {
    /// Defaults for a base system, before any overrides.
    pub fn new(base_system: BaseSystem, base_dir: &Path) -> Self {
        Self {
            base_system,
            version: base_system.default_version().to_string(),
            with_docker: false,
            output_format: OutputFormat::Raw,
            compress: false,
            image_size_mb: DEFAULT_IMAGE_SIZE_MB,
            esp_size_mb: DEFAULT_ESP_SIZE_MB,
            root_password: "minimage".to_string(),
            timezone: "UTC".to_string(),
            hostname: "minimage".to_string(),
            mirror: base_system.default_mirror().to_string(),
            payload: None,
            paths: BuildPaths::defaults(base_dir),
        }
    }

    /// Load from the process environment.
    pub fn from_env(base_dir: &Path) -> BuildResult<Self> {
        Self::from_lookup(base_dir, |key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (`MINIMAGE_*` names).
    pub fn from_lookup<F>(base_dir: &Path, lookup: F) -> BuildResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let base_system = match get("MINIMAGE_BASE") {
            Some(v) => v.parse()?,
            None => BaseSystem::Debian,
        };
        let mut config = Self::new(base_system, base_dir);

        if let Some(v) = get("MINIMAGE_VERSION") {
            config.version = v;
        }
        if let Some(v) = get("MINIMAGE_DOCKER") {
            config.with_docker = parse_bool("MINIMAGE_DOCKER", &v)?;
        }
        if let Some(v) = get("MINIMAGE_FORMAT") {
            config.output_format = v.parse()?;
        }
        if let Some(v) = get("MINIMAGE_COMPRESS") {
            config.compress = parse_bool("MINIMAGE_COMPRESS", &v)?;
        }
        if let Some(v) = get("MINIMAGE_SIZE_MB") {
            config.image_size_mb = parse_mb("MINIMAGE_SIZE_MB", &v)?;
        }
        if let Some(v) = get("MINIMAGE_ESP_SIZE_MB") {
            config.esp_size_mb = parse_mb("MINIMAGE_ESP_SIZE_MB", &v)?;
        }
        if let Some(v) = get("MINIMAGE_ROOT_PASSWORD") {
            config.root_password = v;
        }
        if let Some(v) = get("MINIMAGE_TIMEZONE") {
            config.timezone = v;
        }
        if let Some(v) = get("MINIMAGE_HOSTNAME") {
            config.hostname = v;
        }
        if let Some(v) = get("MINIMAGE_MIRROR") {
            config.mirror = v.trim_end_matches('/').to_string();
        }
        if let Some(url) = get("MINIMAGE_PAYLOAD_URL") {
            config.payload = Some(PayloadConfig {
                name: get("MINIMAGE_PAYLOAD_NAME").unwrap_or_else(|| "payload".to_string()),
                url,
                sha256: get("MINIMAGE_PAYLOAD_SHA256").map(|s| s.to_lowercase()),
                assets_url: get("MINIMAGE_ASSETS_URL"),
            });
        }
        if let Some(v) = get("MINIMAGE_WORK_DIR") {
            config.paths.work_dir = resolve(base_dir, &v);
        }
        if let Some(v) = get("MINIMAGE_CACHE_DIR") {
            config.paths.cache_dir = resolve(base_dir, &v);
        }
        if let Some(v) = get("MINIMAGE_OUTPUT_DIR") {
            config.paths.output_dir = resolve(base_dir, &v);
        }

        Ok(config)
    }

    /// Switch base system, resetting version and mirror if they were defaults.
    pub fn set_base_system(&mut self, base: BaseSystem) {
        if self.version == self.base_system.default_version() {
            self.version = base.default_version().to_string();
        }
        if self.mirror == self.base_system.default_mirror() {
            self.mirror = base.default_mirror().to_string();
        }
        self.base_system = base;
    }

    /// Reject anything that would fail halfway through a build.
    pub fn validate(&self) -> BuildResult<()> {
        let invalid = |msg: String| -> BuildResult<()> { Err(BuildError::Configuration(msg)) };

        if self.version.is_empty() || !self.version.chars().all(is_name_char) {
            return invalid(format!("invalid version selector '{}'", self.version));
        }
        if self.esp_size_mb < MIN_ESP_MB {
            return invalid(format!(
                "system partition must be at least {} MiB, got {}",
                MIN_ESP_MB, self.esp_size_mb
            ));
        }
        // 1 MiB before the BIOS boot partition, 1 MiB for it, 1 MiB tail.
        let minimum = self.esp_size_mb + MIN_ROOT_MB + 3;
        if self.image_size_mb < minimum {
            return invalid(format!(
                "image size must be at least {} MiB, got {}",
                minimum, self.image_size_mb
            ));
        }
        if self.root_password.is_empty()
            || self.root_password.contains(['\n', '\r', ':'])
        {
            return invalid("root password must be non-empty and contain no ':' or newlines".into());
        }
        if self.timezone.is_empty()
            || self.timezone.starts_with('/')
            || self.timezone.split('/').any(|part| part == ".." || part.is_empty())
        {
            return invalid(format!("invalid timezone '{}'", self.timezone));
        }
        if !is_valid_hostname(&self.hostname) {
            return invalid(format!("invalid hostname '{}'", self.hostname));
        }
        if !(self.mirror.starts_with("http://") || self.mirror.starts_with("https://")) {
            return invalid(format!("mirror must be an http(s) URL: '{}'", self.mirror));
        }
        if let Some(payload) = &self.payload {
            if payload.name.is_empty() || !payload.name.chars().all(is_name_char) {
                return invalid(format!("invalid payload name '{}'", payload.name));
            }
            if let Some(sha) = &payload.sha256 {
                if sha.len() != 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
                    return invalid("payload sha256 must be 64 hex characters".into());
                }
            }
        }
        Ok(())
    }

    /// Stem shared by the image and its siblings.
    pub fn image_stem(&self) -> String {
        let version: String = self
            .version
            .chars()
            .map(|c| if is_name_char(c) { c } else { '_' })
            .collect();
        let docker = if self.with_docker { "-docker" } else { "" };
        format!("minimage-{}-{}{}", self.base_system, version, docker)
    }

    /// The raw image, which is the build's working copy and primary output.
    pub fn image_path(&self) -> PathBuf {
        self.paths.output_dir.join(format!("{}.img", self.image_stem()))
    }

    pub fn report_path(&self) -> PathBuf {
        self.paths
            .output_dir
            .join(format!("{}.report.json", self.image_stem()))
    }

    /// Print configuration for `minimage show config`.
    pub fn print(&self) {
        println!("Configuration:");
        match serde_json::to_string_pretty(self) {
            Ok(json) => println!("{}", json),
            Err(e) => println!("  (unserializable: {})", e),
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')
}

fn is_valid_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn parse_bool(key: &str, value: &str) -> BuildResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(BuildError::Configuration(format!(
            "{} must be a boolean, got '{}'",
            key, other
        ))),
    }
}

fn parse_mb(key: &str, value: &str) -> BuildResult<u64> {
    value.trim().parse::<u64>().map_err(|_| {
        BuildError::Configuration(format!("{} must be a whole number of MiB, got '{}'", key, value))
    })
}

fn resolve(base_dir: &Path, value: &str) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}
