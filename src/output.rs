//! Output transforms applied to the finished raw image.
//!
//! Conversion and compression produce siblings of the raw image. Their
//! failures are reported but never invalidate the raw image itself.

use anyhow::{anyhow, Context};
use serde::Serialize;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{BuildConfig, OutputFormat};
use crate::error::{BuildError, BuildResult};
use crate::process::Cmd;

/// zstd level for `.img.zst` files.
pub const ZSTD_LEVEL: i32 = 19;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub kind: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl Artifact {
    pub fn from_path(kind: &str, path: &Path) -> BuildResult<Self> {
        Ok(Self {
            kind: kind.to_string(),
            path: path.to_path_buf(),
            size_bytes: fs::metadata(path)?.len(),
        })
    }
}

/// Artifacts produced plus transform failures (each an `OutputTransform`).
#[derive(Debug, Default)]
pub struct TransformOutcome {
    pub artifacts: Vec<Artifact>,
    pub failures: Vec<BuildError>,
}

/// `disk.img` + "qcow2" gives `disk.qcow2`.
pub fn sibling_path(raw: &Path, extension: &str) -> PathBuf {
    raw.with_extension(extension)
}

/// Convert the raw image with `qemu-img`. Raw output needs no conversion.
pub fn convert(raw: &Path, format: OutputFormat) -> BuildResult<Option<PathBuf>> {
    if format == OutputFormat::Raw {
        return Ok(None);
    }
    let dest = sibling_path(raw, format.extension());
    let mut cmd = Cmd::new("qemu-img")
        .args(["convert", "-f", "raw", "-O", format.as_str()]);
    if format == OutputFormat::Vmdk {
        cmd = cmd.args(["-o", "subformat=streamOptimized"]);
    }
    cmd.arg_path(raw)
        .arg_path(&dest)
        .error_msg(format!("qemu-img convert to {} failed", format.as_str()))
        .run()
        .map_err(|e| {
            let _ = fs::remove_file(&dest);
            BuildError::OutputTransform(e)
        })?;
    info!("converted to {}", dest.display());
    Ok(Some(dest))
}

/// Compress the raw image to `<name>.img.zst`.
pub fn compress(raw: &Path) -> BuildResult<PathBuf> {
    let mut name = raw.as_os_str().to_os_string();
    name.push(".zst");
    let dest = PathBuf::from(name);

    let result = (|| -> anyhow::Result<()> {
        let input = File::open(raw).with_context(|| format!("Failed to open {}", raw.display()))?;
        let output = File::create(&dest)
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        zstd::stream::copy_encode(BufReader::new(input), output, ZSTD_LEVEL)
            .with_context(|| format!("zstd compression of {} failed", raw.display()))?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&dest);
        return Err(BuildError::OutputTransform(e));
    }
    info!("compressed to {}", dest.display());
    Ok(dest)
}

/// Run every configured transform on `raw`.
pub fn transform(config: &BuildConfig, raw: &Path) -> TransformOutcome {
    let mut outcome = TransformOutcome::default();

    let mut record = |kind: &str, result: BuildResult<Option<PathBuf>>| {
        let artifact = result.and_then(|path| match path {
            Some(path) => Artifact::from_path(kind, &path).map(Some),
            None => Ok(None),
        });
        match artifact {
            Ok(Some(artifact)) => outcome.artifacts.push(artifact),
            Ok(None) => {}
            Err(e) => {
                let e = match e {
                    BuildError::OutputTransform(_) => e,
                    other => BuildError::OutputTransform(anyhow!(other)),
                };
                warn!("{}", e);
                outcome.failures.push(e);
            }
        }
    };

    record(config.output_format.as_str(), convert(raw, config.output_format));
    if config.compress {
        record("zstd", compress(raw).map(Some));
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BaseSystem;
    use tempfile::TempDir;

    #[test]
    fn test_sibling_paths() {
        let raw = Path::new("/out/minimage-debian-bookworm.img");
        assert_eq!(
            sibling_path(raw, "qcow2"),
            PathBuf::from("/out/minimage-debian-bookworm.qcow2")
        );
    }

    #[test]
    fn test_raw_needs_no_conversion() {
        assert_eq!(convert(Path::new("/nonexistent.img"), OutputFormat::Raw).unwrap(), None);
    }

    #[test]
    fn test_compress_roundtrip() {
        let temp = TempDir::new().unwrap();
        let raw = temp.path().join("disk.img");
        let mut data = vec![0u8; 1 << 20];
        data[..440].fill(0xEB);
        fs::write(&raw, &data).unwrap();

        let dest = compress(&raw).unwrap();
        assert_eq!(dest, temp.path().join("disk.img.zst"));
        assert!(fs::metadata(&dest).unwrap().len() < data.len() as u64);

        let decoded = zstd::decode_all(File::open(&dest).unwrap()).unwrap();
        assert_eq!(decoded, data);
        // The raw image is left in place.
        assert!(raw.exists());
    }

    #[test]
    fn test_failed_transform_is_reported_not_raised() {
        let temp = TempDir::new().unwrap();
        let mut config = BuildConfig::new(BaseSystem::Alpine, temp.path());
        config.compress = true;
        let raw = temp.path().join("missing.img");

        let outcome = transform(&config, &raw);
        assert!(outcome.artifacts.is_empty());
        assert_eq!(outcome.failures.len(), 1);
        assert!(matches!(outcome.failures[0], BuildError::OutputTransform(_)));
        assert!(!temp.path().join("missing.img.zst").exists());
    }
}
