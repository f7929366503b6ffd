//! Payload download and installation.
//!
//! The payload binary (and an optional tarball of static assets) is
//! downloaded once into the cache directory and reused by later builds.
//! It is installed as `/opt/<name>/<name>`; assets are unpacked next to it.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::backend::Target;
use crate::config::{BuildConfig, PayloadConfig};
use crate::process::Cmd;

/// Cached payload files, ready to install.
#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub binary: PathBuf,
    pub assets: Option<PathBuf>,
}

/// Cache location for `url`: a hash prefix keeps same-named files apart.
pub fn cache_path(cache_dir: &Path, url: &str) -> PathBuf {
    let digest = format!("{:x}", Sha256::digest(url.as_bytes()));
    let file_name = url
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("download");
    cache_dir
        .join("payload")
        .join(format!("{}-{}", &digest[..16], file_name))
}

/// SHA-256 of a file, lower-case hex.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify a file's checksum. A mismatching file is deleted.
pub fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        fs::remove_file(path)?;
        bail!(
            "Checksum mismatch for {}!\n  Expected: {}\n  Got: {}\n\
             The download may be corrupted. Deleted the cached file.",
            path.display(),
            expected,
            actual
        );
    }
    Ok(())
}

/// Download `url` to `dest` unless it is already cached.
pub fn download(url: &str, dest: &Path) -> Result<()> {
    if dest.is_file() {
        info!("using cached {}", dest.display());
        return Ok(());
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let partial = dest.with_extension("part");
    info!("downloading {}", url);
    Cmd::new("curl")
        .args(["-fL", "--retry", "3", "--progress-bar", "-o"])
        .arg_path(&partial)
        .arg(url)
        .error_msg(format!("Failed to download {}", url))
        .run_interactive()?;
    fs::rename(&partial, dest)
        .with_context(|| format!("Failed to move download into {}", dest.display()))?;
    Ok(())
}

/// Download the payload binary and assets into the cache.
pub fn fetch(config: &BuildConfig, payload: &PayloadConfig) -> Result<FetchedPayload> {
    let binary = cache_path(&config.paths.cache_dir, &payload.url);
    download(&payload.url, &binary)?;
    if let Some(expected) = &payload.sha256 {
        verify_checksum(&binary, expected)?;
    }

    let assets = match &payload.assets_url {
        Some(url) => {
            let path = cache_path(&config.paths.cache_dir, url);
            download(url, &path)?;
            Some(path)
        }
        None => None,
    };

    Ok(FetchedPayload { binary, assets })
}

/// Install fetched files under `/opt/<name>` in the target.
pub fn install(target: &Target, payload: &PayloadConfig, fetched: &FetchedPayload) -> Result<()> {
    let dir = format!("opt/{}", payload.name);
    let dest = target.create_dir(&dir)?;

    let binary = dest.join(&payload.name);
    fs::copy(&fetched.binary, &binary).with_context(|| {
        format!("Failed to copy {} to {}", fetched.binary.display(), binary.display())
    })?;
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755))?;
    }
    info!("installed payload /{}/{}", dir, payload.name);

    if let Some(assets) = &fetched.assets {
        Cmd::new("tar")
            .arg("-xf")
            .arg_path(assets)
            .arg("-C")
            .arg_path(&dest)
            .error_msg("Failed to extract payload assets")
            .run()?;
        info!("extracted assets into /{}", dir);
    }
    Ok(())
}
