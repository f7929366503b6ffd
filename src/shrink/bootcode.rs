//! Legacy boot code at the start of the image.
//!
//! GRUB's BIOS stage 1 lives in bytes [0,440) of sector 0. Rewriting the
//! partition table may clobber them, so they are captured first and written
//! back afterwards.

use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const BOOT_CODE_LEN: usize = 440;

#[derive(Clone, PartialEq, Eq)]
pub struct BootCode([u8; BOOT_CODE_LEN]);

impl std::fmt::Debug for BootCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let used = self.0.iter().filter(|b| **b != 0).count();
        write!(f, "BootCode({} non-zero bytes)", used)
    }
}

impl BootCode {
    pub fn capture(image: &Path) -> Result<Self> {
        let mut file =
            File::open(image).with_context(|| format!("Failed to open {}", image.display()))?;
        let mut bytes = [0u8; BOOT_CODE_LEN];
        file.read_exact(&mut bytes)
            .with_context(|| format!("{} is shorter than one sector", image.display()))?;
        Ok(Self(bytes))
    }

    /// Write the captured bytes back to offset 0 without touching the rest.
    pub fn restore(&self, image: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(image)
            .with_context(|| format!("Failed to open {} for writing", image.display()))?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.0)?;
        file.sync_all()?;
        Ok(())
    }

    /// Fail unless the image currently holds exactly these bytes.
    pub fn verify(&self, image: &Path) -> Result<()> {
        let current = Self::capture(image)?;
        if current != *self {
            bail!("boot code in {} differs after repartitioning", image.display());
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn image_with_boot_code(temp: &TempDir) -> std::path::PathBuf {
        let path = temp.path().join("disk.img");
        let mut data = vec![0u8; 4096];
        for (i, byte) in data.iter_mut().take(BOOT_CODE_LEN).enumerate() {
            *byte = (i % 251) as u8 + 1;
        }
        data[510] = 0x55;
        data[511] = 0xAA;
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_capture_restore_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = image_with_boot_code(&temp);
        let code = BootCode::capture(&path).unwrap();
        assert!(!code.is_empty());

        // Simulate a table rewrite wiping sector 0.
        let mut data = fs::read(&path).unwrap();
        data[..512].fill(0);
        fs::write(&path, &data).unwrap();
        assert!(code.verify(&path).is_err());

        code.restore(&path).unwrap();
        code.verify(&path).unwrap();

        let after = fs::read(&path).unwrap();
        assert_eq!(after.len(), 4096);
        // Only [0,440) is restored; the signature stays as the rewrite left it.
        assert_eq!(after[510], 0);
    }

    #[test]
    fn test_capture_short_file_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tiny.img");
        fs::write(&path, [1u8; 100]).unwrap();
        assert!(BootCode::capture(&path).is_err());
    }
}
