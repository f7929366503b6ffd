//! blkid adapter for filesystem identifiers.

use anyhow::{bail, Result};
use std::path::Path;

use crate::process::Cmd;

/// Filesystem UUID of `device` (for vfat this is the `XXXX-XXXX` serial).
pub fn filesystem_uuid(device: &Path) -> Result<String> {
    let result = Cmd::new("blkid")
        .args(["-s", "UUID", "-o", "value"])
        .arg_path(device)
        .error_msg(format!("blkid could not probe {}", device.display()))
        .run()?;
    parse_value(result.stdout_trimmed())
}

fn parse_value(value: &str) -> Result<String> {
    let value = value.lines().next().unwrap_or("").trim();
    if value.is_empty() || value.contains(char::is_whitespace) {
        bail!("blkid returned no usable UUID: '{}'", value);
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("ABCD-1234\n").unwrap(), "ABCD-1234");
        assert!(parse_value("").is_err());
    }
}
