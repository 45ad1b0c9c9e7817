//! Disk image checks performed before the first boot.

use std::fs::File;
use std::io::BufReader;

use camino::Utf8Path;
use color_eyre::Result;
use sha2::{Digest, Sha256};

use crate::error::BootstrapError;

/// Hex-encoded SHA-256 of the file at `path`.
pub(crate) fn sha256_file(path: &Utf8Path) -> Result<String> {
    let f = File::open(path).map_err(|e| BootstrapError::precondition(format!("{path}: {e}")))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut BufReader::new(f), &mut hasher)
        .map_err(|e| BootstrapError::precondition(format!("Reading {path}: {e}")))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Ensure the image exists and, when `expected` is given, matches it.
pub(crate) fn verify(path: &Utf8Path, expected: Option<&str>) -> Result<()> {
    if !path.is_file() {
        return Err(BootstrapError::precondition(format!("{path}: disk image not found")).into());
    }
    let Some(expected) = expected else {
        return Ok(());
    };
    let expected = expected.trim().to_ascii_lowercase();
    let actual = sha256_file(path)?;
    if actual != expected {
        return Err(BootstrapError::precondition(format!(
            "{path}: SHA-256 mismatch (expected {expected}, got {actual})"
        ))
        .into());
    }
    tracing::debug!("Verified {path} sha256:{actual}");
    Ok(())
}
