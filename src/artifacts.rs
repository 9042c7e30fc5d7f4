//! On-disk JSON artifacts consumed by the UI.
//!
//! Writes go to a temp file in the same directory followed by an atomic
//! rename, so a reader sees either the previous or the next fully written
//! document, never a torn one.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).context("serialize artifact")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json)
        .with_context(|| format!("write artifact temp {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename artifact into place {}", path.display()))?;
    Ok(())
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read(path).with_context(|| format!("read artifact {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("decode artifact {}", path.display()))
}
