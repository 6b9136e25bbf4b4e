use crate::error::{PipelineError, PipelineResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::SystemTime;

pub const UTC_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Outcome of a write that refuses to clobber existing files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Skipped,
}

#[must_use]
pub fn utc_now() -> String {
    Utc::now().format(UTC_FORMAT).to_string()
}

#[must_use]
pub fn format_utc(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).format(UTC_FORMAT).to_string()
}

/// Write `value` as 2-space indented JSON, replacing the whole file.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> PipelineResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Write `value` unless `path` already exists and `force` is off.
pub fn write_json_unless_exists<T: Serialize>(path: &Path, value: &T, force: bool) -> PipelineResult<WriteOutcome> {
    if path.exists() && !force {
        tracing::info!(path = %path.display(), "exists; reusing (force to overwrite)");
        return Ok(WriteOutcome::Skipped);
    }
    write_json(path, value)?;
    tracing::info!(path = %path.display(), "wrote");
    Ok(WriteOutcome::Written)
}

/// Read a JSON document, failing with `MissingInput` when it is absent.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> PipelineResult<T> {
    PipelineError::require(path)?;
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}
