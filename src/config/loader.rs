// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{PipelineFile, RawPipelineFile};
use crate::errors::Result;
use crate::types::SystemKind;

/// Load a pipeline file from a given path and return the raw
/// `RawPipelineFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawPipelineFile> {
    let contents = fs::read_to_string(path.as_ref())?;
    parse_str(&contents)
}

pub fn parse_str(contents: &str) -> Result<RawPipelineFile> {
    let raw: RawPipelineFile = toml::from_str(contents)?;
    Ok(raw)
}

/// Load a pipeline file and validate it.
///
/// `system_override` replaces `[config].system` before validation so the
/// per-system requirements are checked against what will actually run.
pub fn load_and_validate(
    path: impl AsRef<Path>,
    system_override: Option<SystemKind>,
) -> Result<PipelineFile> {
    let mut raw = load_from_path(path)?;
    if let Some(system) = system_override {
        raw.config.system = system;
    }
    PipelineFile::try_from(raw)
}

/// Default pipeline file in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Pipeline.toml")
}
