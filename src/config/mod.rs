// src/config/mod.rs

//! Pipeline file loading and validation.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a pipeline file from disk (`loader.rs`).
//! - Validate ids, dependencies, the task graph and per-system
//!   requirements (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path, parse_str};
pub use model::{
    CloudSection, ClusterSection, ConfigSection, LocalSection, PipelineFile, RawPipelineFile,
    RuntimeSettings, TaskDecl,
};
