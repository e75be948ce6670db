//! Error types for fieldmap reconstruction

use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Grid dimensions (nx, ny, nz)
pub type Dims = (usize, usize, usize);

#[derive(Debug, Error)]
pub enum FmapError {
    #[error("failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid NIfTI data: {0}")]
    Nifti(String),

    #[error("data length {len} does not match grid {dims:?}")]
    DataLength { len: usize, dims: Dims },

    #[error("{what}: grid {found:?} does not match {expected:?}")]
    GridMismatch {
        what: String,
        expected: Dims,
        found: Dims,
    },

    #[error("phase range is degenerate (lo = hi = {0})")]
    DegenerateRange(f64),

    #[error("echo time difference must be positive and finite, got {0}")]
    InvalidEchoTime(f64),

    #[error("echo times unavailable: {0}")]
    MissingEchoTime(String),

    #[error("mask is empty")]
    EmptyMask,

    #[error("external tool '{tool}' could not be started: {source}")]
    ToolNotFound {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("external tool '{tool}' failed ({status}): {stderr}")]
    ToolFailed {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("external tool '{tool}' did not produce '{path}'")]
    MissingOutput { tool: String, path: PathBuf },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("failed to parse sidecar '{path}': {source}")]
    Sidecar {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, FmapError>;
