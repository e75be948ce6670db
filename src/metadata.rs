//! BIDS JSON sidecar metadata
//!
//! Only the echo timing fields matter for fieldmap reconstruction. A phase
//! image carries `EchoTime`; a phase-difference image carries `EchoTime1` and
//! `EchoTime2`. All times are in seconds.

use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::error::{FmapError, Result};

/// Echo times above this are almost certainly milliseconds, not seconds
const SUSPICIOUS_DELTA_TE: f64 = 0.1;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Sidecar {
    pub echo_time: Option<f64>,
    pub echo_time1: Option<f64>,
    pub echo_time2: Option<f64>,
    pub echo_time_difference: Option<f64>,
}

impl Sidecar {
    pub fn from_json(text: &str, path: &Path) -> Result<Self> {
        serde_json::from_str(text).map_err(|source| FmapError::Sidecar {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| FmapError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text, path)
    }

    /// ΔTE from a single sidecar holding both echoes
    pub fn delta_te(&self) -> Result<f64> {
        if let Some(dte) = self.echo_time_difference {
            return check_delta_te(dte);
        }
        match (self.echo_time1, self.echo_time2) {
            (Some(te1), Some(te2)) => check_delta_te((te2 - te1).abs()),
            _ => Err(FmapError::MissingEchoTime(
                "sidecar has neither EchoTimeDifference nor EchoTime1/EchoTime2".to_string(),
            )),
        }
    }
}

/// Echo times of two per-echo sidecars, in acquisition order as given
pub fn echo_times(first: &Sidecar, second: &Sidecar) -> Result<(f64, f64)> {
    match (first.echo_time, second.echo_time) {
        (Some(te1), Some(te2)) => Ok((te1, te2)),
        (None, _) => Err(FmapError::MissingEchoTime("first echo sidecar has no EchoTime".to_string())),
        (_, None) => Err(FmapError::MissingEchoTime("second echo sidecar has no EchoTime".to_string())),
    }
}

/// Validate an echo time difference in seconds
pub fn check_delta_te(delta_te: f64) -> Result<f64> {
    if !delta_te.is_finite() || delta_te <= 0.0 {
        return Err(FmapError::InvalidEchoTime(delta_te));
    }
    if delta_te > SUSPICIOUS_DELTA_TE {
        warn!(delta_te, "echo time difference looks like milliseconds, expected seconds");
    }
    Ok(delta_te)
}
