//! Phase unit conversion and phase differences
//!
//! Scanner phase is stored in arbitrary integer units (Siemens uses 0..4095 or
//! -4096..4095). Conversion is a linear map of a unit range `[lo, hi]` onto
//! `[-π, π]`.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FmapError, Result};
use crate::volume::Volume;

const TWO_PI: f64 = 2.0 * PI;

/// How scanner units map onto radians
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum PhaseScaling {
    /// Detect: radians pass through, unsigned data uses `[0, max]`,
    /// signed data uses `[min, max]`
    #[default]
    Auto,
    /// `[min, max]` of the data itself
    DataRange,
    /// Fixed scanner constants
    ScannerRange { min: f64, max: f64 },
    /// Already radians
    Radians,
}

/// How echo phases are combined into a phase difference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DifferenceMode {
    /// `echo2 - echo1` with no wrapping, range (-2π, 2π)
    Plain,
    /// `echo2 - echo1` wrapped into (-π, π]
    #[default]
    Wrapped,
}

/// Wrap angle to (-π, π]
#[inline]
pub fn wrap_to_pi(angle: f64) -> f64 {
    let a = angle - TWO_PI * (angle / TWO_PI).round();
    if a <= -PI { a + TWO_PI } else { a }
}

impl PhaseScaling {
    /// The unit range to map onto `[-π, π]`, or `None` for passthrough
    pub fn unit_range(&self, phase: &Volume) -> Result<Option<(f64, f64)>> {
        let range = || phase.finite_range().ok_or(FmapError::DegenerateRange(f64::NAN));
        match *self {
            PhaseScaling::Radians => Ok(None),
            PhaseScaling::ScannerRange { min, max } => Ok(Some((min, max))),
            PhaseScaling::DataRange => range().map(Some),
            PhaseScaling::Auto => {
                let (min, max) = range()?;
                if min >= -PI * 1.1 && max <= PI * 1.1 {
                    Ok(None)
                } else if min >= 0.0 {
                    Ok(Some((0.0, max)))
                } else {
                    Ok(Some((min, max)))
                }
            }
        }
    }
}

/// Convert scanner phase units to radians
///
/// `rad = (v - lo) / (hi - lo) * 2π - π`. Values outside `[lo, hi]` are not
/// clamped or checked.
pub fn au_to_rads(phase: &Volume, scaling: PhaseScaling) -> Result<Volume> {
    match scaling.unit_range(phase)? {
        None => {
            debug!("phase already in radians");
            Ok(phase.clone())
        }
        Some((lo, hi)) => {
            let span = hi - lo;
            if span.abs() < 1e-12 {
                return Err(FmapError::DegenerateRange(lo));
            }
            debug!(lo, hi, "rescaling phase to radians");
            Ok(phase.map(|v| (v - lo) / span * TWO_PI - PI))
        }
    }
}

/// Inverse of [`au_to_rads`] for a fixed unit range
pub fn rads_to_au(phase: &Volume, lo: f64, hi: f64) -> Result<Volume> {
    let span = hi - lo;
    if span.abs() < 1e-12 {
        return Err(FmapError::DegenerateRange(lo));
    }
    Ok(phase.map(|v| (v + PI) / TWO_PI * span + lo))
}

/// Phase difference `echo2 - echo1`
pub fn subtract_phases(echo1: &Volume, echo2: &Volume, mode: DifferenceMode) -> Result<Volume> {
    echo1.check_same_grid(echo2, "second echo phase")?;

    let diff = echo1.data.iter().zip(&echo2.data).map(|(&a, &b)| {
        let d = b - a;
        match mode {
            DifferenceMode::Plain => d,
            DifferenceMode::Wrapped => wrap_to_pi(d),
        }
    });
    echo1.with_data(diff.collect())
}
