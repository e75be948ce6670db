//! Spatial phase unwrapping
//!
//! An unwrapper takes the brain magnitude, the wrapped phase difference and
//! the brain mask, and returns a phase map that is continuous inside the mask
//! and zero outside it. Results are defined up to a global `2πk` offset.

pub mod laplacian;
pub mod region_grow;

pub use laplacian::LaplacianUnwrapper;
pub use region_grow::RegionGrowUnwrapper;

use tracing::warn;

use crate::error::{FmapError, Result};
use crate::utils::mask;
use crate::volume::Volume;

pub trait PhaseUnwrapper {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    fn unwrap(&self, magnitude: &Volume, phase: &Volume, mask: &[u8]) -> Result<Volume>;
}

/// Mask voxels whose phase is a finite number
pub fn finite_mask(phase: &[f64], brain_mask: &[u8]) -> Vec<u8> {
    phase
        .iter()
        .zip(brain_mask)
        .map(|(v, &m)| u8::from(m > 0 && v.is_finite()))
        .collect()
}

/// Shared input validation: same grid, one mask entry per voxel, and at least
/// one usable voxel. Returns the working mask with non-finite phase removed.
pub(crate) fn check_inputs(magnitude: &Volume, phase: &Volume, brain_mask: &[u8]) -> Result<Vec<u8>> {
    phase.check_same_grid(magnitude, "magnitude")?;
    phase.check_mask(brain_mask)?;
    let working = finite_mask(&phase.data, brain_mask);
    let dropped = mask::count(brain_mask) - mask::count(&working);
    if dropped > 0 {
        warn!(dropped, "non-finite phase voxels removed from mask");
    }
    if mask::count(&working) == 0 {
        return Err(FmapError::EmptyMask);
    }
    Ok(working)
}
