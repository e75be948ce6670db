//! Magnitude preprocessing: bias-field correction and brain extraction
//!
//! Both steps sit behind traits so the external tools (ANTs N4, FSL bet) and
//! the in-process implementations are interchangeable.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FmapError, Result};
use crate::utils::bias_correction::make_homogeneous;
use crate::utils::mask::{binarize, count, fill_holes, largest_component, robust_mask};
use crate::utils::threshold::otsu_threshold;
use crate::volume::Volume;

pub trait BiasCorrector {
    fn name(&self) -> &'static str;

    fn correct(&self, magnitude: &Volume) -> Result<Volume>;
}

/// Skull-stripped magnitude and its binary mask
#[derive(Debug, Clone)]
pub struct BrainExtraction {
    pub brain: Volume,
    pub mask: Vec<u8>,
}

pub trait BrainExtractor {
    fn name(&self) -> &'static str;

    fn extract(&self, magnitude: &Volume) -> Result<BrainExtraction>;
}

/// Binary {0, 1} mask of the voxels where the brain image is positive
pub fn derive_mask(brain: &Volume) -> Vec<u8> {
    binarize(&brain.data)
}

/// Divide out a smooth receive-field estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HomogeneityCorrection {
    /// Smoothing sigma in mm
    pub sigma_mm: f64,
    /// Boxes per axis for tissue segmentation
    pub nbox: usize,
}

impl Default for HomogeneityCorrection {
    fn default() -> Self {
        HomogeneityCorrection { sigma_mm: 7.0, nbox: 15 }
    }
}

impl BiasCorrector for HomogeneityCorrection {
    fn name(&self) -> &'static str {
        "homogeneity"
    }

    fn correct(&self, magnitude: &Volume) -> Result<Volume> {
        if self.sigma_mm <= 0.0 || self.nbox == 0 {
            return Err(FmapError::Config(format!(
                "homogeneity correction needs sigma_mm > 0 and nbox >= 1, got {} and {}",
                self.sigma_mm, self.nbox
            )));
        }
        let corrected = make_homogeneous(
            &magnitude.data,
            magnitude.dims,
            magnitude.voxel_size,
            self.sigma_mm,
            self.nbox,
        );
        magnitude.with_data(corrected)
    }
}

/// How the native extractor picks its intensity threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThresholdMethod {
    /// Noise/signal quantile rule with mask smoothing
    #[default]
    Robust,
    /// Otsu's histogram threshold
    Otsu,
}

/// Intensity threshold, largest connected component, hole filling
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThresholdExtraction {
    pub method: ThresholdMethod,
}

impl BrainExtractor for ThresholdExtraction {
    fn name(&self) -> &'static str {
        "threshold"
    }

    fn extract(&self, magnitude: &Volume) -> Result<BrainExtraction> {
        let dims = magnitude.dims;
        let initial = match self.method {
            ThresholdMethod::Robust => robust_mask(&magnitude.data, dims),
            ThresholdMethod::Otsu => {
                let t = otsu_threshold(&magnitude.data, 256);
                debug!(threshold = t, "otsu threshold");
                magnitude.data.iter().map(|&v| u8::from(v > t)).collect()
            }
        };

        let mask = largest_component(&initial, dims);
        let mask = fill_holes(&mask, dims, magnitude.n_voxels());
        if count(&mask) == 0 {
            return Err(FmapError::EmptyMask);
        }
        debug!(voxels = count(&mask), "brain mask");

        let brain = magnitude.with_data(
            magnitude
                .data
                .iter()
                .zip(&mask)
                .map(|(&v, &m)| if m > 0 { v } else { 0.0 })
                .collect(),
        )?;
        Ok(BrainExtraction { brain, mask })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::mask::is_binary;

    fn sphere(dims: (usize, usize, usize), radius: f64) -> Volume {
        let c = (dims.0 as f64 / 2.0, dims.1 as f64 / 2.0, dims.2 as f64 / 2.0);
        Volume::from_fn(dims, (1.0, 1.0, 1.0), |i, j, k| {
            let d2 = (i as f64 - c.0).powi(2) + (j as f64 - c.1).powi(2) + (k as f64 - c.2).powi(2);
            if d2 <= radius * radius { 100.0 } else { 2.0 }
        })
    }

    #[test]
    fn test_derive_mask_is_binary() {
        let vol = Volume::from_fn((4, 1, 1), (1.0, 1.0, 1.0), |i, _, _| [0.0, 3.5, -1.0, 1e-9][i]);
        let mask = derive_mask(&vol);
        assert_eq!(mask, vec![0, 1, 0, 1]);
        assert!(is_binary(&mask));
    }

    #[test]
    fn test_threshold_extraction_robust() {
        let mag = sphere((20, 20, 20), 6.0);
        let result = ThresholdExtraction::default().extract(&mag).unwrap();
        assert!(is_binary(&result.mask));
        assert_eq!(result.mask[mag.idx(10, 10, 10)], 1);
        assert_eq!(result.mask[0], 0);
        assert_eq!(result.brain.data[0], 0.0);
        assert_eq!(result.brain.get(10, 10, 10), 100.0);
        assert_eq!(derive_mask(&result.brain), result.mask);
    }

    #[test]
    fn test_threshold_extraction_otsu_drops_islands() {
        let mut mag = sphere((20, 20, 20), 5.0);
        let island = mag.idx(1, 1, 1);
        mag.data[island] = 100.0;
        let result = ThresholdExtraction { method: ThresholdMethod::Otsu }.extract(&mag).unwrap();
        assert_eq!(result.mask[island], 0);
        assert_eq!(result.mask[mag.idx(10, 10, 10)], 1);
    }

    #[test]
    fn test_threshold_extraction_empty() {
        let mag = Volume::from_fn((6, 6, 6), (1.0, 1.0, 1.0), |_, _, _| 0.0);
        assert!(matches!(ThresholdExtraction::default().extract(&mag), Err(FmapError::EmptyMask)));
    }

    #[test]
    fn test_homogeneity_rejects_bad_parameters() {
        let mag = sphere((8, 8, 8), 3.0);
        let bad = HomogeneityCorrection { sigma_mm: 0.0, nbox: 15 };
        assert!(bad.correct(&mag).is_err());
    }

    #[test]
    fn test_homogeneity_keeps_grid() {
        let mag = sphere((16, 16, 16), 6.0);
        let out = HomogeneityCorrection::default().correct(&mag).unwrap();
        assert!(out.same_grid(&mag));
        assert!(out.data.iter().all(|v| v.is_finite()));
    }
}
