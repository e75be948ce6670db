//! Native receive-field homogeneity correction
//!
//! Estimates a smooth sensitivity map from the magnitude image and divides it
//! out, following MriResearchTools.jl `makehomogeneous`:
//!
//! 1. robust foreground mask
//! 2. box segmentation of tissue near the local 90th percentile
//! 3. masked smoothing of the tissue intensities
//! 4. fill of implausible values, then weighted smoothing

use tracing::debug;

use crate::error::Dims;
use crate::utils::mask::robust_mask;
use crate::utils::smoothing::gaussian_smooth_3d;
use crate::utils::stats::percentile;
use crate::volume::idx3d;

/// Split between the masked and the weighted smoothing sigmas
const SIGMA_SPLIT: f64 = 0.7;

/// Tissue voxels: in range of the local 90th percentile in at least two
/// overlapping boxes out of an `nbox`^3 tiling
fn box_segment(image: &[f64], mask: &[u8], nbox: usize, dims: Dims) -> Vec<u8> {
    let (nx, ny, nz) = dims;
    let nbox = nbox.max(1);
    let shift = (nx.div_ceil(nbox).max(1), ny.div_ceil(nbox).max(1), nz.div_ceil(nbox).max(1));
    let mut votes = vec![0u8; image.len()];
    let mut indices = Vec::new();
    let mut values = Vec::new();

    for cz in (0..nz).step_by(shift.2) {
        for cy in (0..ny).step_by(shift.1) {
            for cx in (0..nx).step_by(shift.0) {
                let xr = cx.saturating_sub(shift.0)..(cx + shift.0).min(nx);
                let yr = cy.saturating_sub(shift.1)..(cy + shift.1).min(ny);
                let zr = cz.saturating_sub(shift.2)..(cz + shift.2).min(nz);
                indices.clear();
                for z in zr {
                    for y in yr.clone() {
                        indices.extend(xr.clone().map(|x| idx3d(x, y, z, nx, ny)));
                    }
                }

                values.clear();
                values.extend(indices.iter().filter(|&&i| mask[i] > 0 && image[i].is_finite()).map(|&i| image[i]));
                if values.is_empty() {
                    continue;
                }
                values.sort_by(|a, b| a.total_cmp(b));
                let q90 = percentile(&values, 0.9);
                let (low, high) = (0.9 * q90, 1.1 * q90);

                for &i in &indices {
                    if mask[i] > 0 && image[i] > low && image[i] < high {
                        votes[i] = votes[i].saturating_add(1);
                    }
                }
            }
        }
    }

    votes.iter().zip(mask).map(|(&v, &m)| u8::from(v >= 2 && m > 0)).collect()
}

/// Replace implausible lowpass values with `3 * stable_mean` and smooth with
/// those voxels down-weighted
fn fill_and_smooth(lowpass: &mut [f64], stable_mean: f64, sigma: [f64; 3], dims: Dims) {
    let mut weight = vec![1.2; lowpass.len()];
    for (v, w) in lowpass.iter_mut().zip(weight.iter_mut()) {
        if v.is_nan() || *v < stable_mean / 4.0 || *v > 10.0 * stable_mean {
            *v = 3.0 * stable_mean;
            *w = 0.2;
        }
    }
    let smoothed = gaussian_smooth_3d(lowpass, sigma, None, Some(&mut weight), 3, dims);
    lowpass.copy_from_slice(&smoothed);
}

/// Smooth sensitivity (bias field) estimate of a magnitude image
pub fn estimate_sensitivity(
    mag: &[f64],
    dims: Dims,
    voxel_size: (f64, f64, f64),
    sigma_mm: f64,
    nbox: usize,
) -> Vec<f64> {
    let sigma = [sigma_mm / voxel_size.0, sigma_mm / voxel_size.1, sigma_mm / voxel_size.2];
    let outer = (1.0 - SIGMA_SPLIT * SIGMA_SPLIT).sqrt();
    let sigma1 = sigma.map(|s| outer * s);
    let sigma2 = sigma.map(|s| SIGMA_SPLIT * s);

    let mask = robust_mask(mag, dims);
    let tissue = box_segment(mag, &mask, nbox, dims);
    debug!(
        foreground = mask.iter().filter(|&&m| m > 0).count(),
        tissue = tissue.iter().filter(|&&m| m > 0).count(),
        "sensitivity segmentation"
    );

    let mut lowpass = gaussian_smooth_3d(mag, sigma1, Some(&tissue), None, 8, dims);

    let (sum, n) = mag
        .iter()
        .zip(&mask)
        .filter(|(v, &m)| m > 0 && v.is_finite())
        .fold((0.0, 0usize), |(s, n), (&v, _)| (s + v, n + 1));
    let stable_mean = if n > 0 { sum / n as f64 } else { 1.0 };

    fill_and_smooth(&mut lowpass, stable_mean, sigma2, dims);
    lowpass
}

/// Magnitude divided by its estimated sensitivity
pub fn make_homogeneous(
    mag: &[f64],
    dims: Dims,
    voxel_size: (f64, f64, f64),
    sigma_mm: f64,
    nbox: usize,
) -> Vec<f64> {
    let sensitivity = estimate_sensitivity(mag, dims, voxel_size, sigma_mm, nbox);
    mag.iter()
        .zip(&sensitivity)
        .map(|(&m, &s)| if s > 1e-10 { m / s } else { m })
        .collect()
}
