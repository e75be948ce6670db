//! Binary mask utilities
//!
//! Masks are flat `u8` buffers in Fortran order with values in {0, 1}.
//! Connectivity is 6-neighbour throughout.

use crate::error::Dims;
use crate::utils::smoothing::smooth_with_box_sizes;
use crate::utils::stats::{mean, percentile};
use crate::volume::coords3d;

/// Threshold a volume into a {0, 1} mask (`v > 0`)
pub fn binarize(data: &[f64]) -> Vec<u8> {
    data.iter().map(|&v| u8::from(v > 0.0)).collect()
}

pub fn count(mask: &[u8]) -> usize {
    mask.iter().filter(|&&m| m > 0).count()
}

pub fn is_binary(mask: &[u8]) -> bool {
    mask.iter().all(|&m| m <= 1)
}

/// Face neighbours of a voxel that lie inside the grid
pub fn neighbours6(idx: usize, dims: Dims) -> impl Iterator<Item = usize> {
    let (nx, ny, nz) = dims;
    let (i, j, k) = coords3d(idx, nx, ny);
    let candidates = [
        (i > 0).then(|| idx - 1),
        (i + 1 < nx).then(|| idx + 1),
        (j > 0).then(|| idx - nx),
        (j + 1 < ny).then(|| idx + nx),
        (k > 0).then(|| idx - nx * ny),
        (k + 1 < nz).then(|| idx + nx * ny),
    ];
    candidates.into_iter().flatten()
}

/// Connected components of voxels whose mask value equals `value`
pub fn components(mask: &[u8], dims: Dims, value: u8) -> Vec<Vec<usize>> {
    let mut visited = vec![false; mask.len()];
    let mut result = Vec::new();
    let mut stack = Vec::new();

    for start in 0..mask.len() {
        if visited[start] || mask[start] != value {
            continue;
        }
        let mut component = Vec::new();
        visited[start] = true;
        stack.push(start);
        while let Some(idx) = stack.pop() {
            component.push(idx);
            for n in neighbours6(idx, dims) {
                if !visited[n] && mask[n] == value {
                    visited[n] = true;
                    stack.push(n);
                }
            }
        }
        result.push(component);
    }

    result
}

/// Keep only the largest foreground component
pub fn largest_component(mask: &[u8], dims: Dims) -> Vec<u8> {
    let mut result = vec![0u8; mask.len()];
    if let Some(largest) = components(mask, dims, 1).into_iter().max_by_key(|c| c.len()) {
        for idx in largest {
            result[idx] = 1;
        }
    }
    result
}

/// Fill background components that do not touch the grid border and hold at
/// most `max_hole_size` voxels
pub fn fill_holes(mask: &[u8], dims: Dims, max_hole_size: usize) -> Vec<u8> {
    let (nx, ny, nz) = dims;
    let on_border = |idx: usize| {
        let (i, j, k) = coords3d(idx, nx, ny);
        i == 0 || i + 1 == nx || j == 0 || j + 1 == ny || k == 0 || k + 1 == nz
    };

    let mut result = mask.to_vec();
    for hole in components(mask, dims, 0) {
        if hole.len() <= max_hole_size && !hole.iter().any(|&idx| on_border(idx)) {
            for idx in hole {
                result[idx] = 1;
            }
        }
    }
    result
}

/// Quantile-based foreground mask of a magnitude image
///
/// The threshold is `max(5 * noise, signal / 5)` where `signal` is the mean
/// of the 80-99th percentile and `noise` the mean below the 15th (or 5th)
/// percentile. The raw mask is then smoothed, hole-filled and smoothed
/// again (MriResearchTools.jl `robustmask`).
pub fn robust_mask(mag: &[f64], dims: Dims) -> Vec<u8> {
    let mut samples: Vec<f64> = mag.iter().copied().filter(|v| v.is_finite() && *v > 0.0).collect();
    if samples.is_empty() {
        return vec![0u8; mag.len()];
    }
    samples.sort_by(|a, b| a.total_cmp(b));

    let q05 = percentile(&samples, 0.05);
    let q15 = percentile(&samples, 0.15);
    let q80 = percentile(&samples, 0.80);
    let q99 = percentile(&samples, 0.99);

    let band = |lo: f64, hi: f64| -> Vec<f64> {
        samples.iter().copied().filter(|&v| v >= lo && v <= hi).collect()
    };
    let signal = mean(&band(q80, q99)).unwrap_or(q99);

    let mut noise = mean(&band(f64::NEG_INFINITY, q15)).unwrap_or(0.0);
    if noise > signal / 10.0 {
        noise = mean(&band(f64::NEG_INFINITY, q05)).unwrap_or(0.0);
        if noise > signal / 10.0 {
            noise = 0.0;
        }
    }
    let threshold = (5.0 * noise).max(signal / 5.0);

    let raw: Vec<f64> = mag.iter().map(|&v| if v > threshold { 1.0 } else { 0.0 }).collect();
    let smoothed = smooth_with_box_sizes(&raw, &[vec![5], vec![5], vec![5]], dims);
    let mask: Vec<u8> = smoothed.iter().map(|&v| u8::from(v > 0.4)).collect();

    let mask = fill_holes(&mask, dims, mag.len() / 20);

    let as_f64: Vec<f64> = mask.iter().map(|&m| m as f64).collect();
    let smoothed = smooth_with_box_sizes(&as_f64, &[vec![3, 3], vec![3, 3], vec![3, 3]], dims);
    smoothed.iter().map(|&v| u8::from(v > 0.6)).collect()
}

/// Sphere of `radius` voxels around a centre given in voxel coordinates
#[cfg(test)]
pub(crate) fn create_sphere_mask(dims: Dims, center: (f64, f64, f64), radius: f64) -> Vec<u8> {
    let (nx, ny, nz) = dims;
    let mut mask = vec![0u8; nx * ny * nz];
    let r2 = radius * radius;

    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let dx = i as f64 - center.0;
                let dy = j as f64 - center.1;
                let dz = k as f64 - center.2;
                if dx * dx + dy * dy + dz * dz <= r2 {
                    mask[crate::volume::idx3d(i, j, k, nx, ny)] = 1;
                }
            }
        }
    }

    mask
}
