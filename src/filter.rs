//! Spatial filters for the unwrapped phase
//!
//! * spherical median filter (the `fslmaths -kernel sphere <r> -fmedian` operation)
//! * in-plane 3x3 despiking

use rayon::prelude::*;
use tracing::debug;

use crate::error::{FmapError, Result};
use crate::utils::stats::median_inplace;
use crate::volume::{coords3d, idx3d, Volume};

/// Radius of a spherical kernel
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelRadius {
    /// Radius in world units; the kernel is an ellipsoid in voxel space on
    /// anisotropic grids
    Millimetres(f64),
    /// Radius in voxels, ignoring voxel size
    Voxels(f64),
}

impl Default for KernelRadius {
    fn default() -> Self {
        KernelRadius::Millimetres(3.0)
    }
}

impl KernelRadius {
    /// Voxel offsets `(di, dj, dk)` inside the sphere, centre included
    pub fn offsets(&self, voxel_size: (f64, f64, f64)) -> Result<Vec<(isize, isize, isize)>> {
        let (radius, scale) = match *self {
            KernelRadius::Millimetres(r) => (r, voxel_size),
            KernelRadius::Voxels(r) => (r, (1.0, 1.0, 1.0)),
        };
        if !radius.is_finite() || radius < 0.0 {
            return Err(FmapError::Config(format!("kernel radius must be >= 0, got {}", radius)));
        }
        if scale.0 <= 0.0 || scale.1 <= 0.0 || scale.2 <= 0.0 {
            return Err(FmapError::Config(format!("voxel size must be positive, got {:?}", scale)));
        }

        let reach = |s: f64| (radius / s).floor() as isize;
        let (ri, rj, rk) = (reach(scale.0), reach(scale.1), reach(scale.2));
        let r2 = radius * radius + 1e-9;

        let mut offsets = Vec::new();
        for dk in -rk..=rk {
            for dj in -rj..=rj {
                for di in -ri..=ri {
                    let d2 = (di as f64 * scale.0).powi(2)
                        + (dj as f64 * scale.1).powi(2)
                        + (dk as f64 * scale.2).powi(2);
                    if d2 <= r2 {
                        offsets.push((di, dj, dk));
                    }
                }
            }
        }
        Ok(offsets)
    }
}

/// Median over a spherical neighbourhood
///
/// With a mask, only in-mask neighbours contribute and voxels outside the
/// mask keep their input value. Neighbours beyond the grid are skipped.
pub fn median_filter(vol: &Volume, kernel: KernelRadius, mask: Option<&[u8]>) -> Result<Volume> {
    if let Some(m) = mask {
        vol.check_mask(m)?;
    }
    let offsets = kernel.offsets(vol.voxel_size)?;
    debug!(kernel_voxels = offsets.len(), ?kernel, "median filter");

    let (nx, ny, nz) = vol.dims;
    let inside = |idx: usize| mask.map_or(true, |m| m[idx] > 0);

    let filtered: Vec<f64> = (0..vol.n_voxels())
        .into_par_iter()
        .map_init(Vec::new, |values, idx| {
            if !inside(idx) {
                return vol.data[idx];
            }
            let (i, j, k) = coords3d(idx, nx, ny);
            values.clear();
            for &(di, dj, dk) in &offsets {
                let (Some(ni), Some(nj), Some(nk)) = (
                    i.checked_add_signed(di).filter(|&v| v < nx),
                    j.checked_add_signed(dj).filter(|&v| v < ny),
                    k.checked_add_signed(dk).filter(|&v| v < nz),
                ) else {
                    continue;
                };
                let n = idx3d(ni, nj, nk, nx, ny);
                if inside(n) {
                    values.push(vol.data[n]);
                }
            }
            median_inplace(values)
        })
        .collect();

    vol.with_data(filtered)
}

/// Replace in-plane spikes with the local median
///
/// For every voxel the 3x3 in-plane neighbourhood (itself included, clipped
/// at the slice edge) is examined; when its range exceeds 1e-6 and
/// `|v - median| / range > threshold` the voxel becomes the median. The
/// neighbourhood is always read from the input, so results do not depend on
/// scan order. The ratio never exceeds 1, so thresholds of 1 or more leave
/// the data unchanged.
pub fn despike_2d(vol: &Volume, threshold: f64) -> Result<Volume> {
    let (nx, ny, nz) = vol.dims;
    let mut out = vol.data.clone();
    let mut values = Vec::with_capacity(9);
    let mut replaced = 0usize;

    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                values.clear();
                for jj in j.saturating_sub(1)..(j + 2).min(ny) {
                    for ii in i.saturating_sub(1)..(i + 2).min(nx) {
                        values.push(vol.data[idx3d(ii, jj, k, nx, ny)]);
                    }
                }
                let (lo, hi) = values
                    .iter()
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
                let range = hi - lo;
                let med = median_inplace(&mut values);

                let idx = idx3d(i, j, k, nx, ny);
                if range > 1e-6 && (vol.data[idx] - med).abs() / range > threshold {
                    out[idx] = med;
                    replaced += 1;
                }
            }
        }
    }
    debug!(replaced, threshold, "despike");

    vol.with_data(out)
}

/// Spatial denoising stage of the pipeline
pub trait Denoiser {
    fn name(&self) -> &'static str;

    fn denoise(&self, phase: &Volume, mask: &[u8]) -> Result<Volume>;
}

/// In-process spherical median filter restricted to the brain mask
#[derive(Debug, Clone, Copy, Default)]
pub struct MedianDenoiser {
    pub kernel: KernelRadius,
}

impl Denoiser for MedianDenoiser {
    fn name(&self) -> &'static str {
        "native-median"
    }

    fn denoise(&self, phase: &Volume, mask: &[u8]) -> Result<Volume> {
        median_filter(phase, self.kernel, Some(mask))
    }
}
