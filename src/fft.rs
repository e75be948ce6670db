//! 3D FFT over flat Fortran-order buffers using rustfft
//!
//! Transforms are unnormalised forward and `1/N`-normalised inverse, the NumPy
//! convention.

use std::sync::Arc;

use num_complex::Complex64;
use rustfft::{Fft, FftDirection, FftPlanner};

use crate::error::Dims;

/// Cached per-axis plans and scratch space for one grid
pub struct Fft3d {
    dims: Dims,
    forward: [Arc<dyn Fft<f64>>; 3],
    inverse: [Arc<dyn Fft<f64>>; 3],
    scratch: Vec<Complex64>,
    line: Vec<Complex64>,
}

impl Fft3d {
    pub fn new(dims: Dims) -> Self {
        let mut planner = FftPlanner::new();
        let lens = [dims.0, dims.1, dims.2];
        let forward = lens.map(|n| planner.plan_fft(n, FftDirection::Forward));
        let inverse = lens.map(|n| planner.plan_fft(n, FftDirection::Inverse));

        let scratch_len = forward
            .iter()
            .chain(inverse.iter())
            .map(|p| p.get_inplace_scratch_len())
            .max()
            .unwrap_or(0);

        Fft3d {
            dims,
            forward,
            inverse,
            scratch: vec![Complex64::new(0.0, 0.0); scratch_len],
            line: Vec::with_capacity(lens.into_iter().max().unwrap_or(0)),
        }
    }

    fn transform(&mut self, data: &mut [Complex64], direction: FftDirection) {
        let (nx, ny, nz) = self.dims;
        let lens = [nx, ny, nz];
        let strides = [1, nx, nx * ny];

        for axis in 0..3 {
            let plan = match direction {
                FftDirection::Forward => Arc::clone(&self.forward[axis]),
                FftDirection::Inverse => Arc::clone(&self.inverse[axis]),
            };
            let (len, stride) = (lens[axis], strides[axis]);
            if len <= 1 {
                continue;
            }

            for start in 0..data.len() {
                let first_on_line = match axis {
                    0 => start % nx == 0,
                    1 => (start / nx) % ny == 0,
                    _ => start / (nx * ny) == 0,
                };
                if !first_on_line {
                    continue;
                }
                if axis == 0 {
                    plan.process_with_scratch(&mut data[start..start + nx], &mut self.scratch);
                    continue;
                }
                self.line.clear();
                self.line.extend((0..len).map(|t| data[start + t * stride]));
                plan.process_with_scratch(&mut self.line, &mut self.scratch);
                for (t, &v) in self.line.iter().enumerate() {
                    data[start + t * stride] = v;
                }
            }
        }
    }

    /// In-place forward transform
    pub fn forward(&mut self, data: &mut [Complex64]) {
        self.transform(data, FftDirection::Forward);
    }

    /// In-place inverse transform, scaled by `1/N`
    pub fn inverse(&mut self, data: &mut [Complex64]) {
        self.transform(data, FftDirection::Inverse);
        let scale = 1.0 / data.len() as f64;
        for v in data.iter_mut() {
            *v *= scale;
        }
    }
}

/// Eigenvalues of the periodic 7-point Laplacian on the grid
///
/// Entry `(i, j, k)` is `Σ_axis (2 cos(2π f / n) - 2) / h²`; the DC term is
/// zero.
pub fn laplacian_eigenvalues(dims: Dims, voxel_size: (f64, f64, f64)) -> Vec<f64> {
    let (nx, ny, nz) = dims;
    let axis_terms = |n: usize, h: f64| -> Vec<f64> {
        (0..n)
            .map(|f| (2.0 * (2.0 * std::f64::consts::PI * f as f64 / n as f64).cos() - 2.0) / (h * h))
            .collect()
    };
    let (ex, ey, ez) = (
        axis_terms(nx, voxel_size.0),
        axis_terms(ny, voxel_size.1),
        axis_terms(nz, voxel_size.2),
    );

    let mut out = Vec::with_capacity(nx * ny * nz);
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                out.push(ex[i] + ey[j] + ez[k]);
            }
        }
    }
    out
}
