//! Laplacian phase unwrapping
//!
//! The Laplacian of the true phase equals the Laplacian built from wrapped
//! neighbour differences, so a Poisson solve recovers a smooth phase estimate
//! (Schofield & Zhu, Opt. Lett. 2003). Only neighbour pairs with both voxels
//! inside the mask enter the operator, which makes the mask edge (and the
//! grid edge) a no-flux boundary. A periodic FFT solve gives the starting
//! guess and conjugate gradients solve the masked problem.
//!
//! The estimate is then used only to pick the whole number of wraps per
//! voxel, which keeps the output congruent to the input modulo 2π.

use std::f64::consts::PI;

use num_complex::Complex64;
use tracing::debug;

use super::{check_inputs, PhaseUnwrapper};
use crate::error::{Dims, Result};
use crate::fft::{laplacian_eigenvalues, Fft3d};
use crate::phase::wrap_to_pi;
use crate::solvers::cg_solve;
use crate::utils::mask::components;
use crate::volume::{coords3d, Volume};

const TWO_PI: f64 = 2.0 * PI;
const CG_TOL: f64 = 1e-8;
const CG_MAX_ITER: usize = 2000;

#[derive(Debug, Clone, Copy, Default)]
pub struct LaplacianUnwrapper;

fn axis_weights(voxel_size: (f64, f64, f64)) -> [f64; 3] {
    [
        1.0 / (voxel_size.0 * voxel_size.0),
        1.0 / (voxel_size.1 * voxel_size.1),
        1.0 / (voxel_size.2 * voxel_size.2),
    ]
}

/// Call `f(neighbour, weight)` for each in-grid, in-mask face neighbour
#[inline]
fn masked_neighbours<F>(idx: usize, dims: Dims, weights: [f64; 3], mask: &[u8], mut f: F)
where
    F: FnMut(usize, f64),
{
    let (nx, ny, nz) = dims;
    let (i, j, k) = coords3d(idx, nx, ny);
    for (c, n, stride, w) in [(i, nx, 1, weights[0]), (j, ny, nx, weights[1]), (k, nz, nx * ny, weights[2])] {
        if c > 0 && mask[idx - stride] > 0 {
            f(idx - stride, w);
        }
        if c + 1 < n && mask[idx + stride] > 0 {
            f(idx + stride, w);
        }
    }
}

/// `(A u)_i = Σ w (u_i - u_j)` over in-mask neighbour pairs; zero outside
fn apply_operator(u: &[f64], mask: &[u8], dims: Dims, weights: [f64; 3]) -> Vec<f64> {
    (0..u.len())
        .map(|idx| {
            if mask[idx] == 0 {
                return 0.0;
            }
            let mut sum = 0.0;
            masked_neighbours(idx, dims, weights, mask, |n, w| sum += w * (u[idx] - u[n]));
            sum
        })
        .collect()
}

/// Right-hand side of `A u = b` built from wrapped neighbour differences
fn wrapped_rhs(phase: &[f64], mask: &[u8], dims: Dims, weights: [f64; 3]) -> Vec<f64> {
    (0..phase.len())
        .map(|idx| {
            if mask[idx] == 0 {
                return 0.0;
            }
            let mut sum = 0.0;
            masked_neighbours(idx, dims, weights, mask, |n, w| {
                sum += w * wrap_to_pi(phase[idx] - phase[n])
            });
            sum
        })
        .collect()
}

/// Solve `∇²u = f` with periodic boundaries; the mean of `u` is zero
fn solve_poisson(rhs: &[f64], dims: Dims, voxel_size: (f64, f64, f64)) -> Vec<f64> {
    let mut fft = Fft3d::new(dims);
    let mut spectrum: Vec<Complex64> = rhs.iter().map(|&v| Complex64::new(v, 0.0)).collect();
    fft.forward(&mut spectrum);

    let eigenvalues = laplacian_eigenvalues(dims, voxel_size);
    for (s, &lam) in spectrum.iter_mut().zip(&eigenvalues) {
        *s = if lam.abs() > 1e-20 { *s / lam } else { Complex64::new(0.0, 0.0) };
    }

    fft.inverse(&mut spectrum);
    spectrum.iter().map(|c| c.re).collect()
}

/// Smooth phase estimate inside the mask, defined up to a constant per component
fn estimate_phase(phase: &Volume, mask: &[u8]) -> Vec<f64> {
    let dims = phase.dims;
    let weights = axis_weights(phase.voxel_size);
    let rhs = wrapped_rhs(&phase.data, mask, dims, weights);

    // A = -∇² on the mask, so the periodic guess solves ∇²u = -b
    let negated: Vec<f64> = rhs.iter().map(|v| -v).collect();
    let mut guess = solve_poisson(&negated, dims, phase.voxel_size);
    for (g, &m) in guess.iter_mut().zip(mask) {
        if m == 0 {
            *g = 0.0;
        }
    }

    let (estimate, iterations) = cg_solve(
        |u| apply_operator(u, mask, dims, weights),
        &rhs,
        &guess,
        CG_TOL,
        CG_MAX_ITER,
    );
    debug!(iterations, "masked poisson solve");
    estimate
}

impl PhaseUnwrapper for LaplacianUnwrapper {
    fn name(&self) -> &'static str {
        "laplacian"
    }

    fn unwrap(&self, magnitude: &Volume, phase: &Volume, mask: &[u8]) -> Result<Volume> {
        let mask = check_inputs(magnitude, phase, mask)?;
        let mut estimate = estimate_phase(phase, &mask);

        // Pin each component's free constant to the circular mean offset
        for part in components(&mask, phase.dims, 1) {
            let (s, c) = part.iter().fold((0.0, 0.0), |(s, c), &idx| {
                let d = phase.data[idx] - estimate[idx];
                (s + d.sin(), c + d.cos())
            });
            let offset = s.atan2(c);
            for &idx in &part {
                estimate[idx] += offset;
            }
        }

        let unwrapped: Vec<f64> = phase
            .data
            .iter()
            .zip(&estimate)
            .zip(&mask)
            .map(|((&wrapped, &est), &m)| {
                if m == 0 {
                    0.0
                } else {
                    wrapped + TWO_PI * ((est - wrapped) / TWO_PI).round()
                }
            })
            .collect();
        debug!("laplacian unwrapping done");

        phase.with_data(unwrapped)
    }
}
