//! Common test utilities for fmap-core integration tests

#![allow(dead_code)]

use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};

use fmap_core::nifti_io::save_nifti_to_file;
use fmap_core::phase::wrap_to_pi;
use fmap_core::Volume;

/// Scanner phase range used by the phantom (Siemens-style 12-bit)
pub const AU_MAX: f64 = 4096.0;
pub const TE1: f64 = 0.00492;
pub const TE2: f64 = 0.00738;

/// Compute RMSE between two arrays, only within mask
pub fn rmse(a: &[f64], b: &[f64], mask: &[u8]) -> f64 {
    let (sum_sq, count) = a
        .iter()
        .zip(b)
        .zip(mask)
        .filter(|(_, &m)| m > 0)
        .fold((0.0, 0usize), |(s, n), ((x, y), _)| (s + (x - y).powi(2), n + 1));
    if count == 0 {
        return 0.0;
    }
    (sum_sq / count as f64).sqrt()
}

/// Compute Pearson correlation coefficient within mask
pub fn correlation(a: &[f64], b: &[f64], mask: &[u8]) -> f64 {
    let mut sum_a = 0.0;
    let mut sum_b = 0.0;
    let mut sum_ab = 0.0;
    let mut sum_a2 = 0.0;
    let mut sum_b2 = 0.0;
    let mut n = 0usize;

    for i in 0..a.len() {
        if mask[i] > 0 {
            sum_a += a[i];
            sum_b += b[i];
            sum_ab += a[i] * b[i];
            sum_a2 += a[i] * a[i];
            sum_b2 += b[i] * b[i];
            n += 1;
        }
    }

    if n == 0 {
        return 0.0;
    }

    let n = n as f64;
    let numerator = n * sum_ab - sum_a * sum_b;
    let denominator = ((n * sum_a2 - sum_a * sum_a) * (n * sum_b2 - sum_b * sum_b)).sqrt();

    if denominator == 0.0 {
        return 0.0;
    }

    numerator / denominator
}

/// Radians in (-π, π] to scanner units in [0, AU_MAX)
pub fn to_au(rad: f64) -> f64 {
    (rad + PI) / (2.0 * PI) * AU_MAX
}

/// Sphere of uniform magnitude in a cube, with a linear off-resonance field
pub struct Phantom {
    pub dims: (usize, usize, usize),
    pub radius: f64,
    /// Peak field at the sphere edge along x, Hz
    pub peak_hz: f64,
}

impl Default for Phantom {
    fn default() -> Self {
        Phantom { dims: (24, 24, 24), radius: 10.0, peak_hz: 300.0 }
    }
}

impl Phantom {
    fn centre(&self) -> (f64, f64, f64) {
        (self.dims.0 as f64 / 2.0, self.dims.1 as f64 / 2.0, self.dims.2 as f64 / 2.0)
    }

    pub fn inside(&self, i: usize, j: usize, k: usize) -> bool {
        let c = self.centre();
        let d2 = (i as f64 - c.0).powi(2) + (j as f64 - c.1).powi(2) + (k as f64 - c.2).powi(2);
        d2 <= self.radius * self.radius
    }

    /// Ground-truth field in Hz (defined everywhere)
    pub fn field_hz(&self, i: usize, _j: usize, k: usize) -> f64 {
        let c = self.centre();
        self.peak_hz * (i as f64 - c.0) / self.radius + 20.0 * (k as f64 - c.2) / self.radius
    }

    pub fn field(&self) -> Volume {
        Volume::from_fn(self.dims, (1.0, 1.0, 1.0), |i, j, k| self.field_hz(i, j, k))
    }

    pub fn magnitude(&self) -> Volume {
        Volume::from_fn(self.dims, (1.0, 1.0, 1.0), |i, j, k| if self.inside(i, j, k) { 100.0 } else { 0.0 })
    }

    /// Wrapped echo phase in scanner units, zero phase outside the object
    pub fn phase_au(&self, te: f64) -> Volume {
        Volume::from_fn(self.dims, (1.0, 1.0, 1.0), |i, j, k| {
            let rad = if self.inside(i, j, k) {
                wrap_to_pi(2.0 * PI * self.field_hz(i, j, k) * te + 0.3)
            } else {
                0.0
            };
            to_au(rad)
        })
    }

    pub fn mask(&self) -> Vec<u8> {
        let (nx, ny, nz) = self.dims;
        let mut mask = Vec::with_capacity(nx * ny * nz);
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    mask.push(u8::from(self.inside(i, j, k)));
                }
            }
        }
        mask
    }
}

/// Files written for one pipeline run
pub struct PhantomFiles {
    pub phase1: PathBuf,
    pub phase2: PathBuf,
    pub magnitude: PathBuf,
    pub sidecar1: PathBuf,
    pub sidecar2: PathBuf,
}

/// Write both echoes, the magnitude, and per-echo sidecars into `dir`
pub fn write_phantom(phantom: &Phantom, dir: &Path) -> PhantomFiles {
    let files = PhantomFiles {
        phase1: dir.join("phase1.nii.gz"),
        phase2: dir.join("phase2.nii.gz"),
        magnitude: dir.join("mag1.nii.gz"),
        sidecar1: dir.join("phase1.json"),
        sidecar2: dir.join("phase2.json"),
    };
    save_nifti_to_file(&files.phase1, &phantom.phase_au(TE1)).unwrap();
    save_nifti_to_file(&files.phase2, &phantom.phase_au(TE2)).unwrap();
    save_nifti_to_file(&files.magnitude, &phantom.magnitude()).unwrap();
    fs::write(&files.sidecar1, format!(r#"{{"EchoTime": {}, "MagneticFieldStrength": 3}}"#, TE1)).unwrap();
    fs::write(&files.sidecar2, format!(r#"{{"EchoTime": {}, "MagneticFieldStrength": 3}}"#, TE2)).unwrap();
    files
}
