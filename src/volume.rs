//! In-memory scalar volume
//!
//! Voxel data is stored flat in Fortran (column-major) order to match the
//! NIfTI convention: index = x + y*nx + z*nx*ny.

use crate::error::{Dims, FmapError, Result};

/// Index into 3D array (Fortran/column-major order)
#[inline(always)]
pub fn idx3d(i: usize, j: usize, k: usize, nx: usize, ny: usize) -> usize {
    i + j * nx + k * nx * ny
}

/// Split a flat index back into (i, j, k)
#[inline]
pub fn coords3d(idx: usize, nx: usize, ny: usize) -> (usize, usize, usize) {
    let k = idx / (nx * ny);
    let rem = idx % (nx * ny);
    (rem % nx, rem / nx, k)
}

/// Identity affine scaled by voxel size
pub fn scaled_affine(voxel_size: (f64, f64, f64)) -> [f64; 16] {
    let (vx, vy, vz) = voxel_size;
    [
        vx, 0.0, 0.0, 0.0,
        0.0, vy, 0.0, 0.0,
        0.0, 0.0, vz, 0.0,
        0.0, 0.0, 0.0, 1.0,
    ]
}

/// A 3D scalar image on a voxel grid
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    /// Voxel values, Fortran order
    pub data: Vec<f64>,
    /// Dimensions (nx, ny, nz)
    pub dims: Dims,
    /// Voxel sizes in mm
    pub voxel_size: (f64, f64, f64),
    /// Voxel-to-world transform (4x4, row-major)
    pub affine: [f64; 16],
}

impl Volume {
    pub fn new(
        data: Vec<f64>,
        dims: Dims,
        voxel_size: (f64, f64, f64),
        affine: [f64; 16],
    ) -> Result<Self> {
        if data.len() != dims.0 * dims.1 * dims.2 {
            return Err(FmapError::DataLength { len: data.len(), dims });
        }
        Ok(Volume { data, dims, voxel_size, affine })
    }

    /// Build a volume by evaluating `f(i, j, k)` at every voxel
    pub fn from_fn<F>(dims: Dims, voxel_size: (f64, f64, f64), f: F) -> Self
    where
        F: Fn(usize, usize, usize) -> f64,
    {
        let (nx, ny, nz) = dims;
        let mut data = Vec::with_capacity(nx * ny * nz);
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    data.push(f(i, j, k));
                }
            }
        }
        Volume { data, dims, voxel_size, affine: scaled_affine(voxel_size) }
    }

    /// New volume on the same grid with different data
    pub fn with_data(&self, data: Vec<f64>) -> Result<Self> {
        Volume::new(data, self.dims, self.voxel_size, self.affine)
    }

    /// Elementwise map onto the same grid
    pub fn map<F: Fn(f64) -> f64>(&self, f: F) -> Self {
        Volume {
            data: self.data.iter().map(|&v| f(v)).collect(),
            dims: self.dims,
            voxel_size: self.voxel_size,
            affine: self.affine,
        }
    }

    /// Binary mask as a 0.0 / 1.0 volume on this grid
    pub fn mask_volume(&self, mask: &[u8]) -> Result<Self> {
        self.with_data(mask.iter().map(|&m| if m > 0 { 1.0 } else { 0.0 }).collect())
    }

    #[inline]
    pub fn n_voxels(&self) -> usize {
        self.dims.0 * self.dims.1 * self.dims.2
    }

    #[inline]
    pub fn idx(&self, i: usize, j: usize, k: usize) -> usize {
        idx3d(i, j, k, self.dims.0, self.dims.1)
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize, k: usize) -> f64 {
        self.data[self.idx(i, j, k)]
    }

    pub fn same_grid(&self, other: &Volume) -> bool {
        self.dims == other.dims
    }

    /// Fail with a `GridMismatch` naming `what` if `other` is on a different grid
    pub fn check_same_grid(&self, other: &Volume, what: &str) -> Result<()> {
        if self.same_grid(other) {
            Ok(())
        } else {
            Err(FmapError::GridMismatch {
                what: what.to_string(),
                expected: self.dims,
                found: other.dims,
            })
        }
    }

    /// Fail if a mask does not have one entry per voxel
    pub fn check_mask(&self, mask: &[u8]) -> Result<()> {
        if mask.len() == self.n_voxels() {
            Ok(())
        } else {
            Err(FmapError::DataLength { len: mask.len(), dims: self.dims })
        }
    }

    /// Minimum and maximum over all finite voxels
    pub fn finite_range(&self) -> Option<(f64, f64)> {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for &v in self.data.iter().filter(|v| v.is_finite()) {
            lo = lo.min(v);
            hi = hi.max(v);
        }
        if lo <= hi { Some((lo, hi)) } else { None }
    }
}
