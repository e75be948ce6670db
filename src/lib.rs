//! fmap-core: B0 fieldmaps from dual-echo phase-difference acquisitions
//!
//! Two phase images and a magnitude image go in; a fieldmap in Hz comes out.
//! The work is done in five sequential stages (see [`pipeline`]), each of which
//! writes its result as NIfTI.
//!
//! # Modules
//! - `volume`: flat Fortran-order voxel grid
//! - `nifti_io`: NIfTI-1 reading and writing
//! - `metadata`: BIDS sidecar echo times
//! - `phase`: unit conversion and phase differences
//! - `magnitude`: bias correction and brain extraction
//! - `unwrap`: region growing and Laplacian unwrapping
//! - `solvers`: conjugate gradients for the masked Poisson solve
//! - `filter`, `postprocess`: denoising, recentering, scaling to Hz
//! - `fsl`: FSL / ANTs command-line backends
//! - `config`, `pipeline`: run configuration and orchestration

pub mod error;
pub mod volume;

// I/O
pub mod metadata;
pub mod nifti_io;

// Processing stages
pub mod filter;
pub mod magnitude;
pub mod phase;
pub mod postprocess;
pub mod unwrap;

// Numerics
pub mod fft;
pub mod priority_queue;
pub mod solvers;
pub mod utils;

// Orchestration
pub mod config;
pub mod fsl;
pub mod pipeline;

pub use config::PipelineConfig;
pub use error::{FmapError, Result};
pub use pipeline::{Pipeline, PipelineOutputs};
pub use volume::Volume;
