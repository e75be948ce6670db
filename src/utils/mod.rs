//! Volume utilities shared by the processing stages

pub mod bias_correction;
pub mod mask;
pub mod smoothing;
pub mod stats;
pub mod threshold;
