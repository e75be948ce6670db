//! Pipeline configuration
//!
//! Every field has a default, so a TOML file only needs the settings it
//! changes:
//!
//! ```toml
//! output_dir = "derivatives/fmap"
//! delta_te = 0.00246
//!
//! [inputs]
//! phase1 = "sub-01_phase1.nii.gz"
//! phase2 = "sub-01_phase2.nii.gz"
//! magnitude = "sub-01_magnitude1.nii.gz"
//!
//! [unwrap]
//! backend = "region-grow"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FmapError, Result};
use crate::filter::KernelRadius;
use crate::fsl::ToolPaths;
use crate::magnitude::ThresholdMethod;
use crate::phase::{DifferenceMode, PhaseScaling};
use crate::postprocess::CenterStatistic;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Inputs {
    pub phase1: PathBuf,
    pub phase2: PathBuf,
    pub magnitude: PathBuf,
    /// BIDS sidecar of the first echo (`EchoTime`, or `EchoTime1`/`EchoTime2`)
    pub phase1_sidecar: Option<PathBuf>,
    pub phase2_sidecar: Option<PathBuf>,
}

impl Default for Inputs {
    fn default() -> Self {
        Inputs {
            phase1: "phase1.nii.gz".into(),
            phase2: "phase2.nii.gz".into(),
            magnitude: "mag1.nii.gz".into(),
            phase1_sidecar: None,
            phase2_sidecar: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    pub difference: DifferenceMode,
    pub scaling: PhaseScaling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BiasBackend {
    #[default]
    N4,
    Homogeneity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiasConfig {
    pub backend: BiasBackend,
    pub sigma_mm: f64,
    pub nbox: usize,
}

impl Default for BiasConfig {
    fn default() -> Self {
        BiasConfig { backend: BiasBackend::N4, sigma_mm: 7.0, nbox: 15 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BrainBackend {
    #[default]
    Bet,
    Threshold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrainConfig {
    pub backend: BrainBackend,
    /// bet fractional intensity threshold
    pub frac: f64,
    pub threshold: ThresholdMethod,
}

impl Default for BrainConfig {
    fn default() -> Self {
        BrainConfig { backend: BrainBackend::Bet, frac: 0.6, threshold: ThresholdMethod::Robust }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnwrapBackend {
    #[default]
    Prelude,
    RegionGrow,
    Laplacian,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnwrapConfig {
    pub backend: UnwrapBackend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DenoiseBackend {
    #[default]
    Fslmaths,
    Native,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RadiusUnit {
    #[default]
    Mm,
    Voxels,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenoiseConfig {
    pub backend: DenoiseBackend,
    pub radius: f64,
    pub radius_unit: RadiusUnit,
    /// In-plane despiking before the median filter
    pub despike: bool,
    pub despike_threshold: f64,
}

impl Default for DenoiseConfig {
    fn default() -> Self {
        DenoiseConfig {
            backend: DenoiseBackend::Fslmaths,
            radius: 3.0,
            radius_unit: RadiusUnit::Mm,
            despike: false,
            despike_threshold: 0.8,
        }
    }
}

impl DenoiseConfig {
    pub fn kernel(&self) -> KernelRadius {
        match self.radius_unit {
            RadiusUnit::Mm => KernelRadius::Millimetres(self.radius),
            RadiusUnit::Voxels => KernelRadius::Voxels(self.radius),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemeanConfig {
    pub statistic: CenterStatistic,
}

/// File names of every stage output, relative to `output_dir`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputNames {
    pub phase1_rads: String,
    pub phase2_rads: String,
    pub phasediff: String,
    pub mag_bias: String,
    pub mag_brain: String,
    pub mag_mask: String,
    pub unwrapped: String,
    pub recentered: String,
    pub denoised: String,
    pub demeaned: String,
    pub fieldmap: String,
}

impl Default for OutputNames {
    fn default() -> Self {
        OutputNames {
            phase1_rads: "phase1_rads.nii.gz".into(),
            phase2_rads: "phase2_rads.nii.gz".into(),
            phasediff: "phasediff.nii.gz".into(),
            mag_bias: "mag1_bias.nii.gz".into(),
            mag_brain: "mag1_brain.nii.gz".into(),
            mag_mask: "mag1_mask.nii.gz".into(),
            unwrapped: "unwrapped.nii.gz".into(),
            recentered: "unwrapped_recentered.nii.gz".into(),
            denoised: "unwrapped_denoise.nii.gz".into(),
            demeaned: "unwrapped_demean.nii.gz".into(),
            fieldmap: "fieldmap.nii.gz".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub output_dir: PathBuf,
    /// Echo time difference in seconds; read from the sidecars when absent
    pub delta_te: Option<f64>,
    pub inputs: Inputs,
    pub phase: PhaseConfig,
    pub bias: BiasConfig,
    pub brain: BrainConfig,
    pub unwrap: UnwrapConfig,
    pub denoise: DenoiseConfig,
    pub demean: DemeanConfig,
    pub tools: ToolPaths,
    pub outputs: OutputNames,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            output_dir: PathBuf::from("."),
            delta_te: None,
            inputs: Inputs::default(),
            phase: PhaseConfig::default(),
            bias: BiasConfig::default(),
            brain: BrainConfig::default(),
            unwrap: UnwrapConfig::default(),
            denoise: DenoiseConfig::default(),
            demean: DemeanConfig::default(),
            tools: ToolPaths::default(),
            outputs: OutputNames::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| FmapError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Switch every stage to its in-process backend
    pub fn use_native_backends(&mut self) {
        self.bias.backend = BiasBackend::Homogeneity;
        self.brain.backend = BrainBackend::Threshold;
        self.unwrap.backend = UnwrapBackend::RegionGrow;
        self.denoise.backend = DenoiseBackend::Native;
    }

    /// True when no stage needs an external tool
    pub fn all_native(&self) -> bool {
        self.bias.backend == BiasBackend::Homogeneity
            && self.brain.backend == BrainBackend::Threshold
            && self.unwrap.backend != UnwrapBackend::Prelude
            && self.denoise.backend == DenoiseBackend::Native
    }

    pub fn output_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(name)
    }

    /// Scratch space for external tool inputs and outputs
    pub fn scratch_dir(&self) -> PathBuf {
        self.output_dir.join("tmp")
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(FmapError::Config(msg));

        if let Some(dte) = self.delta_te {
            if !dte.is_finite() || dte <= 0.0 {
                return fail(format!("delta_te must be a positive number of seconds, got {}", dte));
            }
        }
        for (name, path) in [
            ("inputs.phase1", &self.inputs.phase1),
            ("inputs.phase2", &self.inputs.phase2),
            ("inputs.magnitude", &self.inputs.magnitude),
        ] {
            if path.as_os_str().is_empty() {
                return fail(format!("{} is empty", name));
            }
        }
        if let PhaseScaling::ScannerRange { min, max } = self.phase.scaling {
            if !(max > min) {
                return fail(format!("phase.scaling range [{}, {}] is empty", min, max));
            }
        }
        if !(self.bias.sigma_mm > 0.0) {
            return fail(format!("bias.sigma_mm must be > 0, got {}", self.bias.sigma_mm));
        }
        if self.bias.nbox == 0 {
            return fail("bias.nbox must be >= 1".to_string());
        }
        if !(self.brain.frac > 0.0 && self.brain.frac < 1.0) {
            return fail(format!("brain.frac must lie in (0, 1), got {}", self.brain.frac));
        }
        if !self.denoise.radius.is_finite() || self.denoise.radius < 0.0 {
            return fail(format!("denoise.radius must be >= 0, got {}", self.denoise.radius));
        }
        if self.denoise.backend == DenoiseBackend::Fslmaths && self.denoise.radius_unit == RadiusUnit::Voxels {
            return fail("fslmaths sphere kernels are sized in mm; use radius_unit = \"mm\"".to_string());
        }
        if !(self.denoise.despike_threshold > 0.0) {
            return fail(format!(
                "denoise.despike_threshold must be > 0, got {}",
                self.denoise.despike_threshold
            ));
        }
        Ok(())
    }
}
