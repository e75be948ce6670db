//! Five-stage fieldmap reconstruction
//!
//! 1. phase conversion of both echoes to radians
//! 2. phase difference
//! 3. magnitude bias correction, brain extraction and mask
//! 4. spatial unwrapping of the phase difference
//! 5. recenter, denoise, demean, scale to Hz
//!
//! Stages run in order on the calling thread and every intermediate volume is
//! written to `output_dir`. Any failure aborts the run.

use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::{BiasBackend, BrainBackend, DenoiseBackend, PipelineConfig, UnwrapBackend};
use crate::error::{FmapError, Result};
use crate::filter::{despike_2d, Denoiser, KernelRadius, MedianDenoiser};
use crate::fsl::{AntsN4, ExternalTools, FslBet, FslMedian, FslPrelude};
use crate::magnitude::{
    derive_mask, BiasCorrector, BrainExtractor, HomogeneityCorrection, ThresholdExtraction,
};
use crate::metadata::{check_delta_te, echo_times, Sidecar};
use crate::nifti_io::{read_nifti_file, save_nifti_to_file};
use crate::phase::{au_to_rads, subtract_phases};
use crate::postprocess::{demean, phdiff_to_fmap, recenter};
use crate::unwrap::{finite_mask, LaplacianUnwrapper, PhaseUnwrapper, RegionGrowUnwrapper};
use crate::utils::mask::count;
use crate::volume::Volume;

/// Echo time difference and whether the inputs arrive in reverse echo order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EchoTiming {
    pub delta_te: f64,
    pub swapped: bool,
}

/// Paths of everything a run wrote
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutputs {
    pub phase1_rads: PathBuf,
    pub phase2_rads: PathBuf,
    pub phasediff: PathBuf,
    pub mag_bias: PathBuf,
    pub mag_brain: PathBuf,
    pub mag_mask: PathBuf,
    pub unwrapped: PathBuf,
    pub recentered: PathBuf,
    pub denoised: PathBuf,
    pub demeaned: PathBuf,
    pub fieldmap: PathBuf,
    pub timing: EchoTiming,
}

struct Magnitude {
    brain: Volume,
    mask: Vec<u8>,
    bias: PathBuf,
    brain_path: PathBuf,
    mask_path: PathBuf,
}

pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Pipeline { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn tools(&self) -> ExternalTools {
        ExternalTools::new(self.config.tools.clone(), self.config.scratch_dir())
    }

    pub fn bias_corrector(&self) -> Box<dyn BiasCorrector> {
        match self.config.bias.backend {
            BiasBackend::N4 => Box::new(AntsN4 { tools: self.tools() }),
            BiasBackend::Homogeneity => Box::new(HomogeneityCorrection {
                sigma_mm: self.config.bias.sigma_mm,
                nbox: self.config.bias.nbox,
            }),
        }
    }

    pub fn brain_extractor(&self) -> Box<dyn BrainExtractor> {
        match self.config.brain.backend {
            BrainBackend::Bet => Box::new(FslBet { tools: self.tools(), frac: self.config.brain.frac }),
            BrainBackend::Threshold => Box::new(ThresholdExtraction { method: self.config.brain.threshold }),
        }
    }

    pub fn unwrapper(&self) -> Box<dyn PhaseUnwrapper> {
        match self.config.unwrap.backend {
            UnwrapBackend::Prelude => Box::new(FslPrelude { tools: self.tools() }),
            UnwrapBackend::RegionGrow => Box::new(RegionGrowUnwrapper),
            UnwrapBackend::Laplacian => Box::new(LaplacianUnwrapper),
        }
    }

    pub fn denoiser(&self) -> Result<Box<dyn Denoiser>> {
        let kernel = self.config.denoise.kernel();
        match (self.config.denoise.backend, kernel) {
            (DenoiseBackend::Native, _) => Ok(Box::new(MedianDenoiser { kernel })),
            (DenoiseBackend::Fslmaths, KernelRadius::Millimetres(radius_mm)) => {
                Ok(Box::new(FslMedian { tools: self.tools(), radius_mm }))
            }
            (DenoiseBackend::Fslmaths, KernelRadius::Voxels(_)) => Err(FmapError::Config(
                "fslmaths sphere kernels are sized in mm".to_string(),
            )),
        }
    }

    /// ΔTE from the configuration, else from the sidecars
    ///
    /// Two per-echo sidecars also fix the echo order; a single sidecar must
    /// carry `EchoTime1`/`EchoTime2` or `EchoTimeDifference`.
    pub fn echo_timing(&self) -> Result<EchoTiming> {
        let inputs = &self.config.inputs;
        let per_echo = match (&inputs.phase1_sidecar, &inputs.phase2_sidecar) {
            (Some(a), Some(b)) => Some(echo_times(&Sidecar::from_file(a)?, &Sidecar::from_file(b)?)?),
            _ => None,
        };
        let swapped = matches!(per_echo, Some((te1, te2)) if te1 > te2);

        let delta_te = match (self.config.delta_te, per_echo, &inputs.phase1_sidecar) {
            (Some(dte), _, _) => dte,
            (None, Some((te1, te2)), _) => (te2 - te1).abs(),
            (None, None, Some(path)) => Sidecar::from_file(path)?.delta_te()?,
            (None, None, None) => {
                return Err(FmapError::MissingEchoTime(
                    "set delta_te or provide echo sidecars".to_string(),
                ))
            }
        };
        Ok(EchoTiming { delta_te: check_delta_te(delta_te)?, swapped })
    }

    fn write(&self, name: &str, vol: &Volume) -> Result<PathBuf> {
        let path = self.config.output_path(name);
        save_nifti_to_file(&path, vol)?;
        debug!(path = %path.display(), "wrote");
        Ok(path)
    }

    /// Stage 1: both echoes to radians
    fn convert_phases(&self) -> Result<(Volume, Volume, PathBuf, PathBuf)> {
        let start = Instant::now();
        let inputs = &self.config.inputs;
        let raw1 = read_nifti_file(&inputs.phase1)?;
        let raw2 = read_nifti_file(&inputs.phase2)?;
        raw1.check_same_grid(&raw2, "phase2")?;

        let scaling = self.config.phase.scaling;
        let rads1 = au_to_rads(&raw1, scaling)?;
        let rads2 = au_to_rads(&raw2, scaling)?;
        let p1 = self.write(&self.config.outputs.phase1_rads, &rads1)?;
        let p2 = self.write(&self.config.outputs.phase2_rads, &rads2)?;

        info!(dims = ?rads1.dims, ?scaling, elapsed = ?start.elapsed(), "phase conversion done");
        Ok((rads1, rads2, p1, p2))
    }

    /// Stage 2: echo2 - echo1
    fn phase_difference(&self, rads1: &Volume, rads2: &Volume, timing: EchoTiming) -> Result<(Volume, PathBuf)> {
        let start = Instant::now();
        let mode = self.config.phase.difference;
        let diff = if timing.swapped {
            warn!("first phase image has the later echo time, swapping echoes");
            subtract_phases(rads2, rads1, mode)?
        } else {
            subtract_phases(rads1, rads2, mode)?
        };
        let path = self.write(&self.config.outputs.phasediff, &diff)?;
        info!(?mode, elapsed = ?start.elapsed(), "phase difference done");
        Ok((diff, path))
    }

    /// Stage 3: bias correction, brain extraction, mask
    fn preprocess_magnitude(&self, grid: &Volume) -> Result<Magnitude> {
        let start = Instant::now();
        let magnitude = read_nifti_file(&self.config.inputs.magnitude)?;
        grid.check_same_grid(&magnitude, "magnitude")?;

        let corrector = self.bias_corrector();
        let corrected = corrector.correct(&magnitude)?;
        let bias = self.write(&self.config.outputs.mag_bias, &corrected)?;
        debug!(backend = corrector.name(), "bias correction done");

        let extractor = self.brain_extractor();
        let extraction = extractor.extract(&corrected)?;
        let brain_path = self.write(&self.config.outputs.mag_brain, &extraction.brain)?;

        let mask = derive_mask(&extraction.brain);
        let voxels = count(&mask);
        if voxels == 0 {
            return Err(FmapError::EmptyMask);
        }
        if voxels != count(&extraction.mask) {
            debug!(
                extractor = count(&extraction.mask),
                derived = voxels,
                "brain image and extractor mask disagree, using the brain image"
            );
        }
        let mask_path = self.write(&self.config.outputs.mag_mask, &extraction.brain.mask_volume(&mask)?)?;

        info!(
            bias = corrector.name(),
            brain = extractor.name(),
            mask_voxels = voxels,
            elapsed = ?start.elapsed(),
            "magnitude preprocessing done"
        );
        Ok(Magnitude { brain: extraction.brain, mask, bias, brain_path, mask_path })
    }

    /// Stage 4: spatial unwrapping
    fn unwrap_phase(&self, brain: &Volume, phasediff: &Volume, mask: &[u8]) -> Result<(Volume, PathBuf)> {
        let start = Instant::now();
        let unwrapper = self.unwrapper();
        let unwrapped = unwrapper.unwrap(brain, phasediff, mask)?;
        let path = self.write(&self.config.outputs.unwrapped, &unwrapped)?;
        info!(backend = unwrapper.name(), elapsed = ?start.elapsed(), "unwrapping done");
        Ok((unwrapped, path))
    }

    pub fn run(&self) -> Result<PipelineOutputs> {
        let total = Instant::now();
        let output_dir = &self.config.output_dir;
        std::fs::create_dir_all(output_dir).map_err(|source| FmapError::Write {
            path: output_dir.clone(),
            source,
        })?;

        let timing = self.echo_timing()?;
        info!(delta_te = timing.delta_te, swapped = timing.swapped, "echo timing");

        let (rads1, rads2, phase1_rads, phase2_rads) = self.convert_phases()?;
        let (phasediff_vol, phasediff) = self.phase_difference(&rads1, &rads2, timing)?;
        let magnitude = self.preprocess_magnitude(&rads1)?;
        // voxels with a non-finite phase difference take no further part
        phasediff_vol.check_mask(&magnitude.mask)?;
        let working_mask = finite_mask(&phasediff_vol.data, &magnitude.mask);
        let dropped = count(&magnitude.mask) - count(&working_mask);
        if dropped > 0 {
            warn!(dropped, "non-finite phase difference voxels excluded");
        }
        let (unwrapped_vol, unwrapped) = self.unwrap_phase(&magnitude.brain, &phasediff_vol, &working_mask)?;

        // stage 5
        let start = Instant::now();
        let mask = Some(working_mask.as_slice());
        let recentered_vol = recenter(&unwrapped_vol, mask)?;
        let recentered = self.write(&self.config.outputs.recentered, &recentered_vol)?;

        let despiked = if self.config.denoise.despike {
            despike_2d(&recentered_vol, self.config.denoise.despike_threshold)?
        } else {
            recentered_vol
        };
        let denoiser = self.denoiser()?;
        let denoised_vol = denoiser.denoise(&despiked, &working_mask)?;
        let denoised = self.write(&self.config.outputs.denoised, &denoised_vol)?;

        let demeaned_vol = demean(&denoised_vol, mask, self.config.demean.statistic)?;
        let demeaned = self.write(&self.config.outputs.demeaned, &demeaned_vol)?;

        let fieldmap_vol = phdiff_to_fmap(&demeaned_vol, timing.delta_te)?;
        let fieldmap = self.write(&self.config.outputs.fieldmap, &fieldmap_vol)?;
        info!(denoise = denoiser.name(), elapsed = ?start.elapsed(), "post-processing done");
        info!(path = %fieldmap.display(), elapsed = ?total.elapsed(), "fieldmap written");

        Ok(PipelineOutputs {
            phase1_rads,
            phase2_rads,
            phasediff,
            mag_bias: magnitude.bias,
            mag_brain: magnitude.brain_path,
            mag_mask: magnitude.mask_path,
            unwrapped,
            recentered,
            denoised,
            demeaned,
            fieldmap,
            timing,
        })
    }
}
