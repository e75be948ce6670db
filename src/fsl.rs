//! External FSL / ANTs backends
//!
//! Each tool is run as a black box: inputs are staged as NIfTI files in a
//! scratch directory, the binary is invoked with captured output, and its
//! result file is read back. FSL tools get `FSLOUTPUTTYPE=NIFTI_GZ` so the
//! output names are predictable.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FmapError, Result};
use crate::filter::Denoiser;
use crate::magnitude::{derive_mask, BiasCorrector, BrainExtraction, BrainExtractor};
use crate::nifti_io::{read_nifti_file, save_nifti_to_file};
use crate::unwrap::{check_inputs, PhaseUnwrapper};
use crate::volume::Volume;

/// Where to find the external binaries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    /// Directory holding `bet`, `prelude` and `fslmaths`; falls back to
    /// `$FSLDIR/bin`, then `PATH`
    pub fsl_dir: Option<PathBuf>,
    /// Directory holding `N4BiasFieldCorrection`; falls back to `PATH`
    pub ants_dir: Option<PathBuf>,
}

fn resolve(dir: Option<&Path>, env_dir: Option<OsString>, name: &str) -> PathBuf {
    match (dir, env_dir) {
        (Some(d), _) => d.join(name),
        (None, Some(root)) if !root.is_empty() => Path::new(&root).join("bin").join(name),
        _ => PathBuf::from(name),
    }
}

/// Runs external tools against a scratch directory
#[derive(Debug, Clone)]
pub struct ExternalTools {
    paths: ToolPaths,
    scratch: PathBuf,
}

impl ExternalTools {
    pub fn new(paths: ToolPaths, scratch: impl Into<PathBuf>) -> Self {
        ExternalTools { paths, scratch: scratch.into() }
    }

    pub fn fsl_binary(&self, name: &str) -> PathBuf {
        resolve(self.paths.fsl_dir.as_deref(), std::env::var_os("FSLDIR"), name)
    }

    pub fn ants_binary(&self, name: &str) -> PathBuf {
        resolve(self.paths.ants_dir.as_deref(), None, name)
    }

    fn scratch_path(&self, file: &str) -> PathBuf {
        self.scratch.join(file)
    }

    /// Write a volume into the scratch directory
    pub fn stage(&self, file: &str, vol: &Volume) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.scratch).map_err(|source| FmapError::Write {
            path: self.scratch.clone(),
            source,
        })?;
        let path = self.scratch_path(file);
        save_nifti_to_file(&path, vol)?;
        Ok(path)
    }

    /// Read a tool's output file, failing with `MissingOutput` if it is absent
    pub fn collect(&self, tool: &str, path: &Path) -> Result<Volume> {
        if !path.exists() {
            return Err(FmapError::MissingOutput { tool: tool.to_string(), path: path.to_path_buf() });
        }
        read_nifti_file(path)
    }

    /// Run `program args...`, capturing output
    pub fn run<I, S>(&self, program: &Path, args: I, fsl: bool) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let tool = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string());

        let mut cmd = Command::new(program);
        cmd.args(args);
        if fsl {
            cmd.env("FSLOUTPUTTYPE", "NIFTI_GZ");
        }
        debug!(command = ?cmd, "running external tool");

        let start = Instant::now();
        let output = cmd
            .output()
            .map_err(|source| FmapError::ToolNotFound { tool: tool.clone(), source })?;
        debug!(tool = %tool, elapsed = ?start.elapsed(), status = %output.status, "external tool finished");

        if !output.status.success() {
            return Err(FmapError::ToolFailed {
                tool,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

fn keep_grid(tool: &str, input: &Volume, output: Volume) -> Result<Volume> {
    input.check_same_grid(&output, &format!("{} output", tool))?;
    Ok(output)
}

/// ANTs `N4BiasFieldCorrection -d 3` with default parameters
#[derive(Debug, Clone)]
pub struct AntsN4 {
    pub tools: ExternalTools,
}

impl BiasCorrector for AntsN4 {
    fn name(&self) -> &'static str {
        "n4"
    }

    fn correct(&self, magnitude: &Volume) -> Result<Volume> {
        let input = self.tools.stage("n4_input.nii.gz", magnitude)?;
        let output = self.tools.scratch_path("n4_corrected.nii.gz");
        let program = self.tools.ants_binary("N4BiasFieldCorrection");

        let args: [&OsStr; 6] = ["-d".as_ref(), "3".as_ref(), "-i".as_ref(), input.as_os_str(), "-o".as_ref(), output.as_os_str()];
        self.tools.run(&program, args, false)?;
        keep_grid("N4BiasFieldCorrection", magnitude, self.tools.collect("N4BiasFieldCorrection", &output)?)
    }
}

/// FSL `bet <in> <out> -f <frac> -m`
#[derive(Debug, Clone)]
pub struct FslBet {
    pub tools: ExternalTools,
    /// Fractional intensity threshold in (0, 1)
    pub frac: f64,
}

impl BrainExtractor for FslBet {
    fn name(&self) -> &'static str {
        "bet"
    }

    fn extract(&self, magnitude: &Volume) -> Result<BrainExtraction> {
        let input = self.tools.stage("bet_input.nii.gz", magnitude)?;
        let base = self.tools.scratch_path("bet_brain");
        let program = self.tools.fsl_binary("bet");

        let frac = self.frac.to_string();
        let args: [&OsStr; 5] = [input.as_os_str(), base.as_os_str(), "-f".as_ref(), frac.as_ref(), "-m".as_ref()];
        self.tools.run(&program, args, true)?;

        let brain = self.tools.collect("bet", &self.tools.scratch_path("bet_brain.nii.gz"))?;
        let brain = keep_grid("bet", magnitude, brain)?;

        let mask_path = self.tools.scratch_path("bet_brain_mask.nii.gz");
        let mask = if mask_path.exists() {
            derive_mask(&keep_grid("bet", magnitude, read_nifti_file(&mask_path)?)?)
        } else {
            warn!(path = %mask_path.display(), "bet wrote no mask, deriving it from the brain image");
            derive_mask(&brain)
        };
        Ok(BrainExtraction { brain, mask })
    }
}

/// FSL `prelude -a <mag> -p <phase> -m <mask> -o <out>`
#[derive(Debug, Clone)]
pub struct FslPrelude {
    pub tools: ExternalTools,
}

impl PhaseUnwrapper for FslPrelude {
    fn name(&self) -> &'static str {
        "prelude"
    }

    fn unwrap(&self, magnitude: &Volume, phase: &Volume, mask: &[u8]) -> Result<Volume> {
        let mask = check_inputs(magnitude, phase, mask)?;
        let mag_path = self.tools.stage("prelude_magnitude.nii.gz", magnitude)?;
        let finite = phase.map(|v| if v.is_finite() { v } else { 0.0 });
        let phase_path = self.tools.stage("prelude_phase.nii.gz", &finite)?;
        let mask_path = self.tools.stage("prelude_mask.nii.gz", &phase.mask_volume(&mask)?)?;
        let output = self.tools.scratch_path("prelude_unwrapped.nii.gz");
        let program = self.tools.fsl_binary("prelude");

        let args: [&OsStr; 8] = [
            "-a".as_ref(), mag_path.as_os_str(),
            "-p".as_ref(), phase_path.as_os_str(),
            "-m".as_ref(), mask_path.as_os_str(),
            "-o".as_ref(), output.as_os_str(),
        ];
        self.tools.run(&program, args, true)?;

        let mut unwrapped = keep_grid("prelude", phase, self.tools.collect("prelude", &output)?)?;
        for (v, &m) in unwrapped.data.iter_mut().zip(&mask) {
            if m == 0 {
                *v = 0.0;
            }
        }
        Ok(unwrapped)
    }
}

/// FSL `fslmaths <in> -kernel sphere <r> -fmedian <out>`
#[derive(Debug, Clone)]
pub struct FslMedian {
    pub tools: ExternalTools,
    pub radius_mm: f64,
}

impl Denoiser for FslMedian {
    fn name(&self) -> &'static str {
        "fslmaths"
    }

    fn denoise(&self, phase: &Volume, mask: &[u8]) -> Result<Volume> {
        phase.check_mask(mask)?;
        let input = self.tools.stage("fslmaths_input.nii.gz", phase)?;
        let output = self.tools.scratch_path("fslmaths_median.nii.gz");
        let program = self.tools.fsl_binary("fslmaths");

        let radius = self.radius_mm.to_string();
        let args: [&OsStr; 6] = [
            input.as_os_str(), "-kernel".as_ref(), "sphere".as_ref(), radius.as_ref(),
            "-fmedian".as_ref(), output.as_os_str(),
        ];
        self.tools.run(&program, args, true)?;

        let mut filtered = keep_grid("fslmaths", phase, self.tools.collect("fslmaths", &output)?)?;
        for (v, &m) in filtered.data.iter_mut().zip(mask) {
            if m == 0 {
                *v = 0.0;
            }
        }
        Ok(filtered)
    }
}
