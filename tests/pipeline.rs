//! End-to-end runs of the native pipeline on a synthetic sphere phantom

mod common;

use std::path::Path;

use common::{correlation, rmse, write_phantom, Phantom, PhantomFiles, AU_MAX};
use fmap_core::config::UnwrapBackend;
use fmap_core::nifti_io::{read_nifti_file, save_nifti_to_file};
use fmap_core::phase::PhaseScaling;
use fmap_core::volume::idx3d;
use fmap_core::{FmapError, Pipeline, PipelineConfig};

fn native_config(files: &PhantomFiles, out: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.use_native_backends();
    config.output_dir = out.to_path_buf();
    config.inputs.phase1 = files.phase1.clone();
    config.inputs.phase2 = files.phase2.clone();
    config.inputs.magnitude = files.magnitude.clone();
    config.inputs.phase1_sidecar = Some(files.sidecar1.clone());
    config.inputs.phase2_sidecar = Some(files.sidecar2.clone());
    config.phase.scaling = PhaseScaling::ScannerRange { min: 0.0, max: AU_MAX };
    config
}

/// Fieldmap difference between two voxels well inside the object
fn interior_step(data: &[f64], dims: (usize, usize, usize)) -> f64 {
    let (nx, ny, _) = dims;
    data[idx3d(16, 12, 12, nx, ny)] - data[idx3d(8, 12, 12, nx, ny)]
}

#[test]
fn test_native_pipeline_recovers_linear_field() {
    let dir = tempfile::tempdir().unwrap();
    let phantom = Phantom::default();
    let files = write_phantom(&phantom, dir.path());
    let out = dir.path().join("out");

    let outputs = Pipeline::new(native_config(&files, &out)).unwrap().run().unwrap();
    assert!(!outputs.timing.swapped);
    assert!((outputs.timing.delta_te - 0.00246).abs() < 1e-9);

    for path in [
        &outputs.phase1_rads,
        &outputs.phase2_rads,
        &outputs.phasediff,
        &outputs.mag_bias,
        &outputs.mag_brain,
        &outputs.mag_mask,
        &outputs.unwrapped,
        &outputs.recentered,
        &outputs.denoised,
        &outputs.demeaned,
        &outputs.fieldmap,
    ] {
        assert!(path.exists(), "missing output {}", path.display());
        assert!(path.starts_with(&out));
    }

    let mask_vol = read_nifti_file(&outputs.mag_mask).unwrap();
    assert!(mask_vol.data.iter().all(|&v| v == 0.0 || v == 1.0));
    let mask: Vec<u8> = mask_vol.data.iter().map(|&v| u8::from(v > 0.0)).collect();
    let inside = mask.iter().filter(|&&m| m > 0).count();
    let sphere = phantom.mask().iter().filter(|&&m| m > 0).count();
    assert!(inside > sphere / 2, "mask too small: {} of {}", inside, sphere);

    let fieldmap = read_nifti_file(&outputs.fieldmap).unwrap();
    let truth = phantom.field();

    // Offset-free comparison in the interior, where the median kernel is whole
    let step = interior_step(&fieldmap.data, fieldmap.dims);
    let expected = interior_step(&truth.data, truth.dims);
    assert!((step - expected).abs() < 0.05, "step {} vs {}", step, expected);

    assert!(correlation(&fieldmap.data, &truth.data, &mask) > 0.95);
    for (v, &m) in fieldmap.data.iter().zip(&mask) {
        if m == 0 {
            assert_eq!(*v, 0.0);
        }
    }

    // Demeaned output has zero mean in the mask
    let mean: f64 = fieldmap.data.iter().zip(&mask).filter(|(_, &m)| m > 0).map(|(v, _)| v).sum::<f64>()
        / inside as f64;
    assert!(mean.abs() < 1e-3);
}

#[test]
fn test_reversed_echoes_give_same_fieldmap() {
    let dir = tempfile::tempdir().unwrap();
    let phantom = Phantom::default();
    let files = write_phantom(&phantom, dir.path());

    let forward = Pipeline::new(native_config(&files, &dir.path().join("forward")))
        .unwrap()
        .run()
        .unwrap();

    let mut config = native_config(&files, &dir.path().join("reversed"));
    std::mem::swap(&mut config.inputs.phase1, &mut config.inputs.phase2);
    std::mem::swap(&mut config.inputs.phase1_sidecar, &mut config.inputs.phase2_sidecar);
    let reversed = Pipeline::new(config).unwrap().run().unwrap();
    assert!(reversed.timing.swapped);

    let a = read_nifti_file(&forward.fieldmap).unwrap();
    let b = read_nifti_file(&reversed.fieldmap).unwrap();
    let mask: Vec<u8> = a.data.iter().map(|&v| u8::from(v != 0.0)).collect();
    assert!(rmse(&a.data, &b.data, &mask) < 1e-3);
}

#[test]
fn test_delta_te_override_scales_fieldmap() {
    let dir = tempfile::tempdir().unwrap();
    let phantom = Phantom::default();
    let files = write_phantom(&phantom, dir.path());

    let mut config = native_config(&files, &dir.path().join("out"));
    config.delta_te = Some(0.00492);
    config.inputs.phase1_sidecar = None;
    config.inputs.phase2_sidecar = None;
    let outputs = Pipeline::new(config).unwrap().run().unwrap();

    let fieldmap = read_nifti_file(&outputs.fieldmap).unwrap();
    let truth = phantom.field();
    let step = interior_step(&fieldmap.data, fieldmap.dims);
    let expected = interior_step(&truth.data, truth.dims) / 2.0;
    assert!((step - expected).abs() < 0.05, "step {} vs {}", step, expected);
}

#[test]
fn test_laplacian_backend_matches_region_growing() {
    let dir = tempfile::tempdir().unwrap();
    let phantom = Phantom::default();
    let files = write_phantom(&phantom, dir.path());

    let grown = Pipeline::new(native_config(&files, &dir.path().join("grown")))
        .unwrap()
        .run()
        .unwrap();
    let mut config = native_config(&files, &dir.path().join("laplacian"));
    config.unwrap.backend = UnwrapBackend::Laplacian;
    let solved = Pipeline::new(config).unwrap().run().unwrap();

    let fieldmap = read_nifti_file(&solved.fieldmap).unwrap();
    let truth = phantom.field();
    let step = interior_step(&fieldmap.data, fieldmap.dims);
    let expected = interior_step(&truth.data, truth.dims);
    assert!((step - expected).abs() < 0.05, "step {} vs {}", step, expected);

    let reference = read_nifti_file(&grown.fieldmap).unwrap();
    let mask: Vec<u8> = read_nifti_file(&grown.mag_mask)
        .unwrap()
        .data
        .iter()
        .map(|&v| u8::from(v > 0.0))
        .collect();
    assert!(rmse(&fieldmap.data, &reference.data, &mask) < 1e-3);
}

#[test]
fn test_nan_phase_voxel_stays_local() {
    let dir = tempfile::tempdir().unwrap();
    let phantom = Phantom::default();
    let files = write_phantom(&phantom, dir.path());

    let mut phase1 = read_nifti_file(&files.phase1).unwrap();
    let (nx, ny, _) = phase1.dims;
    let bad = idx3d(12, 14, 12, nx, ny);
    phase1.data[bad] = f64::NAN;
    save_nifti_to_file(&files.phase1, &phase1).unwrap();

    let outputs = Pipeline::new(native_config(&files, &dir.path().join("out")))
        .unwrap()
        .run()
        .unwrap();
    let fieldmap = read_nifti_file(&outputs.fieldmap).unwrap();
    assert!(fieldmap.data.iter().all(|v| v.is_finite()));
    assert_eq!(fieldmap.data[bad], 0.0);

    let truth = phantom.field();
    let step = interior_step(&fieldmap.data, fieldmap.dims);
    let expected = interior_step(&truth.data, truth.dims);
    assert!((step - expected).abs() < 0.05, "step {} vs {}", step, expected);
}

#[test]
fn test_missing_input_names_path() {
    let dir = tempfile::tempdir().unwrap();
    let phantom = Phantom::default();
    let mut files = write_phantom(&phantom, dir.path());
    files.magnitude = dir.path().join("absent.nii.gz");

    let err = Pipeline::new(native_config(&files, &dir.path().join("out")))
        .unwrap()
        .run()
        .unwrap_err();
    match err {
        FmapError::Read { path, .. } => assert_eq!(path, files.magnitude),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_grid_mismatch_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let files = write_phantom(&Phantom::default(), dir.path());
    let small = Phantom { dims: (20, 20, 20), radius: 8.0, peak_hz: 100.0 };
    fmap_core::nifti_io::save_nifti_to_file(&files.magnitude, &small.magnitude()).unwrap();

    let err = Pipeline::new(native_config(&files, &dir.path().join("out")))
        .unwrap()
        .run()
        .unwrap_err();
    assert!(matches!(err, FmapError::GridMismatch { .. }), "got {}", err);
}

#[test]
fn test_pipeline_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let files = write_phantom(&Phantom::default(), dir.path());
    let out = dir.path().join("from-file");

    let toml = format!(
        r#"
output_dir = "{out}"
delta_te = 0.00246

[inputs]
phase1 = "{p1}"
phase2 = "{p2}"
magnitude = "{mag}"

[phase.scaling]
mode = "scanner-range"
min = 0.0
max = 4096.0

[bias]
backend = "homogeneity"

[brain]
backend = "threshold"

[unwrap]
backend = "region-grow"

[denoise]
backend = "native"
radius = 1.0
radius_unit = "voxels"

[demean]
statistic = "median"

[outputs]
fieldmap = "b0_hz.nii.gz"
"#,
        out = out.display(),
        p1 = files.phase1.display(),
        p2 = files.phase2.display(),
        mag = files.magnitude.display(),
    );
    let config_path = dir.path().join("fmap.toml");
    std::fs::write(&config_path, toml).unwrap();

    let config = PipelineConfig::from_file(&config_path).unwrap();
    assert!(config.all_native());
    let outputs = Pipeline::new(config).unwrap().run().unwrap();
    assert_eq!(outputs.fieldmap, out.join("b0_hz.nii.gz"));
    assert!(outputs.fieldmap.exists());
}
