//! NIfTI-1 volume I/O
//!
//! Reads `.nii` and `.nii.gz` (gzip is detected from the magic bytes, not the
//! extension) into a [`Volume`], and writes float32 NIfTI-1 single files.

use std::io::{Cursor, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array;
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};
use tracing::debug;

use crate::error::{FmapError, Result};
use crate::volume::Volume;

const HEADER_SIZE: usize = 348;
const VOX_OFFSET: usize = 352;

/// Check if bytes are gzip compressed
fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Summarise the raw header fields that usually explain a failed decode
fn describe_header(bytes: &[u8]) -> String {
    if bytes.len() < HEADER_SIZE {
        return format!("file too small ({} bytes, need at least {})", bytes.len(), HEADER_SIZE);
    }

    let sizeof_hdr = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let datatype = i16::from_le_bytes([bytes[70], bytes[71]]);
    let magic = String::from_utf8_lossy(&bytes[344..348]).to_string();

    format!("sizeof_hdr={}, magic='{}', datatype={}", sizeof_hdr, magic, datatype)
}

fn decode(bytes: &[u8]) -> Result<InMemNiftiObject> {
    if is_gzip(bytes) {
        InMemNiftiObject::from_reader(GzDecoder::new(Cursor::new(bytes))).map_err(|e| {
            let mut raw = Vec::new();
            let info = match GzDecoder::new(Cursor::new(bytes)).read_to_end(&mut raw) {
                Ok(_) => describe_header(&raw),
                Err(_) => "could not decompress".to_string(),
            };
            FmapError::Nifti(format!("gzipped volume: {} ({})", e, info))
        })
    } else {
        InMemNiftiObject::from_reader(Cursor::new(bytes))
            .map_err(|e| FmapError::Nifti(format!("{} ({})", e, describe_header(bytes))))
    }
}

/// Rotation-plus-offset transform encoded by the qform quaternion
fn qform_affine(header: &NiftiHeader) -> [f64; 16] {
    let (b, c, d) = (header.quatern_b as f64, header.quatern_c as f64, header.quatern_d as f64);
    let a = (1.0 - b * b - c * c - d * d).max(0.0).sqrt();
    let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
    let scale = [
        header.pixdim[1] as f64,
        header.pixdim[2] as f64,
        qfac * header.pixdim[3] as f64,
    ];
    let rotation = [
        [a * a + b * b - c * c - d * d, 2.0 * (b * c - a * d), 2.0 * (b * d + a * c)],
        [2.0 * (b * c + a * d), a * a + c * c - b * b - d * d, 2.0 * (c * d - a * b)],
        [2.0 * (b * d - a * c), 2.0 * (c * d + a * b), a * a + d * d - c * c - b * b],
    ];
    let offset = [header.quatern_x as f64, header.quatern_y as f64, header.quatern_z as f64];

    let mut affine = [0.0; 16];
    for row in 0..3 {
        for col in 0..3 {
            affine[row * 4 + col] = rotation[row][col] * scale[col];
        }
        affine[row * 4 + 3] = offset[row];
    }
    affine[15] = 1.0;
    affine
}

/// Voxel-to-world transform from the header: sform, then qform, then pixdim
fn header_affine(header: &NiftiHeader) -> [f64; 16] {
    if header.sform_code > 0 {
        let mut affine = [0.0; 16];
        for (row, srow) in [header.srow_x, header.srow_y, header.srow_z].iter().enumerate() {
            for (col, &v) in srow.iter().enumerate() {
                affine[row * 4 + col] = v as f64;
            }
        }
        affine[15] = 1.0;
        affine
    } else if header.qform_code > 0 {
        qform_affine(header)
    } else {
        crate::volume::scaled_affine((
            header.pixdim[1] as f64,
            header.pixdim[2] as f64,
            header.pixdim[3] as f64,
        ))
    }
}

/// Decode a NIfTI volume from bytes
///
/// 4D inputs keep only the first volume.
pub fn load_nifti(bytes: &[u8]) -> Result<Volume> {
    let obj = decode(bytes)?;
    let header = obj.header();

    let ndim = header.dim[0] as usize;
    if ndim < 3 {
        return Err(FmapError::Nifti(format!("expected at least a 3D volume, got {}D", ndim)));
    }

    let voxel_size = (
        header.pixdim[1] as f64,
        header.pixdim[2] as f64,
        header.pixdim[3] as f64,
    );
    let affine = header_affine(header);

    let array: Array<f64, _> = obj
        .into_volume()
        .into_ndarray()
        .map_err(|e| FmapError::Nifti(format!("failed to convert to ndarray: {}", e)))?;

    // nifti-rs may reorder, so trust the array shape over the header dims
    let shape = array.shape().to_vec();
    if shape.len() < 3 {
        return Err(FmapError::Nifti(format!("expected at least a 3D array, got {}D", shape.len())));
    }
    let dims = (shape[0], shape[1], shape[2]);

    // Trailing axes are pinned at 0, so a 4D series yields its first volume
    let mut index = vec![0usize; shape.len()];
    let mut data = Vec::with_capacity(dims.0 * dims.1 * dims.2);
    for k in 0..dims.2 {
        for j in 0..dims.1 {
            for i in 0..dims.0 {
                index[0] = i;
                index[1] = j;
                index[2] = k;
                data.push(array[index.as_slice()]);
            }
        }
    }

    Volume::new(data, dims, voxel_size, affine)
}

/// Encode a volume as uncompressed float32 NIfTI-1 bytes
pub fn save_nifti(volume: &Volume) -> Result<Vec<u8>> {
    let (nx, ny, nz) = volume.dims;
    let (vsx, vsy, vsz) = volume.voxel_size;
    if nx > i16::MAX as usize || ny > i16::MAX as usize || nz > i16::MAX as usize {
        return Err(FmapError::Nifti(format!("dimensions {:?} exceed NIfTI-1 limits", volume.dims)));
    }

    let mut header = [0u8; HEADER_SIZE];
    let mut put = |offset: usize, bytes: &[u8]| {
        header[offset..offset + bytes.len()].copy_from_slice(bytes);
    };

    put(0, &(HEADER_SIZE as i32).to_le_bytes());

    let dim: [i16; 8] = [3, nx as i16, ny as i16, nz as i16, 1, 1, 1, 1];
    for (i, d) in dim.iter().enumerate() {
        put(40 + i * 2, &d.to_le_bytes());
    }

    // FLOAT32, 32 bits per voxel
    put(70, &16i16.to_le_bytes());
    put(72, &32i16.to_le_bytes());

    let pixdim: [f32; 8] = [1.0, vsx as f32, vsy as f32, vsz as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, p) in pixdim.iter().enumerate() {
        put(76 + i * 4, &p.to_le_bytes());
    }

    put(108, &(VOX_OFFSET as f32).to_le_bytes());
    put(112, &1.0f32.to_le_bytes());
    put(116, &0.0f32.to_le_bytes());

    // xyzt_units: mm + sec
    put(123, &[2u8 | 8]);

    // sform_code = scanner anat
    put(254, &1i16.to_le_bytes());
    for row in 0..3 {
        for col in 0..4 {
            put(280 + row * 16 + col * 4, &(volume.affine[row * 4 + col] as f32).to_le_bytes());
        }
    }

    put(344, b"n+1\0");

    let mut buffer = Vec::with_capacity(VOX_OFFSET + volume.data.len() * 4);
    buffer.extend_from_slice(&header);
    // empty extension block
    buffer.extend_from_slice(&[0u8; 4]);
    for &v in &volume.data {
        buffer.extend_from_slice(&(v as f32).to_le_bytes());
    }

    Ok(buffer)
}

/// Encode a volume as gzipped NIfTI-1 bytes (.nii.gz)
pub fn save_nifti_gz(volume: &Volume) -> Result<Vec<u8>> {
    let raw = save_nifti(volume)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&raw)
        .and_then(|_| encoder.finish())
        .map_err(|e| FmapError::Nifti(format!("gzip compression failed: {}", e)))
}

/// Read a NIfTI file from disk
pub fn read_nifti_file(path: &Path) -> Result<Volume> {
    let bytes = std::fs::read(path).map_err(|source| FmapError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let volume = load_nifti(&bytes).map_err(|e| match e {
        FmapError::Nifti(msg) => FmapError::Nifti(format!("{}: {}", path.display(), msg)),
        other => other,
    })?;
    debug!(path = %path.display(), dims = ?volume.dims, "read volume");
    Ok(volume)
}

/// Write a volume to disk, gzip compressed when the path ends in `.nii.gz`
pub fn save_nifti_to_file(path: &Path, volume: &Volume) -> Result<()> {
    let bytes = if path.to_string_lossy().ends_with(".nii.gz") {
        save_nifti_gz(volume)?
    } else {
        save_nifti(volume)?
    };

    std::fs::write(path, &bytes).map_err(|source| FmapError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "wrote volume");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::scaled_affine;

    fn ramp(dims: (usize, usize, usize), voxel_size: (f64, f64, f64)) -> Volume {
        Volume::from_fn(dims, voxel_size, |i, j, k| (i + 3 * j + 7 * k) as f64 * 0.5 - 4.0)
    }

    #[test]
    fn test_gzip_detection() {
        assert!(is_gzip(&[0x1f, 0x8b, 0x00]));
        assert!(!is_gzip(&[0x00, 0x00, 0x00]));
        assert!(!is_gzip(&[0x1f]));
    }

    #[test]
    fn test_affine_without_sform_uses_pixdim() {
        let mut header = NiftiHeader::default();
        header.pixdim[1] = 1.0;
        header.pixdim[2] = 2.0;
        header.pixdim[3] = 3.0;
        header.sform_code = 0;
        header.qform_code = 0;

        let affine = header_affine(&header);
        assert_eq!(affine, scaled_affine((1.0, 2.0, 3.0)));
    }

    #[test]
    fn test_affine_qform_when_sform_unset() {
        let mut header = NiftiHeader::default();
        header.sform_code = 0;
        header.qform_code = 1;
        header.pixdim = [1.0, 2.0, 2.0, 3.0, 1.0, 1.0, 1.0, 1.0];
        // 180 degrees about z
        header.quatern_b = 0.0;
        header.quatern_c = 0.0;
        header.quatern_d = 1.0;
        header.quatern_x = 10.0;
        header.quatern_y = 20.0;
        header.quatern_z = -5.0;

        let expected = [
            -2.0, 0.0, 0.0, 10.0,
            0.0, -2.0, 0.0, 20.0,
            0.0, 0.0, 3.0, -5.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        let affine = header_affine(&header);
        for (a, e) in affine.iter().zip(expected) {
            assert!((a - e).abs() < 1e-9, "{:?}", affine);
        }

        header.pixdim[0] = -1.0;
        assert!((header_affine(&header)[10] + 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_load_qform_only_file() {
        let vol = ramp((3, 3, 3), (2.0, 2.0, 2.0));
        let mut bytes = save_nifti(&vol).unwrap();
        bytes[254..256].copy_from_slice(&0i16.to_le_bytes());
        bytes[252..254].copy_from_slice(&1i16.to_le_bytes());
        // identity rotation, shifted origin
        for (offset, v) in [(268, 7.0f32), (272, -3.0), (276, 1.5)] {
            bytes[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
        }

        let loaded = load_nifti(&bytes).unwrap();
        assert_eq!(loaded.affine[0], 2.0);
        assert_eq!(loaded.affine[3], 7.0);
        assert_eq!(loaded.affine[7], -3.0);
        assert_eq!(loaded.affine[11], 1.5);
    }

    #[test]
    fn test_4d_input_keeps_first_volume() {
        // two 2x2x2 volumes stored back to back
        let series = Volume::from_fn((2, 2, 4), (1.0, 1.0, 1.0), |i, j, k| (i + 2 * j + 4 * k) as f64);
        let mut bytes = save_nifti(&series).unwrap();
        for (slot, d) in [(0usize, 4i16), (3, 2), (4, 2)] {
            bytes[40 + slot * 2..42 + slot * 2].copy_from_slice(&d.to_le_bytes());
        }

        let loaded = load_nifti(&bytes).unwrap();
        assert_eq!(loaded.dims, (2, 2, 2));
        let expected: Vec<f64> = (0..8).map(f64::from).collect();
        assert_eq!(loaded.data, expected);
    }

    #[test]
    fn test_affine_sform() {
        let mut header = NiftiHeader::default();
        header.sform_code = 1;
        header.srow_x = [1.0, 0.0, 0.0, 10.0];
        header.srow_y = [0.0, 2.0, 0.0, 20.0];
        header.srow_z = [0.0, 0.0, 3.0, 30.0];

        let affine = header_affine(&header);
        assert_eq!(affine[3], 10.0);
        assert_eq!(affine[5], 2.0);
        assert_eq!(affine[11], 30.0);
        assert_eq!(affine[15], 1.0);
    }

    #[test]
    fn test_header_fields() {
        let vol = ramp((2, 3, 4), (1.5, 2.5, 3.5));
        let bytes = save_nifti(&vol).unwrap();

        assert_eq!(bytes.len(), VOX_OFFSET + 24 * 4);
        assert_eq!(&bytes[344..348], b"n+1\0");
        assert_eq!(i16::from_le_bytes([bytes[70], bytes[71]]), 16);
        assert_eq!(i16::from_le_bytes([bytes[42], bytes[43]]), 2);
        assert_eq!(i16::from_le_bytes([bytes[46], bytes[47]]), 4);
        let pixdim1 = f32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]);
        assert!((pixdim1 - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_file_roundtrip_keeps_grid_and_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut vol = ramp((4, 5, 6), (1.0, 2.0, 3.0));
        vol.affine[3] = -12.5;
        vol.affine[1] = 0.25;

        for name in ["vol.nii", "vol.nii.gz"] {
            let path = dir.path().join(name);
            save_nifti_to_file(&path, &vol).unwrap();
            let loaded = read_nifti_file(&path).unwrap();

            assert_eq!(loaded.dims, vol.dims);
            assert!((loaded.voxel_size.2 - 3.0).abs() < 1e-6);
            for (a, b) in loaded.affine.iter().zip(vol.affine.iter()) {
                assert!((a - b).abs() < 1e-5);
            }
            for (a, b) in loaded.data.iter().zip(vol.data.iter()) {
                assert!((a - b).abs() < 1e-5, "{} != {}", a, b);
            }
        }
    }

    #[test]
    fn test_gz_path_is_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.nii.gz");
        save_nifti_to_file(&path, &ramp((2, 2, 2), (1.0, 1.0, 1.0))).unwrap();
        assert!(is_gzip(&std::fs::read(&path).unwrap()));
    }

    #[test]
    fn test_invalid_bytes_error() {
        assert!(matches!(load_nifti(&[0u8; 10]), Err(FmapError::Nifti(_))));
        assert!(load_nifti(&[0x1f, 0x8b, 0x00, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_describe_header() {
        assert!(describe_header(&[0u8; 10]).contains("too small"));

        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&348i32.to_le_bytes());
        bytes[70..72].copy_from_slice(&16i16.to_le_bytes());
        let info = describe_header(&bytes);
        assert!(info.contains("sizeof_hdr=348"));
        assert!(info.contains("datatype=16"));
    }

    #[test]
    fn test_missing_file_names_path() {
        let err = read_nifti_file(Path::new("/nonexistent/phase1.nii.gz")).unwrap_err();
        assert!(matches!(err, FmapError::Read { .. }));
        assert!(err.to_string().contains("phase1.nii.gz"));
    }
}
