//! NIfTI-1 volumes (`.nii`, `.nii.gz`) on top of the `nifti` crate.
//!
//! The crate keeps voxels row-major with the file's axis order, and describes
//! placement in world space with a 4x4 affine; this module converts between
//! that and the NIfTI header fields.

use std::fs;
use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use nifti::{writer::WriterOptions, IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use crate::data::models::{Affine, Volume, IDENTITY_AFFINE};
use crate::error::{Result, VolsegError};

const MAX_DIMS: usize = 7;
/// Single-file NIfTI-1 header plus the extension flag
const MIN_VOX_OFFSET: f32 = 352.0;
/// Upper bound of deflate's expansion ratio, used to bound `.gz` payloads
const MAX_DEFLATE_RATIO: u64 = 1032;
/// sform_code written for affines we produce ("aligned")
const SFORM_ALIGNED: i16 = 2;

/// Voxel type used when writing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NiftiDataType {
    UInt8,
    Int16,
    Int32,
    Float32,
}

impl NiftiDataType {
    /// NIfTI-1 `datatype` code
    pub fn code(self) -> i16 {
        match self {
            NiftiDataType::UInt8 => 2,
            NiftiDataType::Int16 => 4,
            NiftiDataType::Int32 => 8,
            NiftiDataType::Float32 => 16,
        }
    }
}

/// A decoded NIfTI file
#[derive(Debug, Clone)]
pub struct NiftiImage {
    pub header: NiftiHeader,
    pub volume: Volume,
}

impl NiftiImage {
    pub fn affine(&self) -> Affine {
        header_affine(&self.header)
    }

    pub fn spacing(&self) -> Vec<f32> {
        header_spacing(&self.header)
    }
}

fn nifti_error(path: &Path, err: impl std::fmt::Display) -> VolsegError {
    VolsegError::nifti(format!("{}: {}", path.display(), err))
}

fn header_rank(header: &NiftiHeader) -> usize {
    usize::try_from(header.dim[0]).unwrap_or(0).min(MAX_DIMS)
}

/// Voxel spacing of the (up to three) spatial axes
pub fn header_spacing(header: &NiftiHeader) -> Vec<f32> {
    header.pixdim[1..=header_rank(header).clamp(1, 3)]
        .iter()
        .map(|&p| if p > 0.0 { p } else { 1.0 })
        .collect()
}

/// Voxel-to-world transform: sform, then qform, then plain spacing
pub fn header_affine(header: &NiftiHeader) -> Affine {
    let mut affine = IDENTITY_AFFINE;

    if header.sform_code > 0 {
        for (row, values) in [header.srow_x, header.srow_y, header.srow_z]
            .iter()
            .enumerate()
        {
            for (col, v) in values.iter().enumerate() {
                affine[row][col] = *v as f64;
            }
        }
        return affine;
    }

    let mut spacing = [1.0f64; 3];
    for (axis, s) in header_spacing(header).iter().enumerate() {
        spacing[axis] = *s as f64;
    }

    if header.qform_code > 0 {
        let [b, c, d] = [header.quatern_b, header.quatern_c, header.quatern_d].map(f64::from);
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let rotation = [
            [
                a * a + b * b - c * c - d * d,
                2.0 * (b * c - a * d),
                2.0 * (b * d + a * c),
            ],
            [
                2.0 * (b * c + a * d),
                a * a + c * c - b * b - d * d,
                2.0 * (c * d - a * b),
            ],
            [
                2.0 * (b * d - a * c),
                2.0 * (c * d + a * b),
                a * a + d * d - c * c - b * b,
            ],
        ];
        spacing[2] *= qfac;
        let offset = [header.quatern_x, header.quatern_y, header.quatern_z];
        for row in 0..3 {
            for col in 0..3 {
                affine[row][col] = rotation[row][col] * spacing[col];
            }
            affine[row][3] = offset[row] as f64;
        }
        return affine;
    }

    for (axis, s) in spacing.iter().enumerate() {
        affine[axis][axis] = *s;
    }
    affine
}

/// Header describing a volume of `shape` with an sform taken from `affine`
pub fn header_for(shape: &[usize], affine: &Affine) -> Result<NiftiHeader> {
    if shape.is_empty() || shape.len() > MAX_DIMS {
        return Err(VolsegError::nifti(format!(
            "NIfTI-1 supports 1 to {} dimensions, got {:?}",
            MAX_DIMS, shape
        )));
    }
    if shape.iter().any(|&d| d == 0 || d > i16::MAX as usize) {
        return Err(VolsegError::nifti(format!(
            "dimension out of range in {:?}",
            shape
        )));
    }

    let mut pixdim = [1.0f32; 8];
    for (axis, spacing) in pixdim.iter_mut().skip(1).take(3).enumerate() {
        let norm = (0..3).map(|row| affine[row][axis].powi(2)).sum::<f64>().sqrt();
        if norm > 0.0 {
            *spacing = norm as f32;
        }
    }

    let row = |r: usize| affine[r].map(|v| v as f32);

    Ok(NiftiHeader {
        pixdim,
        scl_slope: 1.0,
        scl_inter: 0.0,
        qform_code: 0,
        sform_code: SFORM_ALIGNED,
        srow_x: row(0),
        srow_y: row(1),
        srow_z: row(2),
        descrip: b"volseg".to_vec(),
        ..Default::default()
    })
}

/// Reject headers whose voxel payload cannot fit in the file at `path`.
///
/// Runs before any voxel is read, so absurd dimensions or offsets become an
/// error instead of an overflow or a huge allocation.
fn check_payload(header: &NiftiHeader, path: &Path) -> Result<()> {
    let rank = usize::try_from(header.dim[0]).unwrap_or(0);
    if !(1..=MAX_DIMS).contains(&rank) {
        return Err(nifti_error(path, format!("invalid dim[0] = {}", header.dim[0])));
    }

    let voxels = header.dim[1..=rank]
        .iter()
        .try_fold(1u64, |acc, &extent| {
            let extent = u64::try_from(extent).ok().filter(|&e| e > 0)?;
            acc.checked_mul(extent)
        })
        .ok_or_else(|| nifti_error(path, format!("invalid dimensions {:?}", header.dim)))?;

    if header.bitpix <= 0 || header.bitpix % 8 != 0 {
        return Err(nifti_error(path, format!("invalid bitpix {}", header.bitpix)));
    }
    let payload = voxels
        .checked_mul((header.bitpix / 8) as u64)
        .ok_or_else(|| nifti_error(path, "voxel payload size overflows"))?;

    let offset = header.vox_offset;
    if !offset.is_finite() || offset < 0.0 {
        return Err(nifti_error(path, format!("invalid vox_offset {}", offset)));
    }
    let file_len = fs::metadata(path)?.len();
    let offset = offset.max(MIN_VOX_OFFSET) as u64;
    if offset > file_len.saturating_mul(MAX_DEFLATE_RATIO) {
        return Err(nifti_error(
            path,
            format!("vox_offset {} lies beyond the end of the file", offset),
        ));
    }

    let end = offset
        .checked_add(payload)
        .ok_or_else(|| nifti_error(path, "voxel payload size overflows"))?;
    let available = if is_gz(path) {
        file_len.saturating_mul(MAX_DEFLATE_RATIO)
    } else {
        file_len
    };
    if end > available {
        return Err(nifti_error(
            path,
            format!(
                "header needs {} bytes of voxel data after offset {}, file holds {}",
                payload,
                offset,
                file_len.saturating_sub(offset)
            ),
        ));
    }
    Ok(())
}

fn is_gz(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("gz"))
        .unwrap_or(false)
}

/// Read a `.nii` or `.nii.gz` file; values are scaled by `scl_slope`/`scl_inter`
pub fn read_nifti(path: impl AsRef<Path>) -> Result<NiftiImage> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(VolsegError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} does not exist", path.display()),
        )));
    }

    let header = NiftiHeader::from_file(path).map_err(|e| nifti_error(path, e))?;
    check_payload(&header, path)?;

    let object = ReaderOptions::new()
        .read_file(path)
        .map_err(|e| nifti_error(path, e))?;
    let header = object.header().clone();
    let array = object
        .into_volume()
        .into_ndarray::<f32>()
        .map_err(|e| nifti_error(path, e))?;

    // logical iteration is row-major whatever the memory layout
    let shape = array.shape().to_vec();
    let volume = Volume::new(array.iter().copied().collect(), shape)?;

    Ok(NiftiImage { header, volume })
}

/// Write a volume with an sform from `affine`; paths ending in `.gz` are
/// gzip-compressed. Integer types round and saturate.
pub fn write_nifti(
    path: impl AsRef<Path>,
    volume: &Volume,
    affine: &Affine,
    datatype: NiftiDataType,
) -> Result<()> {
    let header = header_for(&volume.shape, affine)?;
    write_with_header(path.as_ref(), volume, &header, datatype)
}

fn write_with_header(
    path: &Path,
    volume: &Volume,
    header: &NiftiHeader,
    datatype: NiftiDataType,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let shape = IxDyn(&volume.shape);
    let shape_error = |e: ndarray::ShapeError| {
        VolsegError::shape(format!("volume of shape {:?}: {}", volume.shape, e))
    };
    let writer = WriterOptions::new(path).reference_header(header);

    // `as` saturates, which is the clamping we want for integer targets
    let written = match datatype {
        NiftiDataType::UInt8 => {
            let data = volume.data.iter().map(|v| v.round() as u8).collect();
            writer.write_nifti(&ArrayD::from_shape_vec(shape, data).map_err(shape_error)?)
        }
        NiftiDataType::Int16 => {
            let data = volume.data.iter().map(|v| v.round() as i16).collect();
            writer.write_nifti(&ArrayD::from_shape_vec(shape, data).map_err(shape_error)?)
        }
        NiftiDataType::Int32 => {
            let data = volume.data.iter().map(|v| v.round() as i32).collect();
            writer.write_nifti(&ArrayD::from_shape_vec(shape, data).map_err(shape_error)?)
        }
        NiftiDataType::Float32 => {
            let data = volume.data.clone();
            writer.write_nifti(&ArrayD::from_shape_vec(shape, data).map_err(shape_error)?)
        }
    };
    written.map_err(|e| nifti_error(path, e))?;

    tracing::debug!("Wrote {:?} volume to {}", volume.shape, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shape: Vec<usize>) -> Volume {
        let n: usize = shape.iter().product();
        Volume::new((0..n).map(|v| v as f32).collect(), shape).unwrap()
    }

    /// Write an uncompressed file, let `patch` edit its bytes, read it back
    fn read_patched(patch: impl Fn(&mut Vec<u8>, bool)) -> Result<NiftiImage> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("im0.nii");
        write_nifti(&path, &ramp(vec![4, 4, 4]), &IDENTITY_AFFINE, NiftiDataType::Float32)
            .unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let little_endian = bytes[..4] == 348i32.to_le_bytes();
        patch(&mut bytes, little_endian);
        fs::write(&path, bytes).unwrap();

        read_nifti(&path)
    }

    fn put_i16(bytes: &mut [u8], offset: usize, value: i16, little_endian: bool) {
        let raw = if little_endian {
            value.to_le_bytes()
        } else {
            value.to_be_bytes()
        };
        bytes[offset..offset + 2].copy_from_slice(&raw);
    }

    #[test]
    fn test_write_and_read_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("im0.nii.gz");
        let volume = ramp(vec![3, 4, 5]);
        let mut affine = IDENTITY_AFFINE;
        affine[0][0] = 2.0;
        affine[1][3] = -7.5;

        write_nifti(&path, &volume, &affine, NiftiDataType::Float32).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);

        let image = read_nifti(&path).unwrap();
        assert_eq!(image.volume, volume);
        assert_eq!(image.affine(), affine);
        assert_eq!(image.spacing(), vec![2.0, 1.0, 1.0]);
    }

    #[test]
    fn test_integer_labels_are_rounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg0.nii");
        let volume = Volume::new(vec![0.0, 1.0, 2.2, 0.9], vec![4]).unwrap();

        write_nifti(&path, &volume, &IDENTITY_AFFINE, NiftiDataType::UInt8).unwrap();
        let image = read_nifti(&path).unwrap();

        assert_eq!(image.header.datatype, NiftiDataType::UInt8.code());
        assert_eq!(image.volume.data, vec![0.0, 1.0, 2.0, 1.0]);
    }

    #[test]
    fn test_qform_affine() {
        let header = NiftiHeader {
            sform_code: 0,
            qform_code: 1,
            pixdim: [1.0, 2.0, 3.0, 4.0, 1.0, 1.0, 1.0, 1.0],
            quatern_x: 1.0,
            quatern_y: 2.0,
            quatern_z: 3.0,
            // 180 degree rotation about z
            quatern_b: 0.0,
            quatern_c: 0.0,
            quatern_d: 1.0,
            ..header_for(&[4, 4, 4], &IDENTITY_AFFINE).unwrap()
        };

        let affine = header_affine(&header);

        assert_eq!(affine[0][0], -2.0);
        assert_eq!(affine[1][1], -3.0);
        assert_eq!(affine[2][2], 4.0);
        assert_eq!([affine[0][3], affine[1][3], affine[2][3]], [1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["bad.nii", "bad.nii.gz"] {
            let path = dir.path().join(name);
            fs::write(&path, b"garbage").unwrap();
            assert!(matches!(read_nifti(&path), Err(VolsegError::Nifti(_))));
        }
        assert!(read_nifti(dir.path().join("absent.nii.gz")).is_err());
    }

    #[test]
    fn test_rejects_truncated_voxels() {
        let result = read_patched(|bytes, _| {
            bytes.truncate(bytes.len() - 4);
        });
        assert!(matches!(result, Err(VolsegError::Nifti(_))));
    }

    #[test]
    fn test_rejects_huge_vox_offset() {
        let result = read_patched(|bytes, little_endian| {
            let raw = if little_endian {
                1e30f32.to_le_bytes()
            } else {
                1e30f32.to_be_bytes()
            };
            bytes[108..112].copy_from_slice(&raw);
        });
        assert!(matches!(result, Err(VolsegError::Nifti(_))));
    }

    #[test]
    fn test_rejects_overflowing_dimensions() {
        let result = read_patched(|bytes, little_endian| {
            put_i16(bytes, 40, 7, little_endian);
            for axis in 1..=7 {
                put_i16(bytes, 40 + axis * 2, i16::MAX, little_endian);
            }
        });
        assert!(matches!(result, Err(VolsegError::Nifti(_))));
    }

    #[test]
    fn test_header_for_rejects_bad_shapes() {
        assert!(header_for(&[], &IDENTITY_AFFINE).is_err());
        assert!(header_for(&[2, 0, 2], &IDENTITY_AFFINE).is_err());
        assert!(header_for(&[1; 8], &IDENTITY_AFFINE).is_err());
    }
}
