use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VolsegError};

/// 4x4 voxel-to-world transform
pub type Affine = [[f64; 4]; 4];

pub const IDENTITY_AFFINE: Affine = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// Dense volume in row-major order (last axis varies fastest)
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl Volume {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(VolsegError::shape(format!(
                "volume of shape {:?} needs {} values, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { data, shape })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            data: vec![0.0; len],
            shape,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn min_max(&self) -> Option<(f32, f32)> {
        if self.data.is_empty() {
            return None;
        }
        let min = self.data.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = self.data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        Some((min, max))
    }

    /// Flat index of a multi-dimensional position
    pub fn index(&self, position: &[usize]) -> usize {
        position
            .iter()
            .zip(&self.shape)
            .fold(0, |acc, (&p, &extent)| acc * extent + p)
    }
}

/// Where a volume came from and how it sits in world space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMeta {
    pub filename: PathBuf,
    pub affine: Affine,
    /// Spatial shape as stored on disk, before any transform
    pub spatial_shape: Vec<usize>,
    /// Voxel spacing per spatial axis
    pub pixdim: Vec<f32>,
}

impl VolumeMeta {
    /// File name without directories and without `.nii` / `.nii.gz`
    pub fn stem(&self) -> String {
        let name = self
            .filename
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "volume".to_string());
        let name = name.strip_suffix(".gz").unwrap_or(&name);
        name.strip_suffix(".nii").unwrap_or(name).to_string()
    }
}

/// One image / label pair as produced by the dataset
#[derive(Debug, Clone)]
pub struct VolumeItem {
    pub image: Volume,
    pub label: Option<Volume>,
    pub meta: VolumeMeta,
}

/// A volume the dataset could not read or transform
#[derive(Debug, Clone, PartialEq)]
pub struct UnreadableVolume {
    pub filename: PathBuf,
    pub reason: String,
}

/// What the dataset yields for each index: the item, or why it is unusable
pub type VolumeRecord = std::result::Result<VolumeItem, UnreadableVolume>;

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(path: &str) -> VolumeMeta {
        VolumeMeta {
            filename: PathBuf::from(path),
            affine: IDENTITY_AFFINE,
            spatial_shape: vec![2, 2, 2],
            pixdim: vec![1.0; 3],
        }
    }

    #[test]
    fn test_stem_strips_nifti_extensions() {
        assert_eq!(meta("/data/im0.nii.gz").stem(), "im0");
        assert_eq!(meta("im1.nii").stem(), "im1");
        assert_eq!(meta("scan.v2.raw").stem(), "scan.v2.raw");
    }

    #[test]
    fn test_volume_shape_is_checked() {
        assert!(Volume::new(vec![0.0; 8], vec![2, 2, 2]).is_ok());
        assert!(Volume::new(vec![0.0; 7], vec![2, 2, 2]).is_err());
    }

    #[test]
    fn test_row_major_index() {
        let v = Volume::zeros(vec![2, 3, 4]);
        assert_eq!(v.index(&[0, 0, 1]), 1);
        assert_eq!(v.index(&[0, 1, 0]), 4);
        assert_eq!(v.index(&[1, 2, 3]), 23);
    }
}
