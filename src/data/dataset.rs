use std::fs;
use std::path::{Path, PathBuf};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Tensor},
};

use crate::data::models::{UnreadableVolume, Volume, VolumeItem, VolumeMeta, VolumeRecord};
use crate::data::nifti::read_nifti;
use crate::data::transforms::{Compose, Transform};
use crate::error::{Result, VolsegError};

/// Image files paired with optional label files, read lazily on access
pub struct VolumeDataset {
    images: Vec<PathBuf>,
    labels: Option<Vec<PathBuf>>,
    image_transform: Compose,
    label_transform: Compose,
}

impl VolumeDataset {
    pub fn new(
        images: Vec<PathBuf>,
        labels: Option<Vec<PathBuf>>,
        image_transform: Compose,
        label_transform: Compose,
    ) -> Result<Self> {
        if let Some(labels) = &labels {
            if labels.len() != images.len() {
                return Err(VolsegError::invalid(format!(
                    "{} images but {} label files",
                    images.len(),
                    labels.len()
                )));
            }
        }
        if let Some(missing) = images
            .iter()
            .chain(labels.iter().flatten())
            .find(|p| !p.is_file())
        {
            return Err(VolsegError::invalid(format!(
                "volume file {} does not exist",
                missing.display()
            )));
        }

        Ok(Self {
            images,
            labels,
            image_transform,
            label_transform,
        })
    }

    fn load(&self, index: usize) -> Result<VolumeItem> {
        let path = self
            .images
            .get(index)
            .ok_or_else(|| VolsegError::invalid(format!("index {} out of range", index)))?;

        let image = read_nifti(path)?;
        let meta = VolumeMeta {
            filename: path.clone(),
            affine: image.affine(),
            spatial_shape: image.volume.shape.clone(),
            pixdim: image.spacing(),
        };
        let volume = self.image_transform.apply(image.volume)?;

        let label = match self.labels.as_ref().and_then(|l| l.get(index)) {
            Some(label_path) => {
                let label = read_nifti(label_path)?.volume;
                if label.shape != meta.spatial_shape {
                    return Err(VolsegError::shape(format!(
                        "label {} has shape {:?}, image has {:?}",
                        label_path.display(),
                        label.shape,
                        meta.spatial_shape
                    )));
                }
                Some(self.label_transform.apply(label)?)
            }
            None => None,
        };

        Ok(VolumeItem {
            image: volume,
            label,
            meta,
        })
    }
}

/// `None` only past the end; a volume that fails to load is still a record,
/// so one bad file never ends an iteration early.
impl Dataset<VolumeRecord> for VolumeDataset {
    fn get(&self, index: usize) -> Option<VolumeRecord> {
        let path = self.images.get(index)?;
        Some(self.load(index).map_err(|e| {
            tracing::warn!("Failed to load volume {}: {}", path.display(), e);
            UnreadableVolume {
                filename: path.clone(),
                reason: e.to_string(),
            }
        }))
    }

    fn len(&self) -> usize {
        self.images.len()
    }
}

/// Sorted `.nii` / `.nii.gz` files in `dir` whose name starts with `prefix`
pub fn list_volumes(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|name| {
                    name.starts_with(prefix) && (name.ends_with(".nii.gz") || name.ends_with(".nii"))
                })
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Upload a `[channels, spatial...]` volume as a `[1, channels, x, y, z]` tensor
pub fn volume_to_tensor<B: Backend>(volume: &Volume, device: &B::Device) -> Result<Tensor<B, 5>> {
    let shape: [usize; 4] = volume.shape.as_slice().try_into().map_err(|_| {
        VolsegError::shape(format!(
            "expected a [channel, x, y, z] volume, got {:?}",
            volume.shape
        ))
    })?;
    Ok(Tensor::<B, 1>::from_floats(volume.data.as_slice(), device)
        .reshape([1, shape[0], shape[1], shape[2], shape[3]]))
}

/// Split a `[batch, channels, x, y, z]` tensor into one volume per batch item
pub fn tensor_to_volumes<B: Backend>(tensor: Tensor<B, 5>) -> Result<Vec<Volume>> {
    let [batch, channels, x, y, z] = tensor.dims();
    let data = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| VolsegError::shape(format!("failed to read tensor data: {:?}", e)))?;

    let per_item = channels * x * y * z;
    (0..batch)
        .map(|b| {
            Volume::new(
                data[b * per_item..(b + 1) * per_item].to_vec(),
                vec![channels, x, y, z],
            )
        })
        .collect()
}

/// Batcher that stacks volume items into tensors
#[derive(Clone, Debug)]
pub struct VolumeBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> VolumeBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

/// Batched volumes ready for inference
#[derive(Debug, Clone)]
pub struct VolumeBatch<B: Backend> {
    pub images: Tensor<B, 5>,       // [batch_size, channels, x, y, z]
    pub labels: Option<Tensor<B, 5>>, // [batch_size, 1, x, y, z]
    pub meta: Vec<VolumeMeta>,
    /// Records in this batch that never made it into `images`
    pub skipped: Vec<UnreadableVolume>,
}

impl<B: Backend> VolumeBatch<B> {
    pub fn len(&self) -> usize {
        self.meta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meta.is_empty()
    }
}

impl<B: Backend> Batcher<VolumeRecord, VolumeBatch<B>> for VolumeBatcher<B> {
    fn batch(&self, records: Vec<VolumeRecord>) -> VolumeBatch<B> {
        let mut skipped = Vec::new();
        let items: Vec<VolumeItem> = records
            .into_iter()
            .filter_map(|record| record.map_err(|e| skipped.push(e)).ok())
            .collect();

        let image_shape = items.first().map(|i| i.image.shape.clone()).unwrap_or_default();

        let (kept, dropped): (Vec<VolumeItem>, Vec<VolumeItem>) = items
            .into_iter()
            .partition(|item| item.image.shape == image_shape && image_shape.len() == 4);
        for item in dropped {
            tracing::warn!(
                "Dropping {} from batch: shape {:?} does not match {:?}",
                item.meta.filename.display(),
                item.image.shape,
                image_shape
            );
            skipped.push(UnreadableVolume {
                reason: format!(
                    "shape {:?} does not match batch shape {:?}",
                    item.image.shape, image_shape
                ),
                filename: item.meta.filename,
            });
        }

        if kept.is_empty() {
            return VolumeBatch {
                images: Tensor::zeros([0, 1, 1, 1, 1], &self.device),
                labels: None,
                meta: Vec::new(),
                skipped,
            };
        }

        let batch_size = kept.len();
        let [c, x, y, z] = [image_shape[0], image_shape[1], image_shape[2], image_shape[3]];

        let mut image_data = Vec::with_capacity(batch_size * c * x * y * z);
        for item in &kept {
            image_data.extend_from_slice(&item.image.data);
        }
        let images = Tensor::<B, 1>::from_floats(image_data.as_slice(), &self.device)
            .reshape([batch_size, c, x, y, z]);

        let label_shape = vec![1, x, y, z];
        let labels = if kept
            .iter()
            .all(|i| i.label.as_ref().map(|l| l.shape == label_shape).unwrap_or(false))
        {
            let mut label_data = Vec::with_capacity(batch_size * x * y * z);
            for label in kept.iter().filter_map(|i| i.label.as_ref()) {
                label_data.extend_from_slice(&label.data);
            }
            Some(
                Tensor::<B, 1>::from_floats(label_data.as_slice(), &self.device)
                    .reshape([batch_size, 1, x, y, z]),
            )
        } else {
            if kept.iter().any(|i| i.label.is_some()) {
                tracing::warn!("Labels missing or misshapen for part of the batch, ignoring labels");
            }
            None
        };

        VolumeBatch {
            images,
            labels,
            meta: kept.into_iter().map(|i| i.meta).collect(),
            skipped,
        }
    }
}
