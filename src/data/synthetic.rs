use std::path::{Path, PathBuf};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::config;
use crate::data::models::{Volume, IDENTITY_AFFINE};
use crate::data::nifti::{write_nifti, NiftiDataType};
use crate::data::transforms::rescale_array;
use crate::error::{Result, VolsegError};

/// Smallest sphere radius drawn
const RAD_MIN: usize = 5;

/// Parameters of the random sphere phantom
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticConfig {
    pub num_objs: usize,
    pub rad_max: usize,
    /// Upper bound of the uniform background noise, per class
    pub noise_max: f32,
    pub num_seg_classes: usize,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            num_objs: config::SYNTH_NUM_OBJS,
            rad_max: config::SYNTH_RAD_MAX,
            noise_max: 0.0,
            num_seg_classes: 5,
        }
    }
}

/// Random spheres in a `[height, width, depth]` volume.
///
/// Returns `(image, labels)`: the image is rescaled to `[0, 1]`, labels hold
/// the class of each sphere (1 for every sphere when `num_seg_classes == 1`)
/// and 0 for background.
pub fn create_test_image_3d<R: Rng>(
    height: usize,
    width: usize,
    depth: usize,
    config: &SyntheticConfig,
    rng: &mut R,
) -> Result<(Volume, Volume)> {
    create_test_image(&[height, width, depth], config, rng)
}

/// Random circles in a `[height, width]` image; see [`create_test_image_3d`].
pub fn create_test_image_2d<R: Rng>(
    height: usize,
    width: usize,
    config: &SyntheticConfig,
    rng: &mut R,
) -> Result<(Volume, Volume)> {
    create_test_image(&[height, width], config, rng)
}

fn create_test_image<R: Rng>(
    shape: &[usize],
    config: &SyntheticConfig,
    rng: &mut R,
) -> Result<(Volume, Volume)> {
    if config.rad_max <= RAD_MIN {
        return Err(VolsegError::invalid(format!(
            "rad_max must exceed {}, got {}",
            RAD_MIN, config.rad_max
        )));
    }
    if let Some(&extent) = shape.iter().find(|&&e| e <= 2 * config.rad_max) {
        return Err(VolsegError::invalid(format!(
            "image extent {} leaves no room for spheres of radius up to {}",
            extent, config.rad_max
        )));
    }
    if config.num_seg_classes == 0 {
        return Err(VolsegError::invalid("num_seg_classes must be at least 1"));
    }

    let mut image = Volume::zeros(shape.to_vec());

    for _ in 0..config.num_objs {
        let center: Vec<usize> = shape
            .iter()
            .map(|&extent| rng.gen_range(config.rad_max..extent - config.rad_max))
            .collect();
        let radius = rng.gen_range(RAD_MIN..config.rad_max);
        let value = if config.num_seg_classes > 1 {
            (rng.gen::<f32>() * config.num_seg_classes as f32).ceil()
        } else {
            rng.gen::<f32>() * 0.5 + 0.5
        };
        paint_sphere(&mut image, &center, radius, value);
    }

    let labels = Volume {
        data: image.data.iter().map(|v| v.ceil()).collect(),
        shape: image.shape.clone(),
    };

    let noise_max = config.num_seg_classes as f32 * config.noise_max;
    if noise_max > 0.0 {
        for v in image.data.iter_mut() {
            *v = v.max(rng.gen_range(0.0..noise_max));
        }
    }
    rescale_array(&mut image.data, 0.0, 1.0);

    Ok((image, labels))
}

/// Write `count` cubic image/label pairs as `im{i}.nii.gz` / `seg{i}.nii.gz`
/// with an identity affine. Returns the image and label paths in order.
pub fn write_synthetic_dataset(
    dir: &Path,
    count: usize,
    size: usize,
    config: &SyntheticConfig,
    seed: u64,
) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut images = Vec::with_capacity(count);
    let mut labels = Vec::with_capacity(count);

    for i in 0..count {
        let (image, label) = create_test_image_3d(size, size, size, config, &mut rng)?;

        let image_path = dir.join(format!("im{}.nii.gz", i));
        let label_path = dir.join(format!("seg{}.nii.gz", i));
        write_nifti(&image_path, &image, &IDENTITY_AFFINE, NiftiDataType::Float32)?;
        write_nifti(&label_path, &label, &IDENTITY_AFFINE, NiftiDataType::Float32)?;
        tracing::debug!("Wrote {} and {}", image_path.display(), label_path.display());

        images.push(image_path);
        labels.push(label_path);
    }

    tracing::info!(
        "Generated {} synthetic {}^3 volumes in {}",
        count,
        size,
        dir.display()
    );
    Ok((images, labels))
}

/// Set every voxel within `radius` of `center` to `value`
fn paint_sphere(volume: &mut Volume, center: &[usize], radius: usize, value: f32) {
    // center is at least rad_max from every edge, so the box stays inside
    let lo: Vec<usize> = center.iter().map(|&c| c - radius).collect();
    let hi: Vec<usize> = center.iter().map(|&c| c + radius).collect();
    let r2 = (radius * radius) as i64;

    let mut position = lo.clone();
    loop {
        let d2: i64 = position
            .iter()
            .zip(center)
            .map(|(&p, &c)| (p as i64 - c as i64).pow(2))
            .sum();
        if d2 <= r2 {
            let index = volume.index(&position);
            volume.data[index] = value;
        }

        // advance the last axis fastest
        let mut axis = position.len();
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            if position[axis] < hi[axis] {
                position[axis] += 1;
                break;
            }
            position[axis] = lo[axis];
        }
    }
}
