use std::ops::Range;

use burn::tensor::{backend::Backend, Tensor};

use crate::error::{Result, VolsegError};

/// Windows larger than this many voxels overlap by this margin
const OVERLAP_MARGIN: usize = 16;

/// Lower bound on the scan interval as a fraction of the window
const MIN_INTERVAL_FRACTION: f64 = 0.75;

/// Step between consecutive window starts along each spatial axis.
///
/// A window that spans the whole axis is placed once; otherwise consecutive
/// windows overlap by 16 voxels, or by a quarter of the window for windows
/// smaller than 64.
pub fn scan_interval(image_size: &[usize], roi_size: &[usize]) -> Vec<usize> {
    image_size
        .iter()
        .zip(roi_size)
        .map(|(&size, &roi)| {
            if roi == size {
                roi
            } else {
                let by_margin = roi.saturating_sub(OVERLAP_MARGIN);
                let by_fraction = (roi as f64 * MIN_INTERVAL_FRACTION) as usize;
                by_margin.max(by_fraction).max(1)
            }
        })
        .collect()
}

/// Start offsets of the windows along one axis.
///
/// The last window is shifted back so it ends on the axis boundary; starts
/// that collapse onto the same offset are emitted once.
pub fn dense_patch_starts(image_size: usize, roi: usize, interval: usize) -> Vec<usize> {
    let interval = interval.max(1);
    let last = image_size.saturating_sub(roi);
    let count = image_size.div_ceil(interval).max(1);

    let mut starts: Vec<usize> = Vec::with_capacity(count);
    for i in 0..count {
        let start = (i * interval).min(last);
        if starts.last() != Some(&start) {
            starts.push(start);
        }
    }
    starts
}

/// Cartesian product of per-axis starts, first axis varying slowest
fn window_grid(per_axis: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let mut grid: Vec<Vec<usize>> = vec![Vec::new()];
    for starts in per_axis {
        grid = grid
            .into_iter()
            .flat_map(|prefix| {
                starts.iter().map(move |&start| {
                    let mut window = prefix.clone();
                    window.push(start);
                    window
                })
            })
            .collect();
    }
    grid
}

fn ranges<const D: usize>(
    batch: Range<usize>,
    channels: Range<usize>,
    starts: &[usize],
    extents: &[usize],
) -> [Range<usize>; D] {
    core::array::from_fn(|i| match i {
        0 => batch.clone(),
        1 => channels.clone(),
        _ => starts[i - 2]..starts[i - 2] + extents[i - 2],
    })
}

fn shape_of<const D: usize>(batch: usize, channels: usize, spatial: &[usize]) -> [usize; D] {
    core::array::from_fn(|i| match i {
        0 => batch,
        1 => channels,
        _ => spatial[i - 2],
    })
}

/// Run `predictor` over overlapping windows of `inputs` and stitch the results.
///
/// Input shape: `[batch, channels, spatial...]` with `roi_size.len()` spatial
/// dimensions. Each batch item is scanned separately; windows are grouped
/// into predictor calls of at most `sw_batch_size`. The predictor must map
/// `[n, channels, roi...]` to `[n, out_channels, roi...]`.
///
/// Output shape: `[batch, out_channels, spatial...]`, each voxel holding the
/// mean of every window prediction that covered it.
pub fn sliding_window_inference<B, F, const D: usize>(
    inputs: Tensor<B, D>,
    roi_size: &[usize],
    sw_batch_size: usize,
    predictor: F,
) -> Result<Tensor<B, D>>
where
    B: Backend,
    F: Fn(Tensor<B, D>) -> Tensor<B, D>,
{
    if D < 3 {
        return Err(VolsegError::invalid(format!(
            "sliding window input needs at least one spatial dimension, got rank {}",
            D
        )));
    }
    if roi_size.len() != D - 2 {
        return Err(VolsegError::invalid(format!(
            "roi_size has {} dimensions but input has {} spatial dimensions",
            roi_size.len(),
            D - 2
        )));
    }
    if roi_size.contains(&0) {
        return Err(VolsegError::invalid(format!(
            "roi_size must be positive, got {:?}",
            roi_size
        )));
    }
    if sw_batch_size == 0 {
        return Err(VolsegError::invalid("sw_batch_size must be at least 1"));
    }

    let dims = inputs.dims();
    if dims[0] == 0 {
        return Err(VolsegError::shape("sliding window input has an empty batch"));
    }

    let origin = vec![0; D - 2];
    let mut outputs = Vec::with_capacity(dims[0]);
    for item in 0..dims[0] {
        let image = inputs
            .clone()
            .slice(ranges::<D>(item..item + 1, 0..dims[1], &origin, &dims[2..]));
        outputs.push(infer_single(image, roi_size, sw_batch_size, &predictor)?);
    }

    Ok(Tensor::cat(outputs, 0))
}

fn infer_single<B, F, const D: usize>(
    image: Tensor<B, D>,
    roi_size: &[usize],
    sw_batch_size: usize,
    predictor: &F,
) -> Result<Tensor<B, D>>
where
    B: Backend,
    F: Fn(Tensor<B, D>) -> Tensor<B, D>,
{
    let device = image.device();
    let dims = image.dims();
    let channels = dims[1];
    let original: Vec<usize> = dims[2..].to_vec();
    let padded: Vec<usize> = original
        .iter()
        .zip(roi_size)
        .map(|(&size, &roi)| size.max(roi))
        .collect();
    let origin = vec![0; D - 2];

    // Zero-pad the high end of any axis shorter than the window
    let image = if padded != original {
        Tensor::zeros(shape_of::<D>(1, channels, &padded), &device).slice_assign(
            ranges::<D>(0..1, 0..channels, &origin, &original),
            image,
        )
    } else {
        image
    };

    let interval = scan_interval(&padded, roi_size);
    let per_axis: Vec<Vec<usize>> = padded
        .iter()
        .zip(roi_size)
        .zip(&interval)
        .map(|((&size, &roi), &step)| dense_patch_starts(size, roi, step))
        .collect();
    let windows = window_grid(&per_axis);

    tracing::debug!(
        "Sliding window over {:?} (padded {:?}): {} windows, interval {:?}",
        original,
        padded,
        windows.len(),
        interval
    );

    let mut accumulated: Option<(Tensor<B, D>, Tensor<B, D>)> = None;

    for chunk in windows.chunks(sw_batch_size) {
        let patches: Vec<Tensor<B, D>> = chunk
            .iter()
            .map(|start| {
                image
                    .clone()
                    .slice(ranges::<D>(0..1, 0..channels, start, roi_size))
            })
            .collect();

        let prediction = predictor(Tensor::cat(patches, 0));
        let pred_dims = prediction.dims();
        if pred_dims[0] != chunk.len() || pred_dims[2..] != *roi_size {
            return Err(VolsegError::shape(format!(
                "predictor returned {:?} for {} windows of size {:?}",
                pred_dims,
                chunk.len(),
                roi_size
            )));
        }
        let out_channels = pred_dims[1];

        let (sum, count) = accumulated.get_or_insert_with(|| {
            let shape = shape_of::<D>(1, out_channels, &padded);
            (
                Tensor::zeros(shape, &device),
                Tensor::zeros(shape, &device),
            )
        });
        if sum.dims()[1] != out_channels {
            return Err(VolsegError::shape(format!(
                "predictor output channels changed from {} to {}",
                sum.dims()[1],
                out_channels
            )));
        }

        for (i, start) in chunk.iter().enumerate() {
            let target = ranges::<D>(0..1, 0..out_channels, start, roi_size);
            let patch = prediction
                .clone()
                .slice(ranges::<D>(i..i + 1, 0..out_channels, &origin, roi_size));

            let summed = sum.clone().slice(target.clone()) + patch;
            *sum = sum.clone().slice_assign(target.clone(), summed);

            let counted = count.clone().slice(target.clone()).add_scalar(1.0);
            *count = count.clone().slice_assign(target, counted);
        }
    }

    let (sum, count) = accumulated
        .ok_or_else(|| VolsegError::shape("sliding window produced no windows"))?;
    let out_channels = sum.dims()[1];

    Ok((sum / count).slice(ranges::<D>(0..1, 0..out_channels, &origin, &original)))
}
