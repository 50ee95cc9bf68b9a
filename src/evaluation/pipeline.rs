use std::path::PathBuf;

use burn::{
    module::Module,
    tensor::{backend::Backend, Tensor},
};

use crate::config;
use crate::data::dataset::{list_volumes, VolumeDataset};
use crate::data::transforms::{AddChannel, Compose, Rescale};
use crate::error::{Result, VolsegError};
use crate::evaluation::engine::{build_loader, EngineState, Evaluator};
use crate::evaluation::handlers::{MeanDiceHandler, StatsHandler};
use crate::evaluation::saver::SegmentationSaver;
use crate::nn::persistence::load_checkpoint;

/// Inputs and knobs of a checkpoint evaluation
#[derive(Debug, Clone)]
pub struct EvaluationSettings {
    /// Directory holding `im*.nii[.gz]` images and optional `seg*.nii[.gz]` labels
    pub data_dir: PathBuf,
    pub checkpoint: PathBuf,
    pub output_dir: PathBuf,
    pub roi_size: Vec<usize>,
    pub sw_batch_size: usize,
    pub num_workers: usize,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            checkpoint: PathBuf::from(config::DEFAULT_CHECKPOINT),
            output_dir: PathBuf::from(config::DEFAULT_OUTPUT_DIR),
            roi_size: config::ROI_SIZE.to_vec(),
            sw_batch_size: config::SW_BATCH_SIZE,
            num_workers: config::LOADER_NUM_WORKERS,
        }
    }
}

/// Restore a checkpoint and evaluate it over a directory of volumes:
/// windowed inference, mean Dice against the labels, stats logging and
/// segmentation export.
pub fn evaluate_checkpoint<B: Backend>(
    settings: &EvaluationSettings,
    device: &B::Device,
) -> Result<EngineState> {
    let images = list_volumes(&settings.data_dir, "im")?;
    if images.is_empty() {
        return Err(VolsegError::invalid(format!(
            "no im*.nii[.gz] volumes in {}",
            settings.data_dir.display()
        )));
    }
    let segs = list_volumes(&settings.data_dir, "seg")?;
    let labels = if segs.is_empty() {
        tracing::warn!("No seg* label volumes found, Dice will not be computed");
        None
    } else {
        Some(segs)
    };

    let (model, metadata) = load_checkpoint::<B>(&settings.checkpoint, device)?;
    tracing::info!("Model has {} parameters", model.num_params());

    let divisor = metadata.model.size_divisor();
    if settings.roi_size.iter().any(|&r| r == 0 || r % divisor != 0) {
        return Err(VolsegError::invalid(format!(
            "roi size {:?} must be a positive multiple of {} for this network",
            settings.roi_size, divisor
        )));
    }

    let dataset = VolumeDataset::new(
        images,
        labels,
        Compose::new().then(Rescale::default()).then(AddChannel),
        Compose::new().then(AddChannel),
    )?;
    let loader = build_loader::<B>(dataset, device.clone(), settings.num_workers);

    let mut evaluator = Evaluator::new(
        |x: Tensor<B, 5>| model.forward(x),
        &settings.roi_size,
        settings.sw_batch_size,
    )
    .with_handler(MeanDiceHandler::new(true))
    .with_handler(StatsHandler::new())
    .with_handler(SegmentationSaver::new(&settings.output_dir));

    evaluator.run(loader.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic::{write_synthetic_dataset, SyntheticConfig};
    use crate::nn::model::UNetConfig;
    use crate::nn::persistence::save_checkpoint;
    use crate::CpuBackend as TestBackend;

    fn settings(root: &std::path::Path) -> EvaluationSettings {
        EvaluationSettings {
            data_dir: root.join("data"),
            checkpoint: root.join("runs").join("net_checkpoint_1"),
            output_dir: root.join("out"),
            roi_size: vec![8, 8, 8],
            sw_batch_size: 2,
            num_workers: 1,
        }
    }

    fn small_spheres() -> SyntheticConfig {
        SyntheticConfig {
            num_seg_classes: 1,
            rad_max: 6,
            num_objs: 3,
            ..Default::default()
        }
    }

    fn write_checkpoint(settings: &EvaluationSettings) {
        let config = UNetConfig::new(1, 1, vec![2, 4], vec![2]).with_num_res_units(1);
        let model = config.init::<TestBackend>(&Default::default()).unwrap();
        save_checkpoint(&model, &config, &settings.checkpoint).unwrap();
    }

    #[test]
    fn test_end_to_end_evaluation() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());
        std::fs::create_dir_all(&settings.data_dir).unwrap();
        write_synthetic_dataset(&settings.data_dir, 2, 16, &small_spheres(), 0).unwrap();
        write_checkpoint(&settings);

        let state = evaluate_checkpoint::<TestBackend>(&settings, &Default::default()).unwrap();

        assert_eq!(state.iteration, 2);
        let dice = state.metrics["Mean_Dice"];
        assert!((0.0..=1.0).contains(&dice));
        for stem in ["im0", "im1"] {
            let path = settings.output_dir.join(stem).join(format!("{}_seg.nii.gz", stem));
            assert!(path.is_file(), "missing {}", path.display());
        }
    }

    #[test]
    fn test_rejects_incompatible_roi() {
        let root = tempfile::tempdir().unwrap();
        let mut settings = settings(root.path());
        settings.roi_size = vec![7, 8, 8];
        std::fs::create_dir_all(&settings.data_dir).unwrap();
        write_synthetic_dataset(&settings.data_dir, 1, 16, &small_spheres(), 0).unwrap();
        write_checkpoint(&settings);

        let result = evaluate_checkpoint::<TestBackend>(&settings, &Default::default());
        assert!(matches!(result, Err(VolsegError::InvalidArgument(_))));
    }

    #[test]
    fn test_missing_inputs() {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());
        std::fs::create_dir_all(&settings.data_dir).unwrap();

        let result = evaluate_checkpoint::<TestBackend>(&settings, &Default::default());
        assert!(matches!(result, Err(VolsegError::InvalidArgument(_))));

        write_synthetic_dataset(&settings.data_dir, 1, 16, &small_spheres(), 0).unwrap();
        let result = evaluate_checkpoint::<TestBackend>(&settings, &Default::default());
        assert!(matches!(result, Err(VolsegError::CheckpointNotFound(_))));
    }
}
