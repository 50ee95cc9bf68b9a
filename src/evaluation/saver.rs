use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;

use crate::config;
use crate::data::dataset::tensor_to_volumes;
use crate::data::models::{Volume, VolumeMeta};
use crate::data::nifti::{write_nifti, NiftiDataType};
use crate::error::{Result, VolsegError};
use crate::evaluation::engine::{EngineState, Handler, IterationOutput};
use crate::ops::predict_segmentation;

/// Writes the label map of every evaluated volume to
/// `<output_dir>/<stem>/<stem>_<postfix><ext>`, reusing the source affine.
#[derive(Debug, Clone)]
pub struct SegmentationSaver {
    output_dir: PathBuf,
    postfix: String,
    ext: String,
    datatype: NiftiDataType,
    saved: usize,
}

impl SegmentationSaver {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            postfix: config::OUTPUT_POSTFIX.to_string(),
            ext: config::OUTPUT_EXT.to_string(),
            datatype: NiftiDataType::Float32,
            saved: 0,
        }
    }

    pub fn with_postfix(mut self, postfix: impl Into<String>) -> Self {
        self.postfix = postfix.into();
        self
    }

    pub fn with_ext(mut self, ext: impl Into<String>) -> Self {
        self.ext = ext.into();
        self
    }

    pub fn with_datatype(mut self, datatype: NiftiDataType) -> Self {
        self.datatype = datatype;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn output_path(&self, meta: &VolumeMeta) -> PathBuf {
        let stem = meta.stem();
        self.output_dir
            .join(&stem)
            .join(format!("{}_{}{}", stem, self.postfix, self.ext))
    }
}

/// `[1, x, y, z]` becomes `[x, y, z]`; multi-channel volumes stay 4-D
fn squeeze_channel(mut volume: Volume) -> Volume {
    if volume.shape.len() > 1 && volume.shape[0] == 1 {
        volume.shape.remove(0);
    }
    volume
}

impl<B: Backend> Handler<B> for SegmentationSaver {
    fn started(&mut self, _state: &mut EngineState) -> Result<()> {
        self.saved = 0;
        Ok(())
    }

    fn iteration_completed(
        &mut self,
        _state: &mut EngineState,
        output: &IterationOutput<B>,
    ) -> Result<()> {
        let segmentation = predict_segmentation(output.pred.clone());
        let volumes = tensor_to_volumes(segmentation)?;
        if volumes.len() != output.meta.len() {
            return Err(VolsegError::shape(format!(
                "{} predictions for {} source volumes",
                volumes.len(),
                output.meta.len()
            )));
        }

        for (volume, meta) in volumes.into_iter().zip(&output.meta) {
            let path = self.output_path(meta);
            write_nifti(&path, &squeeze_channel(volume), &meta.affine, self.datatype)?;
            tracing::debug!("Saved segmentation to {}", path.display());
            self.saved += 1;
        }
        Ok(())
    }

    fn completed(&mut self, _state: &mut EngineState) -> Result<()> {
        tracing::info!(
            "Saved {} segmentation(s) under {}",
            self.saved,
            self.output_dir.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::Tensor;

    use super::*;
    use crate::data::nifti::read_nifti;
    use crate::CpuBackend as TestBackend;

    fn meta(name: &str) -> VolumeMeta {
        let mut affine = crate::data::models::IDENTITY_AFFINE;
        affine[0][3] = -12.5;
        VolumeMeta {
            filename: PathBuf::from("/data").join(name),
            affine,
            spatial_shape: vec![2, 1, 2],
            pixdim: vec![1.0; 3],
        }
    }

    #[test]
    fn test_output_path_layout() {
        let saver = SegmentationSaver::new("out");
        assert_eq!(
            saver.output_path(&meta("im3.nii.gz")),
            PathBuf::from("out/im3/im3_seg.nii.gz")
        );
        let saver = saver.with_postfix("mask").with_ext(".nii");
        assert_eq!(
            saver.output_path(&meta("case.nii")),
            PathBuf::from("out/case/case_mask.nii")
        );
    }

    #[test]
    fn test_saves_thresholded_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut saver = SegmentationSaver::new(dir.path());
        let device = Default::default();
        let pred = Tensor::<TestBackend, 1>::from_floats(
            [-1.0, 2.0, 0.5, -0.5, 1.0, 1.0, -2.0, -2.0],
            &device,
        )
        .reshape([2, 1, 2, 1, 2]);
        let output = IterationOutput {
            pred,
            label: None,
            meta: vec![meta("im0.nii.gz"), meta("im1.nii.gz")],
        };

        let mut state = EngineState::new();
        Handler::<TestBackend>::started(&mut saver, &mut state).unwrap();
        saver.iteration_completed(&mut state, &output).unwrap();

        let first = read_nifti(dir.path().join("im0/im0_seg.nii.gz")).unwrap();
        assert_eq!(first.volume.shape, vec![2, 1, 2]);
        assert_eq!(first.volume.data, vec![0.0, 1.0, 1.0, 0.0]);
        assert_eq!(first.affine()[0][3], -12.5);

        let second = read_nifti(dir.path().join("im1/im1_seg.nii.gz")).unwrap();
        assert_eq!(second.volume.data, vec![1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_rejects_meta_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut saver = SegmentationSaver::new(dir.path());
        let output = IterationOutput {
            pred: Tensor::<TestBackend, 5>::zeros([2, 1, 2, 1, 2], &Default::default()),
            label: None,
            meta: vec![meta("im0.nii.gz")],
        };

        let mut state = EngineState::new();
        assert!(saver.iteration_completed(&mut state, &output).is_err());
    }
}
