use burn::tensor::{backend::Backend, Tensor};

/// Turn raw network logits into a label map.
///
/// A single output channel is binarised at 0 (sigmoid 0.5); with several
/// channels the argmax channel index is taken. The result keeps a singleton
/// channel dimension: `[batch, 1, spatial...]`.
pub fn predict_segmentation<B: Backend, const D: usize>(logits: Tensor<B, D>) -> Tensor<B, D> {
    if logits.dims()[1] == 1 {
        logits.greater_equal_elem(0.0).float()
    } else {
        logits.argmax(1).float()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CpuBackend as TestBackend;

    #[test]
    fn test_single_channel_threshold() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 3>::from_data([[[-1.5, 0.0, 2.0, -0.1]]], &device);

        let labels = predict_segmentation(logits);

        assert_eq!(labels.dims(), [1, 1, 4]);
        assert_eq!(
            labels.into_data().to_vec::<f32>().unwrap(),
            vec![0.0, 1.0, 1.0, 0.0]
        );
    }

    #[test]
    fn test_multi_channel_argmax() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 3>::from_data(
            [[[0.1, 0.9, 0.2], [0.8, 0.0, 0.1], [0.3, 0.4, 0.7]]],
            &device,
        );

        let labels = predict_segmentation(logits);

        assert_eq!(labels.dims(), [1, 1, 3]);
        assert_eq!(
            labels.into_data().to_vec::<f32>().unwrap(),
            vec![1.0, 0.0, 2.0]
        );
    }
}
