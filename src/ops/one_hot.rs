use burn::tensor::{backend::Backend, Int, Tensor};

use crate::error::{Result, VolsegError};

/// Convert a label tensor into a one-hot tensor.
///
/// Input shape: `[batch, 1, spatial...]` holding class indices.
/// Output shape: `[batch, num_classes, spatial...]` where channel `c` is 1
/// exactly where the label equals `c`. Labels outside `0..num_classes`
/// leave every channel at 0 for that location.
pub fn to_onehot<B: Backend, const D: usize>(
    labels: Tensor<B, D, Int>,
    num_classes: usize,
) -> Result<Tensor<B, D>> {
    if D < 2 {
        return Err(VolsegError::invalid(format!(
            "one-hot input needs batch and channel dimensions, got rank {}",
            D
        )));
    }
    if num_classes == 0 {
        return Err(VolsegError::invalid("num_classes must be at least 1"));
    }

    let dims = labels.dims();
    if dims[1] != 1 {
        return Err(VolsegError::shape(format!(
            "one-hot input must have a singleton channel dimension, got shape {:?}",
            dims
        )));
    }

    let channels: Vec<Tensor<B, D>> = (0..num_classes)
        .map(|class| labels.clone().equal_elem(class as i64).float())
        .collect();

    Ok(Tensor::cat(channels, 1))
}

/// Same as [`to_onehot`] for float tensors holding integral class values.
pub fn to_onehot_float<B: Backend, const D: usize>(
    labels: Tensor<B, D>,
    num_classes: usize,
) -> Result<Tensor<B, D>> {
    to_onehot(labels.int(), num_classes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CpuBackend as TestBackend;

    fn values<const D: usize>(tensor: Tensor<TestBackend, D>) -> Vec<f32> {
        tensor.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_single_channel_2d_batch() {
        let device = Default::default();
        let labels = Tensor::<TestBackend, 4, Int>::from_data(
            [[[[0, 1], [1, 2]]], [[[2, 1], [1, 0]]]],
            &device,
        );

        let result = to_onehot(labels, 3).unwrap();

        assert_eq!(result.dims(), [2, 3, 2, 2]);
    }

    #[test]
    fn test_single_channel_1d_batch() {
        let device = Default::default();
        let labels =
            Tensor::<TestBackend, 3, Int>::from_data([[[1, 2, 2, 0]], [[2, 1, 0, 1]]], &device);

        let result = to_onehot(labels, 3).unwrap();

        assert_eq!(result.dims(), [2, 3, 4]);
        let expected: Vec<f32> = vec![
            0., 0., 0., 1., //
            1., 0., 0., 0., //
            0., 1., 1., 0., //
            0., 0., 1., 0., //
            0., 1., 0., 1., //
            1., 0., 0., 0., //
        ];
        assert_eq!(values(result), expected);
    }

    #[test]
    fn test_single_channel_0d_float_labels() {
        let device = Default::default();
        let labels = Tensor::<TestBackend, 2>::from_data([[1.0], [2.0]], &device);

        let result = to_onehot_float(labels, 3).unwrap();

        assert_eq!(result.dims(), [2, 3]);
        assert_eq!(values(result), vec![0., 1., 0., 0., 0., 1.]);
    }

    #[test]
    fn test_class_channels_sum_to_one() {
        let device = Default::default();
        let labels = Tensor::<TestBackend, 4, Int>::from_data(
            [[[[3, 0, 1], [2, 2, 3]]], [[[1, 1, 0], [0, 3, 2]]]],
            &device,
        );

        let summed = to_onehot(labels, 4).unwrap().sum_dim(1);

        assert_eq!(summed.dims(), [2, 1, 2, 3]);
        assert!(values(summed).iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_out_of_range_label_is_all_zero() {
        let device = Default::default();
        let labels = Tensor::<TestBackend, 2, Int>::from_data([[5], [1]], &device);

        let result = to_onehot(labels, 2).unwrap();

        assert_eq!(values(result), vec![0., 0., 0., 1.]);
    }

    #[test]
    fn test_rejects_multi_channel_input() {
        let device = Default::default();
        let labels = Tensor::<TestBackend, 2, Int>::from_data([[0, 1], [1, 0]], &device);

        assert!(matches!(to_onehot(labels, 2), Err(VolsegError::Shape(_))));
    }

    #[test]
    fn test_rejects_zero_classes() {
        let device = Default::default();
        let labels = Tensor::<TestBackend, 2, Int>::from_data([[0], [1]], &device);

        assert!(matches!(
            to_onehot(labels, 0),
            Err(VolsegError::InvalidArgument(_))
        ));
    }
}
