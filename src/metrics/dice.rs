use burn::tensor::{activation::sigmoid, backend::Backend, Tensor};

use crate::error::{Result, VolsegError};
use crate::ops::one_hot::to_onehot;

/// Options for [`compute_meandice`].
#[derive(Debug, Clone, PartialEq)]
pub struct DiceConfig {
    /// Keep channel 0 (background) in the score
    pub include_background: bool,
    /// One-hot encode the ground truth to the prediction's channel count
    pub to_onehot_y: bool,
    /// Classes exclude each other: predictions are argmax'ed and one-hot encoded
    pub mutually_exclusive: bool,
    /// Apply a sigmoid to predictions before thresholding
    pub add_sigmoid: bool,
    /// Binarise predictions at this value (channel-wise)
    pub logit_thresh: Option<f64>,
}

impl Default for DiceConfig {
    fn default() -> Self {
        Self {
            include_background: true,
            to_onehot_y: false,
            mutually_exclusive: false,
            add_sigmoid: false,
            logit_thresh: Some(crate::config::DICE_LOGIT_THRESH),
        }
    }
}

/// Dice score per (batch, class) between predictions and ground truth.
///
/// Both inputs are `[batch, channels, spatial...]`. Returns `batch * classes`
/// entries in batch-major order; an entry is `None` when the ground truth is
/// empty for that class, where Dice is undefined.
pub fn compute_meandice<B: Backend, const D: usize>(
    y_pred: Tensor<B, D>,
    y: Tensor<B, D>,
    config: &DiceConfig,
) -> Result<Vec<Option<f64>>> {
    if D < 3 {
        return Err(VolsegError::invalid(format!(
            "Dice needs at least one spatial dimension, got rank {}",
            D
        )));
    }
    let n_channels = y_pred.dims()[1];

    let y_pred = if config.mutually_exclusive {
        if config.logit_thresh.is_some() {
            return Err(VolsegError::invalid(
                "logit_thresh is incompatible with mutually exclusive classes",
            ));
        }
        to_onehot(y_pred.argmax(1), n_channels)?
    } else {
        let y_pred = if config.add_sigmoid { sigmoid(y_pred) } else { y_pred };
        match config.logit_thresh {
            Some(thresh) => y_pred.greater_equal_elem(thresh).float(),
            None => y_pred,
        }
    };

    let y = if config.to_onehot_y {
        to_onehot(y.int(), n_channels)?
    } else {
        y
    };

    let (y_pred, y) = if config.include_background {
        (y_pred, y)
    } else {
        (drop_background(y_pred), drop_background(y))
    };

    let pred_dims = y_pred.dims();
    let label_dims = y.dims();
    if pred_dims != label_dims {
        return Err(VolsegError::shape(format!(
            "prediction {:?} and ground truth {:?} must have the same shape",
            pred_dims, label_dims
        )));
    }

    let batch = pred_dims[0];
    let classes = pred_dims[1];
    let voxels: usize = pred_dims[2..].iter().product();

    let y_pred = y_pred.reshape([batch, classes, voxels]);
    let y = y.reshape([batch, classes, voxels]);

    let intersection = to_f64(y_pred.clone().mul(y.clone()).sum_dim(2))?;
    let y_sum = to_f64(y.sum_dim(2))?;
    let pred_sum = to_f64(y_pred.sum_dim(2))?;

    Ok(intersection
        .iter()
        .zip(&y_sum)
        .zip(&pred_sum)
        .map(|((&inter, &truth), &pred)| {
            if truth > 0.0 {
                Some(2.0 * inter / (truth + pred))
            } else {
                None
            }
        })
        .collect())
}

fn drop_background<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Tensor<B, D> {
    let dims = tensor.dims();
    if dims[1] <= 1 {
        tracing::warn!("single channel prediction, include_background=false ignored");
        return tensor;
    }
    let ranges = core::array::from_fn::<_, D, _>(|i| if i == 1 { 1..dims[1] } else { 0..dims[i] });
    tensor.slice(ranges)
}

fn to_f64<B: Backend>(tensor: Tensor<B, 3>) -> Result<Vec<f64>> {
    tensor
        .into_data()
        .convert::<f64>()
        .to_vec::<f64>()
        .map_err(|e| VolsegError::shape(format!("failed to read metric values: {:?}", e)))
}

/// Running mean of Dice scores over an evaluation epoch.
///
/// Every (case, class) pair with a non-empty ground truth counts once, so with
/// several classes this is the mean over pairs, not the mean of per-case class
/// means. Undefined (empty ground truth) pairs are skipped.
#[derive(Debug, Clone)]
pub struct MeanDice {
    config: DiceConfig,
    sum: f64,
    num_examples: usize,
}

impl MeanDice {
    pub fn new(config: DiceConfig) -> Self {
        Self {
            config,
            sum: 0.0,
            num_examples: 0,
        }
    }

    pub fn config(&self) -> &DiceConfig {
        &self.config
    }

    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.num_examples = 0;
    }

    /// Score one batch and fold it into the running mean.
    /// Returns the batch's own mean, if it had any defined score.
    pub fn update<B: Backend, const D: usize>(
        &mut self,
        y_pred: Tensor<B, D>,
        y: Tensor<B, D>,
    ) -> Result<Option<f64>> {
        let scores = compute_meandice(y_pred, y, &self.config)?;
        let defined: Vec<f64> = scores.into_iter().flatten().collect();
        if defined.is_empty() {
            return Ok(None);
        }

        let batch_sum: f64 = defined.iter().sum();
        self.sum += batch_sum;
        self.num_examples += defined.len();
        Ok(Some(batch_sum / defined.len() as f64))
    }

    pub fn compute(&self) -> Result<f64> {
        if self.num_examples == 0 {
            return Err(VolsegError::NotComputable("MeanDice".to_string()));
        }
        Ok(self.sum / self.num_examples as f64)
    }
}

impl Default for MeanDice {
    fn default() -> Self {
        Self::new(DiceConfig::default())
    }
}
