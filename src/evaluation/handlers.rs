use burn::tensor::backend::Backend;
use sysinfo::System;

use crate::config;
use crate::error::{Result, VolsegError};
use crate::evaluation::engine::{EngineState, Handler, IterationOutput};
use crate::metrics::{DiceConfig, MeanDice};
use crate::nn::gpu;

/// Accumulates Dice over the epoch and stores the mean as `Mean_Dice`
#[derive(Debug, Clone)]
pub struct MeanDiceHandler {
    metric: MeanDice,
    name: String,
    warned_unlabelled: bool,
}

impl MeanDiceHandler {
    /// Labels are used as-is (no one-hot), predictions binarised at 0.5
    pub fn new(add_sigmoid: bool) -> Self {
        Self::with_config(DiceConfig {
            add_sigmoid,
            to_onehot_y: false,
            ..Default::default()
        })
    }

    pub fn with_config(config: DiceConfig) -> Self {
        Self {
            metric: MeanDice::new(config),
            name: config::MEAN_DICE_NAME.to_string(),
            warned_unlabelled: false,
        }
    }
}

impl<B: Backend> Handler<B> for MeanDiceHandler {
    fn started(&mut self, _state: &mut EngineState) -> Result<()> {
        self.metric.reset();
        self.warned_unlabelled = false;
        Ok(())
    }

    fn iteration_completed(
        &mut self,
        state: &mut EngineState,
        output: &IterationOutput<B>,
    ) -> Result<()> {
        let Some(label) = &output.label else {
            if !self.warned_unlabelled {
                tracing::warn!("Batch without labels, {} skips it", self.name);
                self.warned_unlabelled = true;
            }
            return Ok(());
        };

        if let Some(batch_dice) = self.metric.update(output.pred.clone(), label.clone())? {
            tracing::debug!(
                "Iteration[{}] {}: {:.4}",
                state.iteration,
                self.name,
                batch_dice
            );
        }
        Ok(())
    }

    fn completed(&mut self, state: &mut EngineState) -> Result<()> {
        match self.metric.compute() {
            Ok(value) => {
                state.metrics.insert(self.name.clone(), value);
                Ok(())
            }
            Err(VolsegError::NotComputable(_)) => {
                tracing::warn!("{} has no labelled foreground to score", self.name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Logs per-iteration progress and end-of-epoch metrics with compute stats
pub struct StatsHandler {
    sys: System,
}

impl StatsHandler {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }
}

impl Default for StatsHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Handler<B> for StatsHandler {
    fn started(&mut self, state: &mut EngineState) -> Result<()> {
        tracing::info!("Epoch[{}] started", state.epoch);
        Ok(())
    }

    fn iteration_completed(
        &mut self,
        state: &mut EngineState,
        output: &IterationOutput<B>,
    ) -> Result<()> {
        let names: Vec<String> = output.meta.iter().map(|m| m.stem()).collect();
        tracing::debug!(
            "Epoch[{}] Iteration[{}] {} -> {:?}",
            state.epoch,
            state.iteration,
            names.join(", "),
            output.pred.dims()
        );
        Ok(())
    }

    fn completed(&mut self, state: &mut EngineState) -> Result<()> {
        let metrics = state
            .metrics
            .iter()
            .map(|(name, value)| format!("{}: {:.4}", name, value))
            .collect::<Vec<_>>()
            .join(" ");
        tracing::info!("Epoch[{}] Metrics -- {}", state.epoch, metrics);
        if !state.skipped.is_empty() {
            tracing::warn!(
                "Epoch[{}] skipped {} unreadable volume(s)",
                state.epoch,
                state.skipped.len()
            );
        }

        let elapsed = state.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 {
            state.items as f64 / elapsed
        } else {
            0.0
        };

        self.sys.refresh_memory();
        let used_memory_mb = self.sys.used_memory() / (1024 * 1024);
        let total_memory_mb = self.sys.total_memory() / (1024 * 1024);

        tracing::info!(
            "Epoch[{}] Complete. Time taken: {:.2}s | {:.2} volumes/s | RAM {}/{} MB",
            state.epoch,
            elapsed,
            throughput,
            used_memory_mb,
            total_memory_mb
        );

        if let Some(info) = gpu::detect_nvidia_gpu() {
            tracing::info!(
                "GPU {}: VRAM {}/{} MB, {:.0}% utilization",
                info.name,
                info.vram_used_mb,
                info.vram_total_mb,
                info.utilization_percent
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use burn::tensor::Tensor;

    use super::*;
    use crate::data::models::{VolumeMeta, IDENTITY_AFFINE};
    use crate::CpuBackend as TestBackend;

    fn output(pred: [f32; 4], label: Option<[f32; 4]>) -> IterationOutput<TestBackend> {
        let device = Default::default();
        let tensor = |v: [f32; 4]| {
            Tensor::<TestBackend, 1>::from_floats(v, &device).reshape([1, 1, 1, 2, 2])
        };
        IterationOutput {
            pred: tensor(pred),
            label: label.map(tensor),
            meta: vec![VolumeMeta {
                filename: "im0.nii.gz".into(),
                affine: IDENTITY_AFFINE,
                spatial_shape: vec![1, 2, 2],
                pixdim: vec![1.0; 3],
            }],
        }
    }

    fn run(handler: &mut MeanDiceHandler, outputs: &[IterationOutput<TestBackend>]) -> EngineState {
        let mut state = EngineState::new();
        Handler::<TestBackend>::started(handler, &mut state).unwrap();
        for output in outputs {
            state.iteration += 1;
            handler.iteration_completed(&mut state, output).unwrap();
        }
        Handler::<TestBackend>::completed(handler, &mut state).unwrap();
        state
    }

    #[test]
    fn test_mean_dice_over_iterations() {
        let mut handler = MeanDiceHandler::new(true);
        // sigmoid(x) >= 0.5 exactly when x >= 0
        let outputs = [
            output([3.0, 3.0, -3.0, -3.0], Some([1.0, 1.0, 0.0, 0.0])),
            output([3.0, -3.0, -3.0, -3.0], Some([1.0, 1.0, 0.0, 0.0])),
            output([3.0, 3.0, 3.0, 3.0], None),
        ];

        let state = run(&mut handler, &outputs);

        assert_abs_diff_eq!(state.metrics["Mean_Dice"], 5.0 / 6.0, epsilon = 1e-6);
    }

    #[test]
    fn test_restarting_resets_the_metric() {
        let mut handler = MeanDiceHandler::new(true);
        run(&mut handler, &[output([3.0; 4], Some([1.0, 0.0, 0.0, 0.0]))]);

        let state = run(&mut handler, &[output([3.0; 4], Some([1.0; 4]))]);

        assert_eq!(state.metrics["Mean_Dice"], 1.0);
    }

    #[test]
    fn test_unlabelled_epoch_has_no_dice() {
        let mut handler = MeanDiceHandler::new(true);

        let state = run(&mut handler, &[output([3.0; 4], None)]);

        assert!(state.metrics.is_empty());
    }
}
