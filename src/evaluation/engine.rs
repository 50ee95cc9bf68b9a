use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    tensor::{backend::Backend, Tensor},
};

use crate::data::dataset::{VolumeBatch, VolumeBatcher, VolumeDataset};
use crate::data::models::VolumeMeta;
use crate::error::{Result, VolsegError};
use crate::ops::sliding_window_inference;

/// Progress and metric values of a run, shared with every handler
#[derive(Debug, Clone)]
pub struct EngineState {
    pub epoch: usize,
    pub iteration: usize,
    /// Volumes processed so far
    pub items: usize,
    pub metrics: BTreeMap<String, f64>,
    /// Volumes that could not be evaluated
    pub skipped: Vec<PathBuf>,
    started: Instant,
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            epoch: 0,
            iteration: 0,
            items: 0,
            metrics: BTreeMap::new(),
            skipped: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}

/// Network output for one batch, alongside what was fed in
#[derive(Debug, Clone)]
pub struct IterationOutput<B: Backend> {
    pub pred: Tensor<B, 5>,          // [batch_size, out_channels, x, y, z]
    pub label: Option<Tensor<B, 5>>, // [batch_size, 1, x, y, z]
    pub meta: Vec<VolumeMeta>,
}

/// Hooks called by the [`Evaluator`], in attachment order
pub trait Handler<B: Backend> {
    fn started(&mut self, _state: &mut EngineState) -> Result<()> {
        Ok(())
    }

    fn iteration_completed(
        &mut self,
        _state: &mut EngineState,
        _output: &IterationOutput<B>,
    ) -> Result<()> {
        Ok(())
    }

    fn completed(&mut self, _state: &mut EngineState) -> Result<()> {
        Ok(())
    }
}

/// Data loader over a volume dataset, one volume per batch.
/// `num_workers == 0` loads on the calling thread.
pub fn build_loader<B: Backend>(
    dataset: VolumeDataset,
    device: B::Device,
    num_workers: usize,
) -> Arc<dyn DataLoader<VolumeBatch<B>>> {
    let builder = DataLoaderBuilder::new(VolumeBatcher::<B>::new(device)).batch_size(1);
    if num_workers > 0 {
        builder.num_workers(num_workers).build(dataset)
    } else {
        builder.build(dataset)
    }
}

/// Single-epoch evaluation with sliding-window inference
pub struct Evaluator<B: Backend, F> {
    network: F,
    roi_size: Vec<usize>,
    sw_batch_size: usize,
    handlers: Vec<Box<dyn Handler<B>>>,
}

impl<B, F> Evaluator<B, F>
where
    B: Backend,
    F: Fn(Tensor<B, 5>) -> Tensor<B, 5>,
{
    pub fn new(network: F, roi_size: &[usize], sw_batch_size: usize) -> Self {
        Self {
            network,
            roi_size: roi_size.to_vec(),
            sw_batch_size,
            handlers: Vec::new(),
        }
    }

    pub fn with_handler<H: Handler<B> + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn run(&mut self, loader: &dyn DataLoader<VolumeBatch<B>>) -> Result<EngineState> {
        if self.roi_size.len() != 3 {
            return Err(VolsegError::invalid(format!(
                "roi_size must have 3 dimensions, got {:?}",
                self.roi_size
            )));
        }

        let mut state = EngineState::new();
        state.epoch = 1;
        tracing::info!(
            "Evaluating {} volume(s), roi {:?}, window batch {}",
            loader.num_items(),
            self.roi_size,
            self.sw_batch_size
        );

        for handler in self.handlers.iter_mut() {
            handler.started(&mut state)?;
        }

        for batch in loader.iter() {
            for unreadable in &batch.skipped {
                tracing::warn!(
                    "Skipping {}: {}",
                    unreadable.filename.display(),
                    unreadable.reason
                );
                state.skipped.push(unreadable.filename.clone());
            }
            if batch.is_empty() {
                continue;
            }
            state.iteration += 1;
            state.items += batch.len();

            let pred = sliding_window_inference(
                batch.images,
                &self.roi_size,
                self.sw_batch_size,
                &self.network,
            )?;
            let output = IterationOutput {
                pred,
                label: batch.labels,
                meta: batch.meta,
            };

            for handler in self.handlers.iter_mut() {
                handler.iteration_completed(&mut state, &output)?;
            }
        }

        for handler in self.handlers.iter_mut() {
            handler.completed(&mut state)?;
        }

        Ok(state)
    }
}
