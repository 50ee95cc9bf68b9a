//! Evaluation engine: runs windowed inference over a data loader and hands
//! every iteration to the attached handlers (metric, logging, saving).

pub mod engine;
pub mod handlers;
pub mod pipeline;
pub mod saver;

pub use engine::{build_loader, EngineState, Evaluator, Handler, IterationOutput};
pub use handlers::{MeanDiceHandler, StatsHandler};
pub use pipeline::{evaluate_checkpoint, EvaluationSettings};
pub use saver::SegmentationSaver;
