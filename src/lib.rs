//! Sliding-window 3D segmentation evaluation on top of burn.
//!
//! The crate covers the whole evaluation path: synthetic volumes, NIfTI I/O,
//! an image/label dataset, a residual U-Net, checkpoint restore, windowed
//! inference, one-hot encoding and a mean-Dice metric.

pub mod config;
pub mod data;
pub mod error;
pub mod evaluation;
pub mod metrics;
pub mod nn;
pub mod ops;

pub use error::{Result, VolsegError};

/// Backend used for tests and CPU runs
pub type CpuBackend = burn::backend::NdArray;

/// GPU backend
pub type GpuBackend = burn::backend::Wgpu;
