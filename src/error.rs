use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for volseg operations
pub type Result<T> = std::result::Result<T, VolsegError>;

#[derive(Error, Debug)]
pub enum VolsegError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unsupported NIfTI file
    #[error("NIfTI error: {0}")]
    Nifti(String),

    /// Tensor or volume shapes that do not line up
    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Checkpoint not found at {}", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// A metric was asked for a value before it saw any usable sample
    #[error("{0} must have at least one example before it can be computed")]
    NotComputable(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VolsegError {
    pub fn nifti<S: Into<String>>(msg: S) -> Self {
        VolsegError::Nifti(msg.into())
    }

    pub fn shape<S: Into<String>>(msg: S) -> Self {
        VolsegError::Shape(msg.into())
    }

    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        VolsegError::InvalidArgument(msg.into())
    }
}
