use std::fs;
use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkGzFileRecorder},
    tensor::backend::Backend,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VolsegError};
use crate::nn::model::{UNet, UNetConfig};

/// Metadata saved alongside the model weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub created_at: String,
    pub model: UNetConfig,
}

/// File holding the weights for a checkpoint base path
pub fn weights_path(path: &Path) -> PathBuf {
    path.with_extension("mpk.gz")
}

/// JSON sidecar holding the model config for a checkpoint base path
pub fn metadata_path(path: &Path) -> PathBuf {
    path.with_extension("json")
}

/// Save the model in gzip-compressed MessagePack format plus a JSON sidecar.
pub fn save_checkpoint<B: Backend>(
    model: &UNet<B>,
    config: &UNetConfig,
    path: &Path,
) -> Result<CheckpointMetadata> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let recorder = NamedMpkGzFileRecorder::<FullPrecisionSettings>::default();
    model
        .clone()
        .save_file(path.to_path_buf(), &recorder)
        .map_err(|e| VolsegError::Checkpoint(format!("failed to save model: {}", e)))?;

    let metadata = CheckpointMetadata {
        created_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        model: config.clone(),
    };
    fs::write(metadata_path(path), serde_json::to_string_pretty(&metadata)?)?;

    tracing::info!(
        "Checkpoint saved to {} ({} parameters)",
        weights_path(path).display(),
        model.num_params()
    );
    Ok(metadata)
}

/// Rebuild the model described by the sidecar and load its weights.
pub fn load_checkpoint<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(UNet<B>, CheckpointMetadata)> {
    let weights = weights_path(path);
    let sidecar = metadata_path(path);
    if !weights.is_file() || !sidecar.is_file() {
        return Err(VolsegError::CheckpointNotFound(path.to_path_buf()));
    }

    let metadata: CheckpointMetadata = serde_json::from_str(&fs::read_to_string(&sidecar)?)?;

    let recorder = NamedMpkGzFileRecorder::<FullPrecisionSettings>::default();
    let model = metadata
        .model
        .init::<B>(device)?
        .load_file(path.to_path_buf(), &recorder, device)
        .map_err(|e| {
            tracing::debug!("Model load failed: {}", e);
            VolsegError::Checkpoint(format!("failed to load {}: {}", weights.display(), e))
        })?;

    tracing::info!(
        "Checkpoint loaded from {} (created {})",
        weights.display(),
        metadata.created_at
    );
    Ok((model, metadata))
}
