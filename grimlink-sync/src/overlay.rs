//! Broadcaster overlay calibration, optionally persisted to a JSON file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::model::Offsets;

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("Overlay file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Overlay file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Shared, cloneable handle to the stored offsets.
#[derive(Debug, Clone, Default)]
pub struct OverlayStore {
    offsets: Arc<RwLock<Option<Offsets>>>,
    path: Option<PathBuf>,
}

impl OverlayStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Back the store with `path`, loading it if it exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, OverlayError> {
        let path = path.as_ref().to_path_buf();
        let offsets = match tokio::fs::read(&path).await {
            Ok(bytes) => Some(serde_json::from_slice::<Offsets>(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(offsets) = &offsets {
            log::info!("Loaded overlay offsets {offsets:?} from {}", path.display());
        }
        Ok(Self {
            offsets: Arc::new(RwLock::new(offsets)),
            path: Some(path),
        })
    }

    pub async fn get(&self) -> Option<Offsets> {
        *self.offsets.read().await
    }

    /// Stored offsets, or the defaults when nothing was calibrated yet.
    pub async fn existing_bounds(&self) -> Offsets {
        self.get().await.unwrap_or_default()
    }

    pub async fn set(&self, offsets: Offsets) -> Result<(), OverlayError> {
        *self.offsets.write().await = Some(offsets);
        if let Some(path) = &self.path {
            let json = serde_json::to_vec_pretty(&offsets)?;
            tokio::fs::write(path, json).await?;
            log::debug!("Persisted overlay offsets to {}", path.display());
        }
        Ok(())
    }
}
