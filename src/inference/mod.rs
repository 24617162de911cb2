use crate::error::LoadError;
use crate::models::validator;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Speech engine that consumes a model directory.
///
/// The lifecycle manager owns when models are loaded and unloaded; engines
/// only need to accept or reject a directory.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Load the model stored in `model_dir`
    async fn load_model(&self, model_dir: &Path) -> Result<(), LoadError>;

    /// Release the current model, if any
    async fn unload_model(&self);

    /// Get engine name for logging/debugging
    fn engine_name(&self) -> &str;
}

/// Engine that accepts any directory holding the required components.
///
/// Used by the CLI, which manages artifacts but runs no inference itself.
#[derive(Debug, Default)]
pub struct LayoutCheckEngine {
    loaded: Mutex<Option<PathBuf>>,
}

impl LayoutCheckEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory of the currently loaded model
    #[must_use]
    pub fn loaded(&self) -> Option<PathBuf> {
        self.loaded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl InferenceEngine for LayoutCheckEngine {
    async fn load_model(&self, model_dir: &Path) -> Result<(), LoadError> {
        let missing = validator::missing_components(model_dir);
        if !missing.is_empty() {
            return Err(LoadError(format!(
                "{} is missing {}",
                model_dir.display(),
                missing.join(", ")
            )));
        }

        tracing::info!(path = %model_dir.display(), "Model layout accepted");
        *self
            .loaded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(model_dir.to_path_buf());
        Ok(())
    }

    async fn unload_model(&self) {
        let previous = self
            .loaded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(path) = previous {
            tracing::debug!(path = %path.display(), "Model unloaded");
        }
    }

    fn engine_name(&self) -> &str {
        "layout-check"
    }
}
