//! Model descriptions consumed by the scheduler
//!
//! [`ModelSpec`] is what callers hand to `Scheduler::acquire`: a weight
//! path plus auxiliary adapter/projector files. [`ModelMetadata`] is the
//! parsed hyperparameter surface the fit predictor reasons over, produced
//! by a [`MetadataLoader`].

mod metadata;

pub use metadata::{ManifestLoader, MetadataLoader, ModelMetadata};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A model as addressed by callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Path to the model manifest on disk; registry key for the runtime
    pub path: PathBuf,

    /// Short human name used in user-facing hints (e.g. "llama2:7b")
    pub short_name: String,

    /// LoRA adapter weight files applied at load time
    pub adapters: Vec<PathBuf>,

    /// Multimodal projector weight files
    pub projectors: Vec<PathBuf>,
}

impl ModelSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let short_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            path,
            short_name,
            adapters: Vec::new(),
            projectors: Vec::new(),
        }
    }

    pub fn with_short_name(mut self, name: impl Into<String>) -> Self {
        self.short_name = name.into();
        self
    }

    pub fn with_adapters(mut self, adapters: Vec<PathBuf>) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn with_projectors(mut self, projectors: Vec<PathBuf>) -> Self {
        self.projectors = projectors;
        self
    }
}

/// On-disk size of an auxiliary weight file, 0 when unreadable.
///
/// Projectors load fully into accelerator memory, so their file size is
/// the memory they will claim.
pub fn auxiliary_file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
