use crate::errors::{HearthError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Parsed model hyperparameters and tensor sizing.
///
/// This is the complete surface the scheduler needs: everything else about
/// the weight format stays inside the runner backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Architecture tag (e.g. "llama", "gemma", "phi2", "qwen2")
    pub architecture: String,

    /// Quantization level (e.g. "Q4_0", "F16")
    #[serde(default)]
    pub file_type: String,

    /// Number of repeating transformer blocks
    pub block_count: u64,

    /// Attention head count
    pub head_count: u64,

    /// Key/value head count (grouped-query attention)
    pub head_count_kv: u64,

    /// Embedding width
    pub embedding_length: u64,

    /// Maximum context length the model was trained for
    pub context_length: u64,

    /// Vocabulary size
    #[serde(default)]
    pub vocab_length: u64,

    /// Second dimension of the fused attention QKV tensor, when the
    /// architecture uses one
    #[serde(default)]
    pub attn_qkv_width: Option<u64>,

    /// Second dimension of the expert-routing gate tensor; present only
    /// for mixture-of-experts models
    #[serde(default)]
    pub ffn_gate_width: Option<u64>,

    /// Whether this model only ever runs on the CPU backend
    #[serde(default)]
    pub cpu_only: bool,

    /// Bytes of tensor data per repeating layer, keyed "0".."N-1", plus
    /// "output" for the output layer
    #[serde(default)]
    pub layer_sizes: HashMap<String, u64>,
}

impl ModelMetadata {
    /// Grouped-query attention factor.
    pub fn gqa(&self) -> u64 {
        self.head_count / self.head_count_kv.max(1)
    }

    /// Tensor bytes for one named layer, 0 when the manifest omits it.
    pub fn layer_size(&self, name: &str) -> u64 {
        self.layer_sizes.get(name).copied().unwrap_or(0)
    }

    /// Compute-graph scratch estimate for `(partial, full)` offload, or
    /// `None` when the architecture has no known formula.
    pub fn graph_size(&self, ctx: u64, batch: u64) -> Option<(u64, u64)> {
        let embedding = self.embedding_length;
        let vocab = self.vocab_length;
        let heads = self.head_count;

        let graph = match self.architecture.as_str() {
            "gemma" | "command-r" => 4 * batch * (embedding + vocab),
            "phi2" => {
                let qkv = self.attn_qkv_width.unwrap_or(0);
                std::cmp::max(
                    4 * batch * (embedding + vocab),
                    4 * batch * (1 + 4 * embedding + ctx + qkv + ctx * heads),
                )
            }
            "qwen2" => std::cmp::max(
                4 * batch * (embedding + vocab),
                4 * batch * (1 + 2 * embedding + ctx + ctx * heads),
            ),
            "llama" => match self.ffn_gate_width {
                Some(gate) if gate > 0 => {
                    4 * batch
                        * (2 + 3 * embedding + ctx + ctx * heads + 2 * self.head_count_kv + gate)
                }
                _ => 4 * batch * (1 + 4 * embedding + ctx + ctx * heads),
            },
            _ => return None,
        };

        Some((graph, graph))
    }
}

/// Source of model metadata, keyed by model path.
#[async_trait]
pub trait MetadataLoader: Send + Sync {
    async fn load(&self, path: &Path) -> Result<ModelMetadata>;
}

/// Loads metadata from the JSON manifest the model path points at.
pub struct ManifestLoader;

impl ManifestLoader {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ManifestLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataLoader for ManifestLoader {
    async fn load(&self, path: &Path) -> Result<ModelMetadata> {
        if !path.exists() {
            return Err(HearthError::NotFound(path.to_path_buf()));
        }

        let raw = tokio::fs::read_to_string(path).await?;
        let metadata: ModelMetadata = serde_json::from_str(&raw)?;

        debug!(
            path = %path.display(),
            architecture = %metadata.architecture,
            blocks = metadata.block_count,
            "loaded model metadata"
        );

        Ok(metadata)
    }
}
