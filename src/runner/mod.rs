//! The native inference backend seam
//!
//! A [`Runner`] is one loaded model instance: a heavy subprocess (or
//! in-process engine) holding quantized weights and a KV cache. The
//! scheduler never looks inside; it spawns runners through a
//! [`RunnerFactory`], admits requests against them, and closes them to
//! reclaim accelerator memory.
//!
//! The [`mock`] backend implements both traits deterministically and is
//! what the daemon wires in until a subprocess backend is configured; it
//! is also what the scheduler tests drive.

pub mod mock;

use crate::device::GpuList;
use crate::errors::Result;
use crate::model::{ModelMetadata, ModelSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Options a runner is loaded with.
///
/// `num_ctx`, `num_batch`, and `num_gpu` shape the memory fit; the rest
/// are sampling knobs the scheduler carries but never interprets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerOptions {
    /// Requested context window (clamped by the fit predictor)
    pub num_ctx: u64,

    /// Prompt processing batch size
    pub num_batch: u64,

    /// Requested layer offload count; -1 means "as many as fit"
    pub num_gpu: i64,

    /// Worker threads for the CPU portion; 0 lets the backend pick
    pub num_thread: u32,

    pub temperature: f32,
    pub top_p: f32,
    pub seed: i64,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            num_ctx: 2048,
            num_batch: 512,
            num_gpu: -1,
            num_thread: 0,
            temperature: 0.8,
            top_p: 0.9,
            seed: 0,
        }
    }
}

impl RunnerOptions {
    /// Equality with the offload layer count masked out.
    ///
    /// How many layers actually landed on the accelerator is an outcome
    /// of loading, not a compatibility attribute, so two option sets that
    /// differ only in `num_gpu` can share a resident runner.
    pub fn compatible_with(&self, other: &RunnerOptions) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.num_gpu = -1;
        b.num_gpu = -1;
        a == b
    }
}

/// One completion request against a loaded runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(default)]
    pub stop: Vec<String>,
}

/// One streamed completion fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChunk {
    pub content: String,
    pub done: bool,
}

/// A live model instance.
///
/// The backend enforces its own slot limit internally; the scheduler may
/// have many requests in flight against one runner.
#[async_trait]
pub trait Runner: Send + Sync + std::fmt::Debug {
    /// Health probe; used with a deadline when deciding runner reuse
    async fn ping(&self) -> Result<()>;

    /// Stream a completion; chunks flow through `tx` until `done`
    async fn completion(
        &self,
        req: CompletionRequest,
        tx: mpsc::Sender<CompletionChunk>,
    ) -> Result<()>;

    /// Embed a prompt
    async fn embedding(&self, prompt: &str) -> Result<Vec<f64>>;

    /// Tokenize text with the model's tokenizer
    async fn tokenize(&self, content: &str) -> Result<Vec<i32>>;

    /// Reassemble text from tokens
    async fn detokenize(&self, tokens: &[i32]) -> Result<String>;

    /// Tear the instance down and release its accelerator memory.
    /// Idempotence is the caller's responsibility; the scheduler closes
    /// each runner exactly once.
    async fn close(&self);

    /// Backend's own estimate of accelerator bytes this instance holds.
    /// Recorded at load time and used when fitting *other* models.
    fn estimated_vram(&self) -> u64;
}

/// Spawns runner instances on a chosen accelerator set.
#[async_trait]
pub trait RunnerFactory: Send + Sync {
    async fn spawn(
        &self,
        gpus: &GpuList,
        spec: &ModelSpec,
        metadata: &ModelMetadata,
        options: &RunnerOptions,
    ) -> Result<Arc<dyn Runner>>;
}
