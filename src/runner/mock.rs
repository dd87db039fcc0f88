//! Deterministic in-process runner backend
//!
//! Stands in for the native subprocess backend: spawns instantly (or with
//! a configured delay), reports a configurable VRAM estimate, and keeps
//! counters the scheduler tests assert on (spawn calls per model, close
//! calls per instance, injected spawn failures, ping health).
//!
//! The `serve` command wires this backend in until a subprocess backend
//! is configured, mirroring how the daemon boots in CI.

use super::{CompletionChunk, CompletionRequest, Runner, RunnerFactory, RunnerOptions};
use crate::device::GpuList;
use crate::errors::{HearthError, Result};
use crate::model::{ModelMetadata, ModelSpec};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Injectable spawn failure modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnFailure {
    /// The backend cannot read the weight format at all
    UnsupportedFormat,
    /// The backend started but the weights would not load
    LoadFailed,
    /// The backend ran out of accelerator memory
    OutOfMemory,
}

impl SpawnFailure {
    fn into_error(self, model: &str) -> HearthError {
        match self {
            SpawnFailure::UnsupportedFormat => HearthError::UnsupportedFormat,
            SpawnFailure::LoadFailed => {
                HearthError::Runner(format!("failed to load model {}", model))
            }
            SpawnFailure::OutOfMemory => HearthError::InsufficientMemory(format!(
                "backend could not allocate weights for {}",
                model
            )),
        }
    }
}

/// One mock model instance.
#[derive(Debug)]
pub struct MockRunner {
    id: Uuid,
    model: PathBuf,
    estimated_vram: u64,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    ping_ok: AtomicBool,
    ping_hang: AtomicBool,
}

impl MockRunner {
    pub fn model(&self) -> &PathBuf {
        &self.model
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// How many times `close` ran; the scheduler must make this exactly 1
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Make subsequent pings fail (simulates a wedged subprocess)
    pub fn poison_ping(&self) {
        self.ping_ok.store(false, Ordering::SeqCst);
    }

    /// Make subsequent pings hang past any reasonable deadline
    pub fn hang_ping(&self) {
        self.ping_hang.store(true, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(HearthError::Runner(format!(
                "runner {} is closed",
                self.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Runner for MockRunner {
    async fn ping(&self) -> Result<()> {
        self.ensure_open()?;
        if self.ping_hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if !self.ping_ok.load(Ordering::SeqCst) {
            return Err(HearthError::Runner(format!(
                "runner {} did not answer ping",
                self.id
            )));
        }
        Ok(())
    }

    async fn completion(
        &self,
        req: CompletionRequest,
        tx: mpsc::Sender<CompletionChunk>,
    ) -> Result<()> {
        self.ensure_open()?;
        let _ = tx
            .send(CompletionChunk {
                content: format!("echo: {}", req.prompt),
                done: false,
            })
            .await;
        let _ = tx
            .send(CompletionChunk {
                content: String::new(),
                done: true,
            })
            .await;
        Ok(())
    }

    async fn embedding(&self, prompt: &str) -> Result<Vec<f64>> {
        self.ensure_open()?;
        Ok(prompt.bytes().map(|b| b as f64 / 255.0).collect())
    }

    async fn tokenize(&self, content: &str) -> Result<Vec<i32>> {
        self.ensure_open()?;
        Ok(content
            .split_whitespace()
            .enumerate()
            .map(|(i, _)| i as i32)
            .collect())
    }

    async fn detokenize(&self, tokens: &[i32]) -> Result<String> {
        self.ensure_open()?;
        Ok(tokens
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(" "))
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        debug!(runner = %self.id, model = %self.model.display(), "mock runner closed");
    }

    fn estimated_vram(&self) -> u64 {
        self.estimated_vram
    }
}

/// Factory for mock runners with per-model estimates and failure injection.
pub struct MockRunnerFactory {
    estimates: Mutex<HashMap<PathBuf, u64>>,
    failures: Mutex<HashMap<PathBuf, SpawnFailure>>,
    spawn_delay: Mutex<Duration>,
    spawn_count: AtomicUsize,
    spawned: Mutex<Vec<Arc<MockRunner>>>,
}

impl MockRunnerFactory {
    pub fn new() -> Self {
        Self {
            estimates: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            spawn_delay: Mutex::new(Duration::ZERO),
            spawn_count: AtomicUsize::new(0),
            spawned: Mutex::new(Vec::new()),
        }
    }

    /// Fix the VRAM estimate reported for a model path
    pub fn with_estimate(self, model: impl Into<PathBuf>, bytes: u64) -> Self {
        self.estimates.lock().unwrap().insert(model.into(), bytes);
        self
    }

    /// Inject a failure for every spawn of the given model
    pub fn with_failure(self, model: impl Into<PathBuf>, failure: SpawnFailure) -> Self {
        self.failures.lock().unwrap().insert(model.into(), failure);
        self
    }

    /// Simulate slow subprocess startup
    pub fn with_spawn_delay(self, delay: Duration) -> Self {
        *self.spawn_delay.lock().unwrap() = delay;
        self
    }

    /// Fix a VRAM estimate on an already-shared factory
    pub fn set_estimate(&self, model: impl Into<PathBuf>, bytes: u64) {
        self.estimates.lock().unwrap().insert(model.into(), bytes);
    }

    /// Inject a failure on an already-shared factory
    pub fn inject_failure(&self, model: impl Into<PathBuf>, failure: SpawnFailure) {
        self.failures.lock().unwrap().insert(model.into(), failure);
    }

    /// Total spawn calls that reached the backend
    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }

    /// Every instance ever spawned, in order
    pub fn spawned(&self) -> Vec<Arc<MockRunner>> {
        self.spawned.lock().unwrap().clone()
    }

    /// The most recent instance spawned for a model
    pub fn last_spawned(&self, model: &PathBuf) -> Option<Arc<MockRunner>> {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| &r.model == model)
            .cloned()
    }

    fn estimate_for(&self, spec: &ModelSpec, metadata: &ModelMetadata) -> u64 {
        if let Some(&bytes) = self.estimates.lock().unwrap().get(&spec.path) {
            return bytes;
        }
        let from_layers: u64 = metadata.layer_sizes.values().sum();
        if from_layers > 0 {
            from_layers
        } else {
            1_073_741_824
        }
    }
}

impl Default for MockRunnerFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunnerFactory for MockRunnerFactory {
    async fn spawn(
        &self,
        gpus: &GpuList,
        spec: &ModelSpec,
        metadata: &ModelMetadata,
        options: &RunnerOptions,
    ) -> Result<Arc<dyn Runner>> {
        self.spawn_count.fetch_add(1, Ordering::SeqCst);

        let delay = *self.spawn_delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        if let Some(failure) = self.failures.lock().unwrap().get(&spec.path) {
            return Err(failure.into_error(&spec.short_name));
        }

        let runner = Arc::new(MockRunner {
            id: Uuid::new_v4(),
            model: spec.path.clone(),
            estimated_vram: self.estimate_for(spec, metadata),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            ping_ok: AtomicBool::new(true),
            ping_hang: AtomicBool::new(false),
        });

        info!(
            runner = %runner.id,
            model = %spec.path.display(),
            gpu_count = gpus.len(),
            num_ctx = options.num_ctx,
            vram = runner.estimated_vram,
            "mock runner spawned"
        );

        self.spawned.lock().unwrap().push(runner.clone());
        Ok(runner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{GpuDevice, GpuLibrary};
    use std::collections::HashMap as StdHashMap;

    fn tiny_metadata() -> ModelMetadata {
        ModelMetadata {
            architecture: "llama".to_string(),
            file_type: "Q4_0".to_string(),
            block_count: 2,
            head_count: 4,
            head_count_kv: 4,
            embedding_length: 64,
            context_length: 2048,
            vocab_length: 1000,
            attn_qkv_width: None,
            ffn_gate_width: None,
            cpu_only: false,
            layer_sizes: StdHashMap::new(),
        }
    }

    fn one_gpu() -> GpuList {
        GpuList::new(vec![GpuDevice::new(
            GpuLibrary::Cuda,
            "0",
            16_000_000_000,
            16_000_000_000,
            0,
        )])
    }

    #[tokio::test]
    async fn test_spawn_and_ops() {
        let factory = MockRunnerFactory::new().with_estimate("/m/a", 5_000_000_000);
        let spec = ModelSpec::new("/m/a");
        let runner = factory
            .spawn(&one_gpu(), &spec, &tiny_metadata(), &RunnerOptions::default())
            .await
            .unwrap();

        assert_eq!(runner.estimated_vram(), 5_000_000_000);
        runner.ping().await.unwrap();

        let tokens = runner.tokenize("one two three").await.unwrap();
        assert_eq!(tokens.len(), 3);

        let (tx, mut rx) = mpsc::channel(8);
        runner
            .completion(
                CompletionRequest {
                    prompt: "hi".to_string(),
                    stop: vec![],
                },
                tx,
            )
            .await
            .unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.content, "echo: hi");
    }

    #[tokio::test]
    async fn test_close_rejects_ops() {
        let factory = MockRunnerFactory::new();
        let spec = ModelSpec::new("/m/a");
        let runner = factory
            .spawn(&one_gpu(), &spec, &tiny_metadata(), &RunnerOptions::default())
            .await
            .unwrap();

        runner.close().await;
        assert!(runner.ping().await.is_err());

        let mock = factory.last_spawned(&spec.path).unwrap();
        assert!(mock.is_closed());
        assert_eq!(mock.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let factory =
            MockRunnerFactory::new().with_failure("/m/bad", SpawnFailure::UnsupportedFormat);
        let spec = ModelSpec::new("/m/bad");
        let err = factory
            .spawn(&one_gpu(), &spec, &tiny_metadata(), &RunnerOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HearthError::UnsupportedFormat));
        assert_eq!(factory.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_poisoned_ping() {
        let factory = MockRunnerFactory::new();
        let spec = ModelSpec::new("/m/a");
        let runner = factory
            .spawn(&one_gpu(), &spec, &tiny_metadata(), &RunnerOptions::default())
            .await
            .unwrap();

        factory.last_spawned(&spec.path).unwrap().poison_ping();
        assert!(runner.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_default_estimate_from_layer_sizes() {
        let factory = MockRunnerFactory::new();
        let mut meta = tiny_metadata();
        meta.layer_sizes.insert("0".to_string(), 400);
        meta.layer_sizes.insert("output".to_string(), 100);
        let runner = factory
            .spawn(
                &one_gpu(),
                &ModelSpec::new("/m/a"),
                &meta,
                &RunnerOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(runner.estimated_vram(), 500);
    }
}
