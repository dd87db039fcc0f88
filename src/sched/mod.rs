//! The model runtime scheduler
//!
//! Decides, for each acquire, which resident runner serves a model,
//! whether a new runner must be spun up, and which runners to evict to
//! free accelerator memory. One [`Scheduler`] exists per daemon.
//!
//! ## Locks, in acquisition order
//!
//! 1. `load_lock`: held for the entire `acquire` so fit and eviction
//!    decisions stay coherent.
//! 2. `registry`: short critical sections, never held across an await.
//! 3. each runner's own state lock: refcount, config, expiry clock.
//!
//! The expiry task touches the registry and a runner's state without the
//! load lock; that is safe because it never takes `load_lock` at all.

pub mod fit;
mod runner_ref;

pub use runner_ref::{ActiveRunner, RunnerRef};

use crate::device::{GpuDiscovery, GpuLibrary, GpuList};
use crate::errors::{HearthError, Result};
use crate::model::{MetadataLoader, ModelMetadata, ModelSpec};
use crate::runner::{RunnerFactory, RunnerOptions};
use crate::settings::{self, format_bytes, KeepAlive, Settings};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Deadline on the health probe when deciding whether to reuse a
/// resident runner. Load-bearing for liveness: the probe runs inside the
/// serialized acquire section.
const REUSE_PING_DEADLINE: Duration = Duration::from_secs(10);

/// Pause after an eviction before re-snapshotting accelerator memory;
/// CUDA's free counter lags the actual release.
const EVICTION_SETTLE: Duration = Duration::from_millis(100);

pub(crate) struct SchedulerInner {
    pub(crate) registry: Mutex<HashMap<PathBuf, Arc<RunnerRef>>>,
    load_lock: AsyncMutex<()>,
    settings: Settings,
    gpu_source: Arc<dyn GpuDiscovery>,
    metadata_loader: Arc<dyn MetadataLoader>,
    runner_factory: Arc<dyn RunnerFactory>,
    shutting_down: AtomicBool,
}

/// Registry `model path → runner` plus the admission, fit, and eviction
/// machinery around it.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        settings: Settings,
        gpu_source: Arc<dyn GpuDiscovery>,
        metadata_loader: Arc<dyn MetadataLoader>,
        runner_factory: Arc<dyn RunnerFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                registry: Mutex::new(HashMap::new()),
                load_lock: AsyncMutex::new(()),
                settings,
                gpu_source,
                metadata_loader,
                runner_factory,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Number of resident (or loading) runners.
    pub fn resident_count(&self) -> usize {
        self.inner.registry.lock().unwrap().len()
    }

    /// Paths of all resident runners.
    pub fn resident_models(&self) -> Vec<PathBuf> {
        self.inner.registry.lock().unwrap().keys().cloned().collect()
    }

    /// Get a usable runner for the model, loading or evicting as needed.
    ///
    /// Idempotent for a model already resident with compatible options:
    /// the same runner is returned and the backend is not spawned again.
    /// The caller still admits each request with [`RunnerRef::try_use`].
    pub async fn acquire(
        &self,
        model: &ModelSpec,
        options: RunnerOptions,
        keep_alive: Option<KeepAlive>,
    ) -> Result<Arc<RunnerRef>> {
        debug!(model = %model.path.display(), "acquire called");
        let _serial = self.inner.load_lock.lock().await;
        debug!(model = %model.path.display(), "acquire processing");

        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(HearthError::Cancelled);
        }

        // requests without a keep-alive fall back to the environment,
        // then the configured default
        let keep_alive = keep_alive
            .or_else(settings::env_keep_alive)
            .unwrap_or(self.inner.settings.keep_alive);

        // Step A: reuse a compatible resident runner.
        let existing = {
            let registry = self.inner.registry.lock().unwrap();
            registry.get(&model.path).cloned()
        };
        if let Some(runner) = existing {
            debug!(model = %model.path.display(), "evaluating already loaded");
            if self.reusable(&runner, model, &options).await {
                runner.rearm_with(keep_alive);
                return Ok(runner);
            }

            info!(model = %model.path.display(), "changing loaded model to update settings");
            runner.drain().await;
            runner.teardown().await;
            self.inner.remove_if_same(&model.path, &runner);
        }

        // Step B: fit against the accelerators, evicting until room.
        debug!(model = %model.path.display(), "needs load");
        let metadata = self.inner.metadata_loader.load(&model.path).await?;
        let chosen = self.inner.make_room(model, &metadata, &options).await;

        // Step C: insert a placeholder and load outside the registry lock.
        self.inner
            .load_runner(model, metadata, options, keep_alive, chosen)
            .await
    }

    /// Close every resident runner and refuse further acquires.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let runners: Vec<Arc<RunnerRef>> = {
            self.inner.registry.lock().unwrap().values().cloned().collect()
        };
        for runner in runners {
            debug!(model = %runner.model_path().display(), "shutting down runner");
            runner.drain().await;
            runner.teardown().await;
        }
        self.inner.registry.lock().unwrap().clear();
        info!("all runners closed");
    }

    /// Is the resident runner still the right one for this request?
    async fn reusable(
        &self,
        runner: &Arc<RunnerRef>,
        model: &ModelSpec,
        options: &RunnerOptions,
    ) -> bool {
        if !runner.compatible(model, options) {
            return false;
        }
        let Some(handle) = runner.handle() else {
            return false;
        };
        match tokio::time::timeout(REUSE_PING_DEADLINE, handle.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(model = %model.path.display(), error = %e, "resident runner failed ping");
                false
            }
            Err(_) => {
                warn!(model = %model.path.display(), "resident runner ping timed out");
                false
            }
        }
    }
}

impl SchedulerInner {
    fn remove_if_same(&self, key: &PathBuf, runner: &Arc<RunnerRef>) {
        let mut registry = self.registry.lock().unwrap();
        if let Some(current) = registry.get(key) {
            if Arc::ptr_eq(current, runner) {
                registry.remove(key);
            }
        }
    }

    /// The runner cap for this attempt; the environment wins so operators
    /// can adjust a live daemon.
    fn effective_max_runners(&self) -> usize {
        settings::env_max_runners().unwrap_or(self.settings.max_runners)
    }

    /// Evict until the model fits somewhere, or until nothing is left to
    /// evict. Returns the accelerator set to load onto, or `None` when
    /// the registry emptied without a predicted fit (the backend then
    /// gets the first library group and its own out-of-memory error
    /// surfaces to the caller).
    async fn make_room(
        self: &Arc<Self>,
        model: &ModelSpec,
        metadata: &ModelMetadata,
        options: &RunnerOptions,
    ) -> Option<GpuList> {
        loop {
            let resident = self.registry.lock().unwrap().len();
            if resident == 0 {
                return None;
            }
            debug!(runner_count = resident, "attempting to fit new model with existing models running");

            let mut all_gpus = self.gpu_source.discover();

            // CPU runners coexist without VRAM competition.
            if all_gpus.is_cpu_only() || options.num_gpu == 0 || metadata.cpu_only {
                debug!("cpu mode, allowing multiple model loads");
                return Some(all_gpus);
            }

            let max_runners = self.effective_max_runners();
            if max_runners > 0 && resident >= max_runners {
                debug!(runner_count = resident, "max runners reached, unloading one to make room");
                self.evict_one().await;
                continue;
            }

            self.reconcile_free_memory(&mut all_gpus);

            if let Some(gpus) = search_fit(&all_gpus, metadata, model, options) {
                return Some(gpus);
            }

            debug!(
                model = %model.path.display(),
                "model will not fit in available accelerator memory without unloading another"
            );
            self.evict_one().await;
            tokio::time::sleep(EVICTION_SETTLE).await;
        }
    }

    /// Fold the scheduler's own usage predictions into the reported free
    /// memory. Runner memory ramps as weights load and several libraries
    /// report free memory late, so the snapshot alone cannot be trusted;
    /// free is never raised above what the library reported.
    fn reconcile_free_memory(&self, all_gpus: &mut GpuList) {
        let runners: Vec<Arc<RunnerRef>> = {
            self.registry.lock().unwrap().values().cloned().collect()
        };

        let mut predicted: HashMap<(GpuLibrary, String), u64> = HashMap::new();
        for runner in &runners {
            match runner.vram_footprint() {
                Some((gpus, estimate)) if !gpus.is_empty() => {
                    // TODO break the estimate down by device instead of
                    // assuming uniform spread
                    let per_gpu = estimate / gpus.len() as u64;
                    for g in gpus.iter() {
                        *predicted.entry((g.library, g.id.clone())).or_insert(0) += per_gpu;
                    }
                }
                _ => {
                    warn!("runner reference already torn down, memory prediction may be incorrect");
                }
            }
        }

        for g in all_gpus.devices_mut() {
            let Some(&usage) = predicted.get(&(g.library, g.id.clone())) else {
                continue;
            };
            debug!(
                gpu = %g.id,
                library = %g.library,
                reported_free = %format_bytes(g.free_memory),
                predicted = %format_bytes(usage),
                "reconciling accelerator memory"
            );
            if usage > g.total_memory {
                warn!(
                    gpu = %g.id,
                    total = g.total_memory,
                    predicted = usage,
                    "predicted usage exceeds accelerator memory"
                );
                g.free_memory = 0;
            } else if g.total_memory - usage < g.free_memory {
                g.free_memory = g.total_memory - usage;
            }
        }
    }

    /// Evict one runner: any idle one in keep-alive order, else drain the
    /// one with the shortest keep-alive. Pinned runners sort last, so one
    /// is only chosen when it is the sole candidate.
    async fn evict_one(&self) {
        let mut runners: Vec<Arc<RunnerRef>> = {
            self.registry.lock().unwrap().values().cloned().collect()
        };
        runners.sort_by_key(|r| r.keep_alive_key());

        let victim = runners
            .iter()
            .find(|r| r.is_idle())
            .or_else(|| runners.first())
            .cloned();
        let Some(victim) = victim else { return };

        info!(
            old_model = %victim.model_path().display(),
            "unloading model before its timeout to make room for new model"
        );
        victim.drain().await;
        victim.teardown().await;

        let key = victim.model_path().to_path_buf();
        self.remove_if_same(&key, &victim);
    }

    /// Insert the placeholder and run the backend load in a detached
    /// task. The task itself installs the handle or removes the
    /// placeholder, so an abandoned acquire cannot leak a registry entry.
    async fn load_runner(
        self: &Arc<Self>,
        model: &ModelSpec,
        metadata: ModelMetadata,
        options: RunnerOptions,
        keep_alive: KeepAlive,
        chosen: Option<GpuList>,
    ) -> Result<Arc<RunnerRef>> {
        let placeholder =
            RunnerRef::placeholder(model.path.clone(), Arc::downgrade(self), keep_alive);
        {
            let mut registry = self.registry.lock().unwrap();
            registry.insert(model.path.clone(), placeholder.clone());
            info!(count = registry.len(), "loaded runners");
        }

        let gpus = match chosen {
            Some(gpus) => gpus,
            None => {
                debug!(model = %model.path.display(), "refreshing accelerator info");
                // nothing else resident; narrow to the first library group
                let all = self.gpu_source.discover();
                let mut groups = all.by_library();
                if groups.is_empty() {
                    all
                } else {
                    groups.remove(0)
                }
            }
        };

        let inner = Arc::clone(self);
        let spec = model.clone();
        let load = tokio::spawn(async move {
            match inner
                .runner_factory
                .spawn(&gpus, &spec, &metadata, &options)
                .await
            {
                Ok(runner) => {
                    let installed = placeholder.install(
                        runner.clone(),
                        gpus,
                        spec.adapters.clone(),
                        spec.projectors.clone(),
                        options,
                        keep_alive,
                    );
                    if !installed {
                        // evicted while the backend was still loading
                        runner.close().await;
                        inner.remove_if_same(&spec.path, &placeholder);
                        info!(model = %spec.path.display(), "runner discarded, evicted during load");
                        return Err(HearthError::Unloading(
                            "model was unloaded before it finished loading".to_string(),
                        ));
                    }
                    placeholder.arm_expiry();
                    debug!(model = %spec.path.display(), "finished setting up runner");
                    Ok(placeholder)
                }
                Err(e) => {
                    let e = rewrite_spawn_error(e, &spec);
                    inner.remove_if_same(&spec.path, &placeholder);
                    info!(model = %spec.path.display(), error = %e, "runner spawn failed");
                    Err(e)
                }
            }
        });

        load.await
            .map_err(|e| HearthError::Runner(format!("runner load task failed: {}", e)))?
    }
}

/// Fit search in priority order: any single accelerator of a library
/// first, then each whole library group.
fn search_fit(
    all_gpus: &GpuList,
    metadata: &ModelMetadata,
    model: &ModelSpec,
    options: &RunnerOptions,
) -> Option<GpuList> {
    for group in all_gpus.by_library() {
        for g in group.iter() {
            let single = GpuList::new(vec![g.clone()]);
            let report = fit::predict_layers(&single, metadata, &model.projectors, options);
            if report.fully_offloaded {
                debug!(
                    model = %model.path.display(),
                    gpu = %g.id,
                    required = %format_bytes(report.estimated_vram),
                    "new model will fit on a single accelerator"
                );
                return Some(single);
            }
        }

        let report = fit::predict_layers(&group, metadata, &model.projectors, options);
        if report.fully_offloaded {
            debug!(
                model = %model.path.display(),
                library = %group.devices()[0].library,
                required = %format_bytes(report.estimated_vram),
                "new model will fit across the library group"
            );
            return Some(group);
        }
    }
    None
}

/// Some older models fail against newer backends; generalize those
/// errors into advice to re-pull.
fn rewrite_spawn_error(err: HearthError, model: &ModelSpec) -> HearthError {
    let incompatible = matches!(err, HearthError::UnsupportedFormat)
        || err.to_string().contains("failed to load model");
    if incompatible {
        HearthError::Incompatible {
            model: model.short_name.clone(),
            cause: err.to_string(),
        }
    } else {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::GpuDevice;
    use crate::model::ManifestLoader;
    use crate::runner::mock::{MockRunnerFactory, SpawnFailure};
    use std::collections::HashMap as StdHashMap;
    use tempfile::TempDir;

    const GIB: u64 = 1_073_741_824;

    struct FixedDiscovery(Mutex<GpuList>);

    impl FixedDiscovery {
        fn one_cuda(free: u64) -> Arc<Self> {
            Arc::new(Self(Mutex::new(GpuList::new(vec![GpuDevice::new(
                GpuLibrary::Cuda,
                "0",
                free,
                free,
                0,
            )]))))
        }

        fn cpu_only() -> Arc<Self> {
            Arc::new(Self(Mutex::new(GpuList::new(vec![GpuDevice::new(
                GpuLibrary::Cpu,
                "0",
                16 * GIB,
                16 * GIB,
                0,
            )]))))
        }
    }

    impl GpuDiscovery for FixedDiscovery {
        fn discover(&self) -> GpuList {
            self.0.lock().unwrap().clone()
        }
    }

    struct TestBed {
        scheduler: Scheduler,
        factory: Arc<MockRunnerFactory>,
        dir: TempDir,
    }

    fn testbed(gpu: Arc<FixedDiscovery>) -> TestBed {
        testbed_with(gpu, Settings::default())
    }

    fn testbed_with(gpu: Arc<FixedDiscovery>, settings: Settings) -> TestBed {
        let factory = Arc::new(MockRunnerFactory::new());
        TestBed {
            scheduler: Scheduler::new(
                settings,
                gpu,
                Arc::new(ManifestLoader::new()),
                factory.clone(),
            ),
            factory,
            dir: TempDir::new().unwrap(),
        }
    }

    impl TestBed {
        fn manifest(&self, name: &str, meta: &ModelMetadata) -> ModelSpec {
            let path = self.dir.path().join(name);
            std::fs::write(&path, serde_json::to_string(meta).unwrap()).unwrap();
            ModelSpec::new(path)
        }
    }

    fn metadata(blocks: u64, layer_bytes: u64) -> ModelMetadata {
        let mut layer_sizes = StdHashMap::new();
        for i in 0..blocks {
            layer_sizes.insert(i.to_string(), layer_bytes);
        }
        layer_sizes.insert("output".to_string(), layer_bytes);
        ModelMetadata {
            architecture: "llama".to_string(),
            file_type: "Q4_0".to_string(),
            block_count: blocks,
            head_count: 32,
            head_count_kv: 32,
            embedding_length: 4096,
            context_length: 4096,
            vocab_length: 32000,
            attn_qkv_width: None,
            ffn_gate_width: None,
            cpu_only: false,
            layer_sizes,
        }
    }

    #[tokio::test]
    async fn test_cold_load_fits_single_gpu() {
        let bed = testbed(FixedDiscovery::one_cuda(16 * GIB));
        let spec = bed.manifest("small.manifest", &metadata(32, 100_000_000));

        let runner = bed
            .scheduler
            .acquire(&spec, RunnerOptions::default(), None)
            .await
            .unwrap();

        assert_eq!(bed.scheduler.resident_count(), 1);
        assert_eq!(bed.factory.spawn_count(), 1);
        assert!(runner.is_loaded());
        // mock estimate defaults to the sum of layer sizes
        assert_eq!(runner.estimated_vram(), 33 * 100_000_000);

        let guard = runner.try_use().unwrap();
        guard.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_warm_reuse_same_handle_no_second_spawn() {
        let bed = testbed(FixedDiscovery::one_cuda(16 * GIB));
        let spec = bed.manifest("small.manifest", &metadata(32, 100_000_000));

        let first = bed
            .scheduler
            .acquire(&spec, RunnerOptions::default(), None)
            .await
            .unwrap();

        // second acquire differs only in the offload layer count
        let mut opts = RunnerOptions::default();
        opts.num_gpu = 20;
        let second = bed.scheduler.acquire(&spec, opts, None).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(bed.factory.spawn_count(), 1);
        assert_eq!(bed.scheduler.resident_count(), 1);
    }

    #[tokio::test]
    async fn test_option_change_reloads() {
        let bed = testbed(FixedDiscovery::one_cuda(16 * GIB));
        let spec = bed.manifest("small.manifest", &metadata(32, 100_000_000));

        bed.scheduler
            .acquire(&spec, RunnerOptions::default(), None)
            .await
            .unwrap();
        let first_instance = bed.factory.last_spawned(&spec.path).unwrap();

        let mut opts = RunnerOptions::default();
        opts.num_ctx = 4096;
        bed.scheduler.acquire(&spec, opts, None).await.unwrap();

        assert_eq!(bed.factory.spawn_count(), 2);
        assert_eq!(bed.scheduler.resident_count(), 1);
        assert!(first_instance.is_closed());
        assert_eq!(first_instance.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_ping_forces_reload() {
        let bed = testbed(FixedDiscovery::one_cuda(16 * GIB));
        let spec = bed.manifest("small.manifest", &metadata(32, 100_000_000));

        bed.scheduler
            .acquire(&spec, RunnerOptions::default(), None)
            .await
            .unwrap();
        bed.factory.last_spawned(&spec.path).unwrap().poison_ping();

        let runner = bed
            .scheduler
            .acquire(&spec, RunnerOptions::default(), None)
            .await
            .unwrap();

        assert_eq!(bed.factory.spawn_count(), 2);
        assert!(runner.is_loaded());
        assert_eq!(bed.scheduler.resident_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_ping_times_out_and_reloads() {
        let bed = testbed(FixedDiscovery::one_cuda(16 * GIB));
        let spec = bed.manifest("small.manifest", &metadata(32, 100_000_000));

        // pinned so the idle clock cannot fire while the paused clock
        // fast-forwards through the ping deadline
        bed.scheduler
            .acquire(&spec, RunnerOptions::default(), Some(KeepAlive::Forever))
            .await
            .unwrap();
        bed.factory.last_spawned(&spec.path).unwrap().hang_ping();

        bed.scheduler
            .acquire(&spec, RunnerOptions::default(), Some(KeepAlive::Forever))
            .await
            .unwrap();

        assert_eq!(bed.factory.spawn_count(), 2);
        assert_eq!(bed.scheduler.resident_count(), 1);
    }

    #[tokio::test]
    async fn test_metadata_not_found_propagates() {
        let bed = testbed(FixedDiscovery::one_cuda(16 * GIB));
        let spec = ModelSpec::new("/no/such/model.manifest");

        let err = bed
            .scheduler
            .acquire(&spec, RunnerOptions::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HearthError::NotFound(_)));
        assert_eq!(bed.factory.spawn_count(), 0);
        assert_eq!(bed.scheduler.resident_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_removes_placeholder_and_hints() {
        let bed = testbed(FixedDiscovery::one_cuda(16 * GIB));
        let spec = bed.manifest("old.manifest", &metadata(32, 100_000_000));
        bed.factory
            .inject_failure(spec.path.clone(), SpawnFailure::LoadFailed);

        let err = bed
            .scheduler
            .acquire(&spec, RunnerOptions::default(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, HearthError::Incompatible { .. }));
        assert!(err.to_string().contains("hearth pull"));
        assert_eq!(bed.scheduler.resident_count(), 0);
    }

    #[tokio::test]
    async fn test_backend_oom_surfaces_when_nothing_left_to_evict() {
        // with an empty registry there is nothing to evict; the backend
        // is asked to load anyway and its allocation failure surfaces
        let bed = testbed(FixedDiscovery::one_cuda(GIB));
        let spec = bed.manifest("huge.manifest", &metadata(80, 900_000_000));
        bed.factory
            .inject_failure(spec.path.clone(), SpawnFailure::OutOfMemory);

        let err = bed
            .scheduler
            .acquire(&spec, RunnerOptions::default(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, HearthError::InsufficientMemory(_)));
        assert_eq!(bed.scheduler.resident_count(), 0);
    }

    #[tokio::test]
    async fn test_eviction_makes_room_when_nothing_fits() {
        // 16 GiB device; two ~7.5 GiB loads fill it, the third forces an
        // eviction of the idle shortest-keep-alive runner
        let bed = testbed(FixedDiscovery::one_cuda(16 * GIB));
        let meta = metadata(32, 190_000_000);
        let a = bed.manifest("a.manifest", &meta);
        let b = bed.manifest("b.manifest", &meta);
        let c = bed.manifest("c.manifest", &meta);

        let short = Some(KeepAlive::For(Duration::from_secs(60)));
        let long = Some(KeepAlive::For(Duration::from_secs(600)));

        bed.scheduler
            .acquire(&a, RunnerOptions::default(), short)
            .await
            .unwrap();
        bed.scheduler
            .acquire(&b, RunnerOptions::default(), long)
            .await
            .unwrap();
        assert_eq!(bed.scheduler.resident_count(), 2);

        bed.scheduler
            .acquire(&c, RunnerOptions::default(), long)
            .await
            .unwrap();

        // a (shortest keep-alive, idle) was evicted to fit c
        let resident = bed.scheduler.resident_models();
        assert_eq!(resident.len(), 2);
        assert!(!resident.contains(&a.path));
        assert!(bed.factory.last_spawned(&a.path).unwrap().is_closed());
        assert!(!bed.factory.last_spawned(&b.path).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_max_runners_cap_evicts() {
        let mut settings = Settings::default();
        settings.max_runners = 1;
        let bed = testbed_with(FixedDiscovery::one_cuda(64 * GIB), settings);

        let meta = metadata(32, 100_000_000);
        let a = bed.manifest("a.manifest", &meta);
        let b = bed.manifest("b.manifest", &meta);

        bed.scheduler
            .acquire(&a, RunnerOptions::default(), None)
            .await
            .unwrap();
        bed.scheduler
            .acquire(&b, RunnerOptions::default(), None)
            .await
            .unwrap();

        assert_eq!(bed.scheduler.resident_count(), 1);
        assert!(bed.factory.last_spawned(&a.path).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_cpu_only_models_coexist() {
        let bed = testbed(FixedDiscovery::cpu_only());
        let meta = metadata(32, 400_000_000);
        let a = bed.manifest("a.manifest", &meta);
        let b = bed.manifest("b.manifest", &meta);

        bed.scheduler
            .acquire(&a, RunnerOptions::default(), None)
            .await
            .unwrap();
        bed.scheduler
            .acquire(&b, RunnerOptions::default(), None)
            .await
            .unwrap();

        assert_eq!(bed.scheduler.resident_count(), 2);
    }

    #[tokio::test]
    async fn test_num_gpu_zero_skips_vram_competition() {
        let bed = testbed(FixedDiscovery::one_cuda(GIB));
        let meta = metadata(32, 400_000_000); // far larger than the device
        let a = bed.manifest("a.manifest", &meta);
        let b = bed.manifest("b.manifest", &meta);

        let mut opts = RunnerOptions::default();
        opts.num_gpu = 0;

        bed.scheduler.acquire(&a, opts.clone(), None).await.unwrap();
        bed.scheduler.acquire(&b, opts, None).await.unwrap();

        assert_eq!(bed.scheduler.resident_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_unloads() {
        let bed = testbed(FixedDiscovery::one_cuda(16 * GIB));
        let spec = bed.manifest("small.manifest", &metadata(32, 100_000_000));

        bed.scheduler
            .acquire(
                &spec,
                RunnerOptions::default(),
                Some(KeepAlive::For(Duration::from_secs(30))),
            )
            .await
            .unwrap();
        assert_eq!(bed.scheduler.resident_count(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;

        assert_eq!(bed.scheduler.resident_count(), 0);
        let mock = bed.factory.last_spawned(&spec.path).unwrap();
        assert!(mock.is_closed());
        assert_eq!(mock.close_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_restarts_idle_clock() {
        let bed = testbed(FixedDiscovery::one_cuda(16 * GIB));
        let spec = bed.manifest("small.manifest", &metadata(32, 100_000_000));

        let runner = bed
            .scheduler
            .acquire(
                &spec,
                RunnerOptions::default(),
                Some(KeepAlive::For(Duration::from_secs(30))),
            )
            .await
            .unwrap();

        let guard = runner.try_use().unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        drop(guard); // restarts the 30 second clock

        tokio::time::advance(Duration::from_secs(15)).await;
        tokio::task::yield_now().await;
        assert_eq!(bed.scheduler.resident_count(), 1);

        tokio::time::advance(Duration::from_secs(20)).await;
        tokio::task::yield_now().await;
        assert_eq!(bed.scheduler.resident_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pinned_runner_never_expires() {
        let bed = testbed(FixedDiscovery::one_cuda(16 * GIB));
        let spec = bed.manifest("small.manifest", &metadata(32, 100_000_000));

        bed.scheduler
            .acquire(&spec, RunnerOptions::default(), Some(KeepAlive::Forever))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(24 * 3600)).await;
        tokio::task::yield_now().await;

        assert_eq!(bed.scheduler.resident_count(), 1);
        assert!(!bed.factory.last_spawned(&spec.path).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_and_rejects_acquire() {
        let bed = testbed(FixedDiscovery::one_cuda(16 * GIB));
        let spec = bed.manifest("small.manifest", &metadata(32, 100_000_000));

        bed.scheduler
            .acquire(&spec, RunnerOptions::default(), None)
            .await
            .unwrap();
        bed.scheduler.shutdown().await;

        assert_eq!(bed.scheduler.resident_count(), 0);
        assert!(bed.factory.last_spawned(&spec.path).unwrap().is_closed());

        let err = bed
            .scheduler
            .acquire(&spec, RunnerOptions::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HearthError::Cancelled));
    }

    #[tokio::test]
    async fn test_rewrite_spawn_error() {
        let spec = ModelSpec::new("/m/old.manifest").with_short_name("old:latest");

        let rewritten = rewrite_spawn_error(HearthError::UnsupportedFormat, &spec);
        assert!(matches!(rewritten, HearthError::Incompatible { .. }));

        let rewritten = rewrite_spawn_error(
            HearthError::Runner("failed to load model /m/old".to_string()),
            &spec,
        );
        assert!(matches!(rewritten, HearthError::Incompatible { .. }));

        let passthrough = rewrite_spawn_error(
            HearthError::Runner("subprocess exited".to_string()),
            &spec,
        );
        assert!(matches!(passthrough, HearthError::Runner(_)));
    }
}
