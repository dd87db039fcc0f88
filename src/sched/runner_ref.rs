use super::SchedulerInner;
use crate::device::GpuList;
use crate::errors::{HearthError, Result};
use crate::model::ModelSpec;
use crate::runner::{Runner, RunnerOptions};
use crate::settings::KeepAlive;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tracing::{debug, info};

/// A resident (or loading) model runner with request refcounting and
/// drain-before-evict semantics.
///
/// State transitions: a ref is created as a registry placeholder, becomes
/// resident when the backend handle is installed, drains once `unloading`
/// flips (sticky; it never clears), and is torn down when the handle is
/// taken and closed. A `None` handle means torn down (or not yet loaded);
/// either way no new use is admitted.
#[derive(Debug)]
pub struct RunnerRef {
    key: PathBuf,
    sched: Weak<SchedulerInner>,
    state: Mutex<RefState>,
    drained: Notify,
}

#[derive(Debug)]
struct RefState {
    runner: Option<Arc<dyn Runner>>,
    gpus: GpuList,
    estimated_vram: u64,
    adapters: Vec<PathBuf>,
    projectors: Vec<PathBuf>,
    options: Option<RunnerOptions>,
    keep_alive: KeepAlive,
    ref_count: usize,
    unloading: bool,
    expiry_generation: u64,
}

impl RunnerRef {
    pub(crate) fn placeholder(
        key: PathBuf,
        sched: Weak<SchedulerInner>,
        keep_alive: KeepAlive,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            sched,
            state: Mutex::new(RefState {
                runner: None,
                gpus: GpuList::default(),
                estimated_vram: 0,
                adapters: Vec::new(),
                projectors: Vec::new(),
                options: None,
                keep_alive,
                ref_count: 0,
                unloading: false,
                expiry_generation: 0,
            }),
            drained: Notify::new(),
        })
    }

    /// Registry key this ref was loaded under.
    pub fn model_path(&self) -> &Path {
        &self.key
    }

    /// Whether the backend handle is live.
    pub fn is_loaded(&self) -> bool {
        self.state.lock().unwrap().runner.is_some()
    }

    /// Bytes the fit accounting attributes to this runner.
    pub fn estimated_vram(&self) -> u64 {
        self.state.lock().unwrap().estimated_vram
    }

    /// Admit one request against this runner.
    ///
    /// The teardown and unloading checks happen before the refcount moves,
    /// so a runner that began unloading deterministically rejects instead
    /// of admitting a doomed request.
    pub fn try_use(self: &Arc<Self>) -> Result<ActiveRunner> {
        let mut st = self.state.lock().unwrap();

        let Some(runner) = st.runner.clone() else {
            info!(model = %self.key.display(), "request rejected after model was unloaded");
            return Err(HearthError::Unloading(
                "model was unloaded to make room for another model".to_string(),
            ));
        };

        if st.unloading {
            info!(model = %self.key.display(), "request rejected while model is unloading");
            return Err(HearthError::Unloading("model is being unloaded".to_string()));
        }

        // The backend enforces its own slot limit, so any number of
        // admitted requests may be in flight here.
        st.ref_count += 1;

        Ok(ActiveRunner {
            runner,
            runner_ref: Arc::clone(self),
        })
    }

    fn release(self: &Arc<Self>) {
        let now_idle = {
            let mut st = self.state.lock().unwrap();
            st.ref_count -= 1;
            st.ref_count == 0
        };
        if now_idle {
            self.drained.notify_waiters();
        }
        self.arm_expiry();
    }

    /// Adopt a freshly spawned backend handle.
    ///
    /// Returns false when this ref was already evicted while the backend
    /// was loading (an abandoned acquire followed by eviction); the
    /// caller must close the handle it still holds.
    pub(crate) fn install(
        &self,
        runner: Arc<dyn Runner>,
        gpus: GpuList,
        adapters: Vec<PathBuf>,
        projectors: Vec<PathBuf>,
        options: RunnerOptions,
        keep_alive: KeepAlive,
    ) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.unloading {
            return false;
        }
        st.estimated_vram = runner.estimated_vram();
        st.runner = Some(runner);
        st.gpus = gpus;
        st.adapters = adapters;
        st.projectors = projectors;
        st.options = Some(options);
        st.keep_alive = keep_alive;
        true
    }

    /// Does a resident runner already satisfy this spec and option set?
    /// Layer offload count is masked out of the comparison.
    pub(crate) fn compatible(&self, spec: &ModelSpec, options: &RunnerOptions) -> bool {
        let st = self.state.lock().unwrap();
        match &st.options {
            Some(existing) => {
                st.adapters == spec.adapters
                    && st.projectors == spec.projectors
                    && existing.compatible_with(options)
            }
            None => false,
        }
    }

    /// Clone of the live backend handle, if any.
    pub(crate) fn handle(&self) -> Option<Arc<dyn Runner>> {
        self.state.lock().unwrap().runner.clone()
    }

    /// Accelerator set and VRAM estimate for memory reconciliation.
    /// `None` once the runner is torn down.
    pub(crate) fn vram_footprint(&self) -> Option<(GpuList, u64)> {
        let st = self.state.lock().unwrap();
        st.runner
            .as_ref()
            .map(|_| (st.gpus.clone(), st.estimated_vram))
    }

    pub(crate) fn keep_alive_key(&self) -> u128 {
        self.state.lock().unwrap().keep_alive.order_key()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.state.lock().unwrap().ref_count == 0
    }

    /// Adopt a new keep-alive and restart the idle clock.
    pub(crate) fn rearm_with(self: &Arc<Self>, keep_alive: KeepAlive) {
        self.state.lock().unwrap().keep_alive = keep_alive;
        self.arm_expiry();
    }

    /// Start (or restart) the idle expiry clock.
    ///
    /// Each arming invalidates the previous one through a generation
    /// counter rather than cancellation, so a timer that has already
    /// started unloading is never interrupted mid-teardown. The task
    /// captures only the registry key and weak handles, then re-resolves
    /// the runner under the registry lock before acting.
    pub(crate) fn arm_expiry(self: &Arc<Self>) {
        let (generation, duration) = {
            let mut st = self.state.lock().unwrap();
            if st.runner.is_none() || st.unloading {
                return;
            }
            st.expiry_generation += 1;
            (st.expiry_generation, st.keep_alive.as_duration())
        };

        // Pinned runners have no idle clock; they stay until evicted.
        let Some(duration) = duration else { return };
        let Some(sched) = self.sched.upgrade() else { return };
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let me = Arc::downgrade(self);
        let key = self.key.clone();
        rt.spawn(async move {
            tokio::time::sleep(duration).await;

            let Some(runner) = me.upgrade() else { return };
            {
                let registry = sched.registry.lock().unwrap();
                match registry.get(&key) {
                    Some(current) if Arc::ptr_eq(current, &runner) => {}
                    _ => return,
                }
            }
            {
                let st = runner.state.lock().unwrap();
                if st.expiry_generation != generation || st.runner.is_none() {
                    return;
                }
            }

            debug!(model = %key.display(), "idle timeout expired, unloading");
            runner.drain().await;
            runner.teardown().await;

            let mut registry = sched.registry.lock().unwrap();
            if let Some(current) = registry.get(&key) {
                if Arc::ptr_eq(current, &runner) {
                    registry.remove(&key);
                }
            }
            debug!(model = %key.display(), "runner removed from registry");
        });
    }

    /// Stop admitting requests and wait for in-flight ones to finish.
    ///
    /// The drained signal fires only on the 1 → 0 refcount transition;
    /// waiters re-check the count under the lock on every wake.
    pub(crate) async fn drain(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut st = self.state.lock().unwrap();
                st.unloading = true;
                if st.ref_count == 0 {
                    return;
                }
                debug!(
                    model = %self.key.display(),
                    in_flight = st.ref_count,
                    "waiting for requests to drain before unloading"
                );
            }

            notified.as_mut().await;
        }
    }

    /// Close the backend handle and clear the configuration.
    ///
    /// Whichever of the expiry task and the eviction path gets here first
    /// takes the handle; the other finds `None` and closes nothing.
    pub(crate) async fn teardown(&self) {
        let runner = {
            let mut st = self.state.lock().unwrap();
            debug_assert_eq!(st.ref_count, 0, "teardown with requests in flight");
            st.unloading = true;
            st.expiry_generation += 1;
            st.adapters.clear();
            st.projectors.clear();
            st.options = None;
            st.gpus = GpuList::default();
            st.runner.take()
        };

        if let Some(runner) = runner {
            runner.close().await;
            info!(model = %self.key.display(), "runner closed");
        }
    }
}

/// RAII admission guard: holding one keeps the runner resident; dropping
/// it releases the reference and restarts the idle clock.
#[derive(Debug)]
pub struct ActiveRunner {
    runner: Arc<dyn Runner>,
    runner_ref: Arc<RunnerRef>,
}

impl ActiveRunner {
    pub fn model_path(&self) -> &Path {
        self.runner_ref.model_path()
    }
}

impl Deref for ActiveRunner {
    type Target = dyn Runner;

    fn deref(&self) -> &Self::Target {
        self.runner.as_ref()
    }
}

impl Drop for ActiveRunner {
    fn drop(&mut self) {
        self.runner_ref.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{GpuDevice, GpuLibrary};
    use crate::runner::mock::MockRunnerFactory;
    use crate::runner::RunnerFactory;
    use std::collections::HashMap;

    async fn loaded_ref() -> (Arc<RunnerRef>, Arc<MockRunnerFactory>) {
        let factory = Arc::new(MockRunnerFactory::new());
        let spec = ModelSpec::new("/m/a");
        let metadata = crate::model::ModelMetadata {
            architecture: "llama".to_string(),
            file_type: String::new(),
            block_count: 2,
            head_count: 4,
            head_count_kv: 4,
            embedding_length: 64,
            context_length: 2048,
            vocab_length: 100,
            attn_qkv_width: None,
            ffn_gate_width: None,
            cpu_only: false,
            layer_sizes: HashMap::new(),
        };
        let gpus = GpuList::new(vec![GpuDevice::new(GpuLibrary::Cuda, "0", 100, 100, 0)]);
        let runner = factory
            .spawn(&gpus, &spec, &metadata, &RunnerOptions::default())
            .await
            .unwrap();

        let r = RunnerRef::placeholder(spec.path.clone(), Weak::new(), KeepAlive::DEFAULT);
        assert!(r.install(
            runner,
            gpus,
            vec![],
            vec![],
            RunnerOptions::default(),
            KeepAlive::DEFAULT,
        ));
        (r, factory)
    }

    #[tokio::test]
    async fn test_use_and_release() {
        let (r, _factory) = loaded_ref().await;
        assert!(r.is_idle());

        let guard = r.try_use().unwrap();
        assert!(!r.is_idle());
        guard.ping().await.unwrap();

        drop(guard);
        assert!(r.is_idle());
    }

    #[tokio::test]
    async fn test_placeholder_rejects_use() {
        let r = RunnerRef::placeholder(PathBuf::from("/m/a"), Weak::new(), KeepAlive::DEFAULT);
        let err = r.try_use().unwrap_err();
        assert!(matches!(err, HearthError::Unloading(_)));
    }

    #[tokio::test]
    async fn test_unloading_rejects_new_use_but_keeps_existing() {
        let (r, _factory) = loaded_ref().await;
        let guard = r.try_use().unwrap();

        // start a drain in the background; it must wait for the guard
        let r2 = r.clone();
        let drain = tokio::spawn(async move { r2.drain().await });
        tokio::task::yield_now().await;

        let err = r.try_use().unwrap_err();
        assert!(matches!(err, HearthError::Unloading(_)));

        // the existing user keeps running
        guard.ping().await.unwrap();
        drop(guard);

        drain.await.unwrap();
        assert!(r.is_idle());
    }

    #[tokio::test]
    async fn test_drain_returns_immediately_when_idle() {
        let (r, _factory) = loaded_ref().await;
        r.drain().await;
        // drain is sticky
        assert!(r.try_use().is_err());
    }

    #[tokio::test]
    async fn test_teardown_closes_exactly_once() {
        let (r, factory) = loaded_ref().await;
        r.drain().await;
        r.teardown().await;
        r.teardown().await;

        let mock = factory.last_spawned(&PathBuf::from("/m/a")).unwrap();
        assert_eq!(mock.close_calls(), 1);
        assert!(!r.is_loaded());
    }

    #[tokio::test]
    async fn test_install_refused_once_unloading() {
        // an evicted placeholder must not adopt a late-arriving handle
        let (r, factory) = loaded_ref().await;
        r.drain().await;
        r.teardown().await;

        let spec = ModelSpec::new("/m/a");
        let metadata = crate::model::ModelMetadata {
            architecture: "llama".to_string(),
            file_type: String::new(),
            block_count: 2,
            head_count: 4,
            head_count_kv: 4,
            embedding_length: 64,
            context_length: 2048,
            vocab_length: 100,
            attn_qkv_width: None,
            ffn_gate_width: None,
            cpu_only: false,
            layer_sizes: HashMap::new(),
        };
        let gpus = GpuList::new(vec![GpuDevice::new(GpuLibrary::Cuda, "0", 100, 100, 0)]);
        let late = factory
            .spawn(&gpus, &spec, &metadata, &RunnerOptions::default())
            .await
            .unwrap();

        assert!(!r.install(
            late,
            gpus,
            vec![],
            vec![],
            RunnerOptions::default(),
            KeepAlive::DEFAULT,
        ));
        assert!(!r.is_loaded());
    }

    #[tokio::test]
    async fn test_compatible_masks_num_gpu() {
        let (r, _factory) = loaded_ref().await;
        let spec = ModelSpec::new("/m/a");

        let mut opts = RunnerOptions::default();
        opts.num_gpu = 15;
        assert!(r.compatible(&spec, &opts));

        opts.num_ctx = 8192;
        assert!(!r.compatible(&spec, &opts));
    }

    #[tokio::test]
    async fn test_compatible_checks_adapters() {
        let (r, _factory) = loaded_ref().await;
        let spec =
            ModelSpec::new("/m/a").with_adapters(vec![PathBuf::from("/m/a.lora")]);
        assert!(!r.compatible(&spec, &RunnerOptions::default()));
    }
}
