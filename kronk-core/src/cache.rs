//! Model manager: a TTL/LRU cache of Kronk handles.
//!
//! Maps canonical model ids to loaded handles. Loads are single-flight per
//! key; eviction (size, TTL, shutdown) removes the entry immediately and
//! unloads the handle on a background task so cache mutation never blocks
//! behind draining streams.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::ModelConfig;
use crate::ctx::Ctx;
use crate::engine::EngineLoader;
use crate::error::{Error, Result};
use crate::kronk::{Kronk, Options};

/// Deadline for one evicted handle to drain and unload.
const EVICTION_UNLOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for a full manager shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(45);

/// Poll interval while draining unloading handles.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Interval of the background TTL sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Maps a model id onto the configuration used to load it. `NotFound` is
/// the expected failure for unknown ids.
pub trait ModelResolver: Send + Sync {
    fn resolve(&self, model_id: &str) -> Result<ModelConfig>;
}

impl<F> ModelResolver for F
where
    F: Fn(&str) -> Result<ModelConfig> + Send + Sync,
{
    fn resolve(&self, model_id: &str) -> Result<ModelConfig> {
        self(model_id)
    }
}

/// Manager policies.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum number of models resident at once.
    pub max_models: usize,
    /// Access TTL: any acquire resets the clock.
    pub ttl: Duration,
    /// Options applied to every constructed handle.
    pub options: Options,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_models: 3,
            ttl: Duration::from_secs(300),
            options: Options::default(),
        }
    }
}

impl ManagerConfig {
    fn validated(mut self) -> Self {
        if self.max_models == 0 {
            self.max_models = 3;
        }
        if self.ttl.is_zero() {
            self.ttl = Duration::from_secs(300);
        }
        self
    }
}

#[derive(Clone)]
enum LoadState {
    Pending,
    Ready(Arc<Kronk>),
    Failed(Error),
}

struct ReadyEntry {
    handle: Arc<Kronk>,
    last_access: Instant,
}

struct CacheState {
    ready: LruCache<String, ReadyEntry>,
    loading: HashMap<String, watch::Receiver<LoadState>>,
}

/// The model manager. Cheap to share via `Arc`.
pub struct Manager {
    cfg: ManagerConfig,
    loader: Arc<dyn EngineLoader>,
    resolver: Arc<dyn ModelResolver>,
    state: Arc<Mutex<CacheState>>,
    unloading: Arc<AtomicI32>,
    shutdown: Arc<AtomicBool>,
}

impl Manager {
    pub fn new(
        cfg: ManagerConfig,
        loader: Arc<dyn EngineLoader>,
        resolver: Arc<dyn ModelResolver>,
    ) -> Arc<Self> {
        let cfg = cfg.validated();

        let mgr = Arc::new(Self {
            state: Arc::new(Mutex::new(CacheState {
                ready: LruCache::new(
                    NonZeroUsize::new(cfg.max_models).expect("max_models validated"),
                ),
                loading: HashMap::new(),
            })),
            cfg,
            loader,
            resolver,
            unloading: Arc::new(AtomicI32::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
        });

        // Background sweep so idle models leave even with no traffic.
        let sweep = Arc::downgrade(&mgr);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let Some(mgr) = sweep.upgrade() else {
                    return;
                };
                if mgr.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                mgr.sweep_expired();
            }
        });

        mgr
    }

    /// Number of resident models, loading ones included.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.ready.len() + state.loading.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Metadata for every resident model, most recently used first.
    pub fn model_infos(&self) -> Vec<crate::engine::ModelInfo> {
        let state = self.state.lock();
        state
            .ready
            .iter()
            .map(|(_, entry)| entry.handle.model_info())
            .collect()
    }

    /// Acquire a handle for `model_id`, loading it on a miss. Concurrent
    /// acquires for the same id share one load; its failure reaches every
    /// waiter. Any acquire resets the entry's TTL.
    pub async fn acquire(&self, ctx: &Ctx, model_id: &str) -> Result<Arc<Kronk>> {
        let model_id = model_id.to_lowercase();

        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("manager is shutting down".into()));
        }

        let mut rx = {
            let mut state = self.state.lock();

            let expired = state
                .ready
                .get(&model_id)
                .map(|e| e.last_access.elapsed() > self.cfg.ttl);

            match expired {
                Some(false) => {
                    let entry = state.ready.get_mut(&model_id).expect("entry present");
                    entry.last_access = Instant::now();
                    return Ok(entry.handle.clone());
                }
                Some(true) => {
                    // Expired under access: evict, then fall through to a
                    // fresh load.
                    if let Some((key, entry)) = state.ready.pop_entry(&model_id) {
                        info!(model_id = %key, "cache evict (ttl)");
                        self.unload_async(entry.handle);
                    }
                }
                None => {}
            }

            match state.loading.get(&model_id) {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(LoadState::Pending);
                    state.loading.insert(model_id.clone(), rx.clone());
                    drop(state);

                    self.spawn_load(model_id.clone(), tx);
                    rx
                }
            }
        };

        loop {
            let snapshot = rx.borrow().clone();
            match snapshot {
                LoadState::Pending => {}
                LoadState::Ready(handle) => return Ok(handle),
                LoadState::Failed(err) => return Err(err),
            }

            tokio::select! {
                err = ctx.done() => return Err(err),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return self.take_ready(&model_id);
                    }
                }
            }
        }
    }

    /// Evict every entry and wait for the unloads to drain.
    pub async fn shutdown(&self, ctx: &Ctx) -> Result<()> {
        let ctx = ctx.with_fallback_timeout(SHUTDOWN_TIMEOUT);
        self.shutdown.store(true, Ordering::SeqCst);

        let evicted: Vec<(String, ReadyEntry)> = {
            let mut state = self.state.lock();
            let mut evicted = Vec::new();
            while let Some(entry) = state.ready.pop_lru() {
                evicted.push(entry);
            }
            evicted
        };

        for (model_id, entry) in evicted {
            info!(%model_id, "cache evict (shutdown)");
            self.unload_async(entry.handle);
        }

        while self.unloading.load(Ordering::SeqCst) > 0 {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        Ok(())
    }

    fn take_ready(&self, model_id: &str) -> Result<Arc<Kronk>> {
        let mut state = self.state.lock();
        match state.ready.get_mut(model_id) {
            Some(entry) => {
                entry.last_access = Instant::now();
                Ok(entry.handle.clone())
            }
            None => Err(Error::Internal(format!(
                "load for {model_id} completed without a handle"
            ))),
        }
    }

    /// Run the single-flight load on a blocking thread and publish the
    /// outcome to every waiter.
    fn spawn_load(&self, model_id: String, tx: watch::Sender<LoadState>) {
        let loader = self.loader.clone();
        let resolver = self.resolver.clone();
        let options = self.cfg.options.clone();
        let state = self.state.clone();
        let shutdown = self.shutdown.clone();
        let unloading = self.unloading.clone();

        tokio::spawn(async move {
            let id = model_id.clone();
            let loaded = tokio::task::spawn_blocking(move || {
                let cfg = resolver.resolve(&id)?;
                Kronk::new(loader.as_ref(), cfg, options).map(Arc::new)
            })
            .await
            .unwrap_or_else(|err| Err(Error::Internal(format!("load task failed: {err}"))));

            match loaded {
                Ok(handle) => {
                    if shutdown.load(Ordering::SeqCst) {
                        // Raced with shutdown; do not resurrect the cache.
                        state.lock().loading.remove(&model_id);
                        let _ = tx.send(LoadState::Failed(Error::Unavailable(
                            "manager is shutting down".to_string(),
                        )));
                        unload_handle(handle, unloading);
                        return;
                    }

                    let evicted = {
                        let mut state = state.lock();
                        state.loading.remove(&model_id);
                        state.ready.push(
                            model_id.clone(),
                            ReadyEntry {
                                handle: handle.clone(),
                                last_access: Instant::now(),
                            },
                        )
                    };

                    // Size eviction: push returns the LRU casualty.
                    if let Some((key, entry)) = evicted {
                        if key != model_id {
                            info!(model_id = %key, "cache evict (size)");
                            unload_handle(entry.handle, unloading);
                        }
                    }

                    info!(%model_id, "cache add");
                    let _ = tx.send(LoadState::Ready(handle));
                }
                Err(err) => {
                    state.lock().loading.remove(&model_id);
                    warn!(%model_id, %err, "model load failed");
                    let _ = tx.send(LoadState::Failed(err));
                }
            }
        });
    }

    fn sweep_expired(&self) {
        let expired: Vec<(String, ReadyEntry)> = {
            let mut state = self.state.lock();
            let ids: Vec<String> = state
                .ready
                .iter()
                .filter(|(_, e)| e.last_access.elapsed() > self.cfg.ttl)
                .map(|(k, _)| k.clone())
                .collect();

            ids.into_iter()
                .filter_map(|id| state.ready.pop_entry(&id))
                .collect()
        };

        for (model_id, entry) in expired {
            info!(%model_id, "cache evict (ttl)");
            self.unload_async(entry.handle);
        }
    }

    fn unload_async(&self, handle: Arc<Kronk>) {
        unload_handle(handle, self.unloading.clone());
    }
}

/// Unload a handle on its own task with a hard deadline, tracking it in
/// the drain counter.
fn unload_handle(handle: Arc<Kronk>, unloading: Arc<AtomicI32>) {
    unloading.fetch_add(1, Ordering::SeqCst);

    tokio::spawn(async move {
        let ctx = Ctx::with_timeout(EVICTION_UNLOAD_TIMEOUT);
        if let Err(err) = handle.unload(&ctx).await {
            warn!(model_id = %handle.model_id(), %err, "evicted handle failed to unload");
        }
        unloading.fetch_sub(1, Ordering::SeqCst);
    });
}
