//! The Kronk handle: a concurrently safe front end to one logical model.
//!
//! Construction inspects the first loaded instance. Sequential models
//! (embedding, rerank, vision) get an instance pool of `n_seq_max` engines,
//! each serving one request at a time. Text models get a single instance
//! multiplexed by the batch scheduler, with an admission semaphore of
//! `n_seq_max * queue_depth` tokens providing backpressure.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use crate::config::ModelConfig;
use crate::ctx::Ctx;
use crate::engine::{Engine, EngineLoader, ModelInfo};
use crate::error::{Error, Result};
use crate::generate::{self, Job};
use crate::prompt;
use crate::request::{self, Doc, Params};
use crate::response::{
    ChatResponse, EmbeddingResponse, RerankResponse, RerankResult, RerankUsage, Usage,
};
use crate::scheduler::{BatchScheduler, SlotRequest};

/// Capacity of per-request event channels.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Poll interval while waiting for active streams to drain.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Default unload deadline when the caller supplied none.
const UNLOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Construction options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Semaphore multiplier for batch-mode models: `n_seq_max * queue_depth`
    /// requests may be in flight while a batch is processing.
    pub queue_depth: usize,
    /// Reject request documents carrying unrecognized option keys.
    pub strict_options: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            queue_depth: 2,
            strict_options: false,
        }
    }
}

type EnginePool = Arc<Mutex<Vec<Box<dyn Engine>>>>;

enum Mode {
    /// Sequential models: a pool of single-request instances.
    Pooled { pool: EnginePool },
    /// Text models: one instance driven by the slot scheduler.
    Batch { scheduler: Arc<BatchScheduler> },
}

#[derive(Default)]
struct ShutdownState {
    shutting_down: bool,
    unloaded: bool,
}

/// A loaded model front end. Cheap to share via `Arc`.
pub struct Kronk {
    cfg: ModelConfig,
    info: ModelInfo,
    opts: Options,
    mode: Mode,
    sem: Arc<Semaphore>,
    active_streams: Arc<AtomicI32>,
    shutdown: Mutex<ShutdownState>,
}

impl std::fmt::Debug for Kronk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kronk").field("info", &self.info).finish()
    }
}

/// Holds one admission: the semaphore permit plus the active-stream count.
/// Dropping it releases both, on every exit path.
struct StreamGuard {
    active: Arc<AtomicI32>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Kronk {
    /// Load the model and build the handle. For pooled models all
    /// `n_seq_max` instances are loaded up front; a failure drops
    /// whatever was already loaded.
    pub fn new(loader: &dyn EngineLoader, cfg: ModelConfig, opts: Options) -> Result<Self> {
        crate::engine::init_backend();

        let cfg = cfg.adjusted(None);
        let first = loader.load(&cfg)?;
        let info = first.info();
        let cfg = ModelConfig {
            context_window: info.n_ctx,
            ..cfg
        };

        let sequential = cfg.is_sequential() || info.is_sequential();

        let (mode, sem_capacity) = if sequential {
            let instances = cfg.n_seq_max.max(1);
            let mut pool = vec![first];
            for _ in 1..instances {
                pool.push(loader.load(&cfg)?);
            }

            info!(model_id = %cfg.model_id, instances, "kronk ready (instance pool)");

            (
                Mode::Pooled {
                    pool: Arc::new(Mutex::new(pool)),
                },
                instances,
            )
        } else {
            let capacity = cfg.n_seq_max.max(1) * opts.queue_depth.max(1);
            let scheduler = BatchScheduler::start(first, &cfg, capacity);

            info!(
                model_id = %cfg.model_id,
                slots = cfg.n_seq_max,
                admission = capacity,
                "kronk ready (batch scheduler)",
            );

            (
                Mode::Batch {
                    scheduler: Arc::new(scheduler),
                },
                capacity,
            )
        };

        Ok(Self {
            cfg,
            info,
            opts,
            mode,
            sem: Arc::new(Semaphore::new(sem_capacity)),
            active_streams: Arc::new(AtomicI32::new(0)),
            shutdown: Mutex::new(ShutdownState::default()),
        })
    }

    /// The canonical model id this handle serves.
    pub fn model_id(&self) -> &str {
        &self.cfg.model_id
    }

    /// A copy of the configuration in effect, which may differ from the
    /// one passed to `new` where the model overrode settings.
    pub fn model_config(&self) -> ModelConfig {
        self.cfg.clone()
    }

    pub fn model_info(&self) -> ModelInfo {
        self.info.clone()
    }

    /// Number of streams currently admitted.
    pub fn active_streams(&self) -> i32 {
        self.active_streams.load(Ordering::SeqCst)
    }

    /// Chat and stream the response. The context must carry a deadline.
    pub async fn chat_stream(&self, ctx: &Ctx, doc: Doc) -> Result<mpsc::Receiver<ChatResponse>> {
        if ctx.deadline().is_none() {
            return Err(Error::InvalidArgument(
                "context has no deadline, provide a reasonable timeout".into(),
            ));
        }

        let messages = request::messages_from_doc(&doc)?;
        let params =
            Params::from_doc(&doc, self.opts.strict_options)?.adjusted(self.cfg.context_window);
        let media = request::media_from_doc(&doc)?;
        let tools = request::tools_from_doc(&doc).cloned();

        if !media.is_empty() && !self.info.is_vision {
            return Err(Error::InvalidArgument(
                "model does not accept image input".into(),
            ));
        }

        let (guard, engine) = self.acquire(ctx).await?;
        let id = uuid::Uuid::new_v4().to_string();

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (client_tx, client_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        match engine {
            None => {
                let Mode::Batch { scheduler } = &self.mode else {
                    return Err(Error::Internal("admission mode mismatch".into()));
                };

                let prompt =
                    prompt::render_turns(self.info.family, &messages, tools.as_ref(), &params);
                let req = SlotRequest {
                    id: id.clone(),
                    prompt,
                    params,
                    ctx: ctx.clone(),
                    events: events_tx,
                };

                scheduler.submit(req)?;

                let ctx = ctx.clone();
                tokio::spawn(async move {
                    pump(events_rx, client_tx, &ctx, &id).await;
                    drop(guard);
                });
            }

            Some(engine) => {
                let prompt = prompt::render(
                    self.info.family,
                    &self.cfg.system_prompt,
                    &messages,
                    tools.as_ref(),
                    &params,
                );
                let model_id = self.cfg.model_id.clone();
                let job = Job {
                    id: id.clone(),
                    prompt,
                    media,
                    params,
                    ctx: ctx.clone(),
                };

                let producer = tokio::task::spawn_blocking(move || {
                    let mut engine = engine;
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        generate::run(engine.as_mut(), &job, &events_tx);
                    }));

                    if let Err(panic) = result {
                        let msg = panic_message(panic);
                        warn!(%msg, "generation panicked");
                        let _ = events_tx.try_send(ChatResponse::err(
                            &job.id,
                            &model_id,
                            &Error::Internal(msg),
                            Usage::default(),
                        ));
                    }

                    engine
                });

                let ctx = ctx.clone();
                let pool = self.pool().clone();
                tokio::spawn(async move {
                    pump(events_rx, client_tx, &ctx, &id).await;
                    if let Ok(engine) = producer.await {
                        pool.lock().push(engine);
                    }
                    drop(guard);
                });
            }
        }

        Ok(client_rx)
    }

    /// Chat and wait for the final response.
    pub async fn chat(&self, ctx: &Ctx, doc: Doc) -> Result<ChatResponse> {
        let mut stream = self.chat_stream(ctx, doc).await?;

        let mut last = None;
        while let Some(resp) = stream.recv().await {
            last = Some(resp);
        }

        last.ok_or_else(|| Error::Internal("stream closed without a response".into()))
    }

    /// Vision chat: requires image input and a vision model.
    pub async fn vision(&self, ctx: &Ctx, doc: Doc) -> Result<ChatResponse> {
        if !self.info.is_vision {
            return Err(Error::InvalidArgument(
                "model doesn't support vision input".into(),
            ));
        }
        if request::media_from_doc(&doc)?.is_empty() {
            return Err(Error::InvalidArgument("no image found in request".into()));
        }

        self.chat(ctx, doc).await
    }

    /// Embed each input text. One vector per input, in input order.
    pub async fn embed(&self, ctx: &Ctx, inputs: Vec<String>) -> Result<EmbeddingResponse> {
        if !self.info.is_embed {
            return Err(Error::InvalidArgument(
                "model doesn't support embeddings".into(),
            ));
        }
        if inputs.is_empty() {
            return Err(Error::InvalidArgument("input cannot be empty".into()));
        }

        let (guard, engine) = self.acquire(ctx).await?;
        let engine = engine.ok_or_else(|| Error::Internal("embedding model is not pooled".into()))?;

        let ctx = ctx.clone();
        let model_id = self.cfg.model_id.clone();

        let work = tokio::task::spawn_blocking(move || {
            let mut engine = engine;

            // The engine goes back to the pool on every exit path, panic
            // included.
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut vectors = Vec::with_capacity(inputs.len());
                let mut prompt_tokens = 0usize;

                for text in &inputs {
                    if let Some(err) = ctx.err() {
                        return Err(err);
                    }
                    prompt_tokens += engine.tokenize(text, true)?.len();
                    vectors.push(engine.embed_text(text)?);
                }

                Ok(EmbeddingResponse::new(&model_id, vectors, prompt_tokens))
            }));

            let result = match result {
                Ok(result) => result,
                Err(panic) => {
                    let msg = panic_message(panic);
                    warn!(%msg, "embedding panicked");
                    Err(Error::Internal(msg))
                }
            };

            (engine, result)
        });

        let result = match work.await {
            Ok((engine, result)) => {
                self.pool().lock().push(engine);
                result
            }
            Err(err) => Err(Error::Internal(format!("embedding task failed: {err}"))),
        };

        drop(guard);
        result
    }

    /// Score and rank documents against a query. Results are sorted by
    /// relevance descending; scores are sigmoid-normalized into [0, 1].
    pub async fn rerank(&self, ctx: &Ctx, doc: Doc) -> Result<RerankResponse> {
        if !self.info.is_rerank {
            return Err(Error::InvalidArgument(
                "model doesn't support reranking".into(),
            ));
        }
        if ctx.deadline().is_none() {
            return Err(Error::InvalidArgument(
                "context has no deadline, provide a reasonable timeout".into(),
            ));
        }

        let query = doc
            .get("query")
            .and_then(|v| v.as_str())
            .filter(|q| !q.is_empty())
            .ok_or_else(|| Error::InvalidArgument("missing or invalid query parameter".into()))?
            .to_string();

        let documents = rerank_documents(&doc)?;

        let top_n = doc
            .get("top_n")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .filter(|n| *n > 0)
            .unwrap_or(documents.len());

        let return_documents = doc
            .get("return_documents")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let (guard, engine) = self.acquire(ctx).await?;
        let engine = engine.ok_or_else(|| Error::Internal("rerank model is not pooled".into()))?;

        let ctx = ctx.clone();
        let model_id = self.cfg.model_id.clone();

        let work = tokio::task::spawn_blocking(move || {
            let mut engine = engine;

            // The engine goes back to the pool on every exit path, panic
            // included.
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut results = Vec::with_capacity(documents.len());
                let mut prompt_tokens = 0usize;

                for (index, document) in documents.iter().enumerate() {
                    if let Some(err) = ctx.err() {
                        return Err(err);
                    }

                    let pair = prompt::rerank_pair(&query, document);
                    prompt_tokens += engine.tokenize(&pair, true)?.len();

                    let raw = engine.rank_pair(&query, document)?;
                    results.push(RerankResult {
                        index,
                        relevance_score: sigmoid(raw),
                        document: return_documents.then(|| document.clone()),
                    });
                }

                results.sort_by(|a, b| {
                    b.relevance_score
                        .partial_cmp(&a.relevance_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                results.truncate(top_n);

                Ok(RerankResponse::new(
                    &model_id,
                    results,
                    RerankUsage {
                        prompt_tokens,
                        total_tokens: prompt_tokens,
                    },
                ))
            }));

            let result = match result {
                Ok(result) => result,
                Err(panic) => {
                    let msg = panic_message(panic);
                    warn!(%msg, "rerank panicked");
                    Err(Error::Internal(msg))
                }
            };

            (engine, result)
        });

        let result = match work.await {
            Ok((engine, result)) => {
                self.pool().lock().push(engine);
                result
            }
            Err(err) => Err(Error::Internal(format!("rerank task failed: {err}"))),
        };

        drop(guard);
        result
    }

    /// Shut the handle down: reject new admissions, wait for active
    /// streams to drain, destroy every instance. Returns `Busy` when the
    /// deadline fires first and `AlreadyUnloaded` on a repeat call.
    pub async fn unload(&self, ctx: &Ctx) -> Result<()> {
        let ctx = ctx.with_fallback_timeout(UNLOAD_TIMEOUT);

        {
            let mut state = self.shutdown.lock();
            if state.unloaded {
                return Err(Error::AlreadyUnloaded);
            }
            state.shutting_down = true;
        }

        loop {
            let active = self.active_streams();
            if active == 0 {
                break;
            }
            if ctx.is_done() {
                return Err(Error::Busy {
                    active_streams: active,
                });
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        {
            let mut state = self.shutdown.lock();
            if state.unloaded {
                return Err(Error::AlreadyUnloaded);
            }
            state.unloaded = true;
        }

        match &self.mode {
            Mode::Batch { scheduler } => {
                // Joining the scheduler thread blocks; keep it off the
                // async runtime.
                let scheduler = scheduler.clone();
                let _ = tokio::task::spawn_blocking(move || scheduler.stop()).await;
            }
            Mode::Pooled { pool } => {
                pool.lock().clear();
            }
        }

        info!(model_id = %self.cfg.model_id, "kronk unloaded");
        Ok(())
    }

    fn pool(&self) -> &EnginePool {
        match &self.mode {
            Mode::Pooled { pool } => pool,
            Mode::Batch { .. } => unreachable!("pool access on batch handle"),
        }
    }

    /// Admission protocol: check the shutdown gate, take an admission
    /// token, then (pooled only) take an instance. Every wait observes
    /// context cancellation. The guard releases everything but the pooled
    /// instance, which callers return to the pool themselves.
    async fn acquire(&self, ctx: &Ctx) -> Result<(StreamGuard, Option<Box<dyn Engine>>)> {
        {
            let state = self.shutdown.lock();
            if state.shutting_down || state.unloaded {
                return Err(Error::Unavailable("kronk has been unloaded".into()));
            }
            self.active_streams.fetch_add(1, Ordering::SeqCst);
        }

        let permit = tokio::select! {
            err = ctx.done() => {
                self.active_streams.fetch_sub(1, Ordering::SeqCst);
                return Err(err);
            }
            permit = self.sem.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.active_streams.fetch_sub(1, Ordering::SeqCst);
                    return Err(Error::Unavailable("kronk has been unloaded".into()));
                }
            },
        };

        let guard = StreamGuard {
            active: self.active_streams.clone(),
            _permit: permit,
        };

        match &self.mode {
            Mode::Batch { .. } => Ok((guard, None)),
            Mode::Pooled { pool } => {
                // Semaphore capacity equals pool size, so an instance is
                // guaranteed to be present.
                let engine = pool.lock().pop().ok_or_else(|| {
                    Error::Internal("instance pool exhausted under admission".into())
                })?;
                Ok((guard, Some(engine)))
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic in stream producer".to_string()
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn rerank_documents(doc: &Doc) -> Result<Vec<String>> {
    let Some(value) = doc.get("documents") else {
        return Err(Error::InvalidArgument(
            "missing or invalid documents parameter".into(),
        ));
    };

    let Some(items) = value.as_array() else {
        return Err(Error::InvalidArgument(
            "documents must be a list of strings".into(),
        ));
    };

    if items.is_empty() {
        return Err(Error::InvalidArgument("documents cannot be empty".into()));
    }

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::InvalidArgument(format!("documents[{i}] is not a string")))
        })
        .collect()
}

/// Forward events from the producer to the client. Deltas race a full
/// client against cancellation; the pump always ends after one terminal
/// event, a closed producer, or a dead context.
async fn pump(
    mut events: mpsc::Receiver<ChatResponse>,
    client: mpsc::Sender<ChatResponse>,
    ctx: &Ctx,
    id: &str,
) {
    loop {
        tokio::select! {
            msg = events.recv() => match msg {
                Some(resp) => {
                    let terminal = resp.is_final();
                    match client.try_send(resp) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(resp)) => {
                            let model = resp.model.clone();
                            let usage = resp.usage;
                            tokio::select! {
                                err = ctx.done() => {
                                    let _ = client.try_send(ChatResponse::err(
                                        id, &model, &err, usage,
                                    ));
                                    return;
                                }
                                sent = client.send(resp) => {
                                    if sent.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return,
                    }
                    if terminal {
                        return;
                    }
                }
                None => {
                    // Producer vanished without a terminal event.
                    let _ = client.try_send(ChatResponse::err(
                        id,
                        "",
                        &Error::Internal("stream closed without a final response".into()),
                        Usage::default(),
                    ));
                    return;
                }
            },
            err = ctx.done() => {
                let _ = client.try_send(ChatResponse::err(id, "", &err, Usage::default()));
                return;
            }
        }
    }
}
