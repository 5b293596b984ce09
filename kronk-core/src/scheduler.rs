//! Continuous-batching slot scheduler.
//!
//! One scheduler task owns a native context and interleaves up to N client
//! sequences into a single forward pass. Sequence id 0 holds the shared
//! system prompt, decoded once at startup and copied into a slot's sequence
//! whenever the slot resets. Client slots use sequence ids 1..=N.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::ModelConfig;
use crate::ctx::Ctx;
use crate::engine::{Batch, Engine, ModelFamily, SeqId, Token, TokenDecoder};
use crate::error::{Error, Result};
use crate::parser::{end_marker, Step, TokenParser};
use crate::request::Params;
use crate::response::{ChatResponse, Usage};
use crate::sampler::SamplerChain;

/// Idle sleep between empty scheduler ticks.
const TICK: Duration = Duration::from_millis(1);

/// Consecutive decode failures tolerated before the implicated slots are
/// failed rather than retried.
const MAX_DECODE_FAILURES: u32 = 3;

/// Stop conditions are only evaluated after this many decoded tokens.
const MIN_DECODED_FOR_STOP: usize = 2;

/// One request admitted to the scheduler.
pub struct SlotRequest {
    pub id: String,
    pub prompt: String,
    pub params: Params,
    pub ctx: Ctx,
    pub events: mpsc::Sender<ChatResponse>,
}

/// Handle to a running scheduler task.
pub struct BatchScheduler {
    queue: mpsc::Sender<SlotRequest>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BatchScheduler {
    /// Take ownership of the engine and start the scheduler task.
    /// `queue_capacity` bounds how many requests may wait beyond the
    /// active slots.
    pub fn start(engine: Box<dyn Engine>, cfg: &ModelConfig, queue_capacity: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            engine,
            cfg: cfg.clone(),
            stop: stop.clone(),
            queue: queue_rx,
        };

        let handle = std::thread::Builder::new()
            .name("kronk-scheduler".to_string())
            .spawn(move || worker.run())
            .expect("spawn scheduler thread");

        Self {
            queue: queue_tx,
            stop,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Hand a request to the scheduler without blocking.
    pub fn submit(&self, req: SlotRequest) -> Result<()> {
        use mpsc::error::TrySendError;

        match self.queue.try_send(req) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(Error::ResourceExhausted("scheduler queue is full".into()))
            }
            Err(TrySendError::Closed(_)) => {
                Err(Error::Unavailable("scheduler has shut down".into()))
            }
        }
    }

    /// Stop the scheduler, finishing every active slot with an
    /// unavailable error, and wait for the task to exit.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BatchScheduler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Bookkeeping for one in-flight client sequence.
struct Slot {
    index: usize,
    active: bool,
    prompt_done: bool,
    sampled: Token,
    n_past: usize,
    n_prompt: usize,
    n_decoded: usize,
    i_batch: Option<usize>,
    max_tokens: usize,
    input_tokens: usize,
    started: Instant,
    decode_failures: u32,
    /// Prompt tokens not yet decoded; kept until the prompt pass succeeds
    /// so a failed batch can be replayed.
    pending: Vec<Token>,
    decoder: TokenDecoder,
    parser: Option<TokenParser>,
    sampler: Option<SamplerChain>,
    req: Option<SlotRequest>,
}

impl Slot {
    fn new(index: usize) -> Self {
        Self {
            index,
            active: false,
            prompt_done: false,
            sampled: 0,
            n_past: 0,
            n_prompt: 0,
            n_decoded: 0,
            i_batch: None,
            max_tokens: 0,
            input_tokens: 0,
            started: Instant::now(),
            decode_failures: 0,
            pending: Vec::new(),
            decoder: TokenDecoder::new(),
            parser: None,
            sampler: None,
            req: None,
        }
    }

    fn seq_id(&self) -> SeqId {
        self.index as SeqId + 1
    }

    fn reset(&mut self) {
        self.active = false;
        self.prompt_done = false;
        self.sampled = 0;
        self.n_past = 0;
        self.n_prompt = 0;
        self.n_decoded = 0;
        self.i_batch = None;
        self.max_tokens = 0;
        self.input_tokens = 0;
        self.decode_failures = 0;
        self.pending.clear();
        self.decoder.clear();
        self.parser = None;
        self.sampler = None;
        self.req = None;
    }

}

fn tokens_per_second(started: Instant, parser: &TokenParser) -> f64 {
    let elapsed = started.elapsed().as_secs_f64();
    if elapsed <= 0.0 {
        return 0.0;
    }
    (parser.reasoning_tokens() + parser.completion_tokens()) as f64 / elapsed
}

enum SlotOutcome {
    Done { hit_max_tokens: bool },
    Failed(Error),
}

struct Worker {
    engine: Box<dyn Engine>,
    cfg: ModelConfig,
    stop: Arc<AtomicBool>,
    queue: mpsc::Receiver<SlotRequest>,
}

impl Worker {
    fn run(mut self) {
        let info = self.engine.info();
        let family = info.family;
        let model_id = info.id.clone();

        let system_tokens = match self.init_system_prompt(family) {
            Ok(n) => n,
            Err(err) => {
                error!(%err, "scheduler failed to decode system prompt");
                return;
            }
        };

        info!(
            slots = self.cfg.n_seq_max,
            system_tokens, "batch scheduler started",
        );

        let mut slots: Vec<Slot> = (0..self.cfg.n_seq_max).map(Slot::new).collect();
        let mut batch = Batch::new();

        loop {
            if self.stop.load(Ordering::SeqCst) {
                self.drain(&mut slots, &model_id);
                info!("batch scheduler stopped");
                return;
            }

            batch.clear();

            // Continue live generations: one token per slot at its current
            // position, logits enabled. A slot still waiting on a failed
            // prompt pass re-submits its pending prompt tokens instead.
            for slot in slots.iter_mut() {
                slot.i_batch = None;
                if !slot.active {
                    continue;
                }

                let cancelled = slot.req.as_ref().map(|r| r.ctx.is_done()).unwrap_or(true);
                if cancelled {
                    let err = slot
                        .req
                        .as_ref()
                        .and_then(|r| r.ctx.err())
                        .unwrap_or(Error::Canceled);
                    Self::finish_slot(&mut self.engine, slot, SlotOutcome::Failed(err), &model_id);
                    continue;
                }

                if !slot.prompt_done {
                    if !slot.pending.is_empty() {
                        append_prompt(slot, &mut batch);
                    }
                    continue;
                }

                slot.i_batch = Some(batch.add(slot.sampled, slot.n_past, slot.seq_id(), true));
                slot.n_past += 1;
                slot.n_decoded += 1;
            }

            // Admit new requests into idle slots, round-robin in index
            // order. Admission never blocks; backpressure lives in the
            // admission semaphore upstream.
            self.fill_slots(&mut slots, &mut batch, system_tokens, family, &model_id);

            if batch.is_empty() {
                std::thread::sleep(TICK);
                continue;
            }

            if let Err(err) = self.engine.decode(&batch) {
                warn!(%err, "batch decode failed");

                for slot in slots.iter_mut() {
                    if !slot.active || slot.i_batch.is_none() {
                        continue;
                    }
                    slot.i_batch = None;
                    slot.decode_failures += 1;

                    if slot.decode_failures >= MAX_DECODE_FAILURES {
                        Self::finish_slot(
                            &mut self.engine,
                            slot,
                            SlotOutcome::Failed(Error::Internal(format!(
                                "decode failed after {MAX_DECODE_FAILURES} attempts: {err}"
                            ))),
                            &model_id,
                        );
                        continue;
                    }

                    if slot.prompt_done {
                        // Rewind the continuation token for the retry.
                        slot.n_past -= 1;
                        slot.n_decoded -= 1;
                    } else {
                        // The prompt rows were lost with the batch; rewind
                        // so `pending` is replayed next tick.
                        slot.n_past -= slot.pending.len();
                    }
                }
                continue;
            }

            // Sample and stream for every slot that owned a logits row.
            for slot in slots.iter_mut() {
                if !slot.active || slot.i_batch.is_none() {
                    continue;
                }
                slot.decode_failures = 0;
                self.step_slot(slot, &model_id);
            }
        }
    }

    /// Decode the shared system prompt under sequence 0 and copy its KV
    /// entries into every client sequence. Rendered with default params;
    /// request-scoped options ride in the per-request turns.
    fn init_system_prompt(&mut self, family: ModelFamily) -> Result<usize> {
        let text = crate::prompt::render_system(
            family,
            &self.cfg.system_prompt,
            None,
            &Params::default().adjusted(self.cfg.context_window),
        );

        let tokens = self.engine.tokenize(&text, true)?;
        let mut batch = Batch::new();
        for (pos, token) in tokens.iter().enumerate() {
            batch.add(*token, pos, 0, false);
        }
        self.engine.decode(&batch)?;

        for seq in 1..=self.cfg.n_seq_max {
            self.engine.kv_copy_seq(0, seq as SeqId);
        }

        Ok(tokens.len())
    }

    fn fill_slots(
        &mut self,
        slots: &mut [Slot],
        batch: &mut Batch,
        system_tokens: usize,
        family: ModelFamily,
        model_id: &str,
    ) {
        for slot in slots.iter_mut() {
            if slot.active {
                continue;
            }

            let req = loop {
                match self.queue.try_recv() {
                    Ok(req) => {
                        if let Some(err) = req.ctx.err() {
                            send_terminal(
                                &req.events,
                                &req.ctx,
                                ChatResponse::err(&req.id, model_id, &err, Usage::default()),
                            );
                            continue;
                        }
                        break Some(req);
                    }
                    Err(_) => break None,
                }
            };

            let Some(req) = req else {
                return;
            };

            if let Err(err) = self.start_slot(slot, req, batch, system_tokens, family) {
                Self::finish_slot(&mut self.engine, slot, SlotOutcome::Failed(err), model_id);
            }
        }
    }

    fn start_slot(
        &mut self,
        slot: &mut Slot,
        req: SlotRequest,
        batch: &mut Batch,
        system_tokens: usize,
        family: ModelFamily,
    ) -> Result<()> {
        let seq = slot.seq_id();

        slot.active = true;
        slot.prompt_done = false;
        slot.started = Instant::now();
        slot.n_decoded = 0;
        slot.decode_failures = 0;
        slot.decoder.clear();
        slot.max_tokens = req.params.max_tokens;
        slot.parser = Some(TokenParser::new(family));
        slot.sampler = Some(SamplerChain::new(&req.params, seq as u64));
        slot.req = Some(req);

        // Reset this sequence back to the shared prefix.
        self.engine.kv_clear_seq(seq);
        self.engine.kv_copy_seq(0, seq);

        // No BOS: the system prompt supplied it.
        let prompt = slot.req.as_ref().map(|r| r.prompt.clone()).unwrap_or_default();
        let tokens = self.engine.tokenize(&prompt, false)?;
        if tokens.is_empty() {
            return Err(Error::InvalidArgument("prompt produced no tokens".into()));
        }

        slot.n_prompt = tokens.len();
        slot.input_tokens = system_tokens + tokens.len();
        slot.n_past = system_tokens;
        slot.pending = tokens;

        append_prompt(slot, batch);

        debug!(slot = slot.index, n_prompt = slot.n_prompt, "slot started");
        Ok(())
    }

    /// Post-decode work for one slot: sample, stream, check stops.
    fn step_slot(&mut self, slot: &mut Slot, model_id: &str) {
        let index = match slot.i_batch.take() {
            Some(i) => i,
            None => return,
        };

        let mut logits = match self.engine.logits(index) {
            Ok(l) => l,
            Err(err) => {
                Self::finish_slot(&mut self.engine, slot, SlotOutcome::Failed(err), model_id);
                return;
            }
        };

        let sampler = slot.sampler.as_mut().expect("active slot has sampler");
        let token = sampler.sample(&mut logits);
        sampler.accept(token);

        slot.sampled = token;
        slot.prompt_done = true;
        slot.pending.clear();

        let is_eog = self.engine.is_eog(token);

        if !is_eog {
            let piece = match slot.decoder.next_token(self.engine.as_ref(), token) {
                Ok(piece) => piece,
                Err(err) => {
                    Self::finish_slot(&mut self.engine, slot, SlotOutcome::Failed(err), model_id);
                    return;
                }
            };

            if let Some(piece) = piece {
                let parser = slot.parser.as_mut().expect("active slot has parser");
                match parser.feed(&piece) {
                    Step::Consumed => {}
                    Step::Delta { text, reasoning } => {
                        let usage =
                            parser.usage(slot.input_tokens, tokens_per_second(slot.started, parser));
                        if let Some(req) = slot.req.as_ref() {
                            // Best effort: a slow client drops deltas, never
                            // the scheduler.
                            let _ = req.events.try_send(ChatResponse::delta(
                                &req.id, model_id, &text, reasoning, usage,
                            ));
                        }
                    }
                    Step::ToolCall => {
                        Self::finish_slot(
                            &mut self.engine,
                            slot,
                            SlotOutcome::Done {
                                hit_max_tokens: false,
                            },
                            model_id,
                        );
                        return;
                    }
                    Step::Fail(msg) => {
                        Self::finish_slot(
                            &mut self.engine,
                            slot,
                            SlotOutcome::Failed(Error::Internal(msg)),
                            model_id,
                        );
                        return;
                    }
                }
            }
        }

        if slot.n_decoded <= MIN_DECODED_FOR_STOP {
            return;
        }

        let hit_max_tokens = slot.n_decoded >= slot.max_tokens;
        let marker_seen = slot
            .parser
            .as_ref()
            .map(|p| p.content_tail().ends_with(end_marker(p.family())))
            .unwrap_or(false);

        if is_eog || hit_max_tokens || marker_seen {
            Self::finish_slot(
                &mut self.engine,
                slot,
                SlotOutcome::Done { hit_max_tokens },
                model_id,
            );
        }
    }

    /// Finish protocol: reset the sequence KV back to the shared prefix,
    /// emit exactly one terminal event, close the sink, recycle the slot.
    fn finish_slot(
        engine: &mut Box<dyn Engine>,
        slot: &mut Slot,
        outcome: SlotOutcome,
        model_id: &str,
    ) {
        let seq = slot.seq_id();
        engine.kv_clear_seq(seq);
        engine.kv_copy_seq(0, seq);

        let Some(req) = slot.req.take() else {
            slot.reset();
            return;
        };

        match outcome {
            SlotOutcome::Failed(err) => {
                let usage = slot
                    .parser
                    .as_ref()
                    .map(|p| p.usage(slot.input_tokens, tokens_per_second(slot.started, p)))
                    .unwrap_or_default();
                send_terminal(
                    &req.events,
                    &req.ctx,
                    ChatResponse::err(&req.id, model_id, &err, usage),
                );
            }

            SlotOutcome::Done { hit_max_tokens } => {
                let mut parser = slot.parser.take().expect("active slot has parser");

                // Flush any residue held back by the incremental decoder.
                if let Ok(Some(piece)) = slot.decoder.flush(engine.as_ref()) {
                    if let Step::Delta { text, reasoning } = parser.feed(&piece) {
                        let usage =
                            parser.usage(slot.input_tokens, tokens_per_second(slot.started, &parser));
                        let _ = req.events.try_send(ChatResponse::delta(
                            &req.id, model_id, &text, reasoning, usage,
                        ));
                    }
                }

                // The tool-call JSON counts as completion tokens the model
                // would otherwise have streamed.
                if parser.tool_call_pending() && !parser.tool_raw().is_empty() {
                    if let Ok(tokens) = engine.tokenize(parser.tool_raw(), false) {
                        parser.add_completion_tokens(tokens.len());
                    }
                }

                let usage =
                    parser.usage(slot.input_tokens, tokens_per_second(slot.started, &parser));
                let parts = parser.finish(hit_max_tokens);

                let prompt_echo = if req.params.return_prompt {
                    req.prompt.clone()
                } else {
                    String::new()
                };

                let fin = ChatResponse::fin(
                    &req.id,
                    model_id,
                    parts.content,
                    parts.reasoning,
                    parts.tool_call,
                    parts.finish_reason,
                    usage,
                    prompt_echo,
                );
                send_terminal(&req.events, &req.ctx, fin);

                debug!(
                    slot = slot.index,
                    n_prompt = slot.n_prompt,
                    n_decoded = slot.n_decoded,
                    "slot finished",
                );
            }
        }

        slot.reset();
    }

    /// Finish every active slot and drain the queue on shutdown.
    fn drain(&mut self, slots: &mut [Slot], model_id: &str) {
        for slot in slots.iter_mut() {
            if slot.active {
                Self::finish_slot(
                    &mut self.engine,
                    slot,
                    SlotOutcome::Failed(Error::Unavailable("server shutting down".into())),
                    model_id,
                );
            }
        }

        while let Ok(req) = self.queue.try_recv() {
            send_terminal(
                &req.events,
                &req.ctx,
                ChatResponse::err(
                    &req.id,
                    model_id,
                    &Error::Unavailable("server shutting down".into()),
                    Usage::default(),
                ),
            );
        }
    }
}

/// Append a slot's pending prompt tokens to the batch, logits enabled on
/// the final position only.
fn append_prompt(slot: &mut Slot, batch: &mut Batch) {
    let seq = slot.seq_id();
    let tokens = std::mem::take(&mut slot.pending);

    let mut last = None;
    for token in &tokens {
        last = Some(batch.add(*token, slot.n_past, seq, false));
        slot.n_past += 1;
    }
    slot.pending = tokens;

    if let Some(last) = last {
        batch.set_logits(last, true);
        slot.i_batch = Some(last);
    }
}

/// Terminal events must not be lost to a full sink: try first, then block
/// until the receiver drains or goes away. A cancelled request's receiver
/// is dropped by the streaming wrapper, which unblocks the send.
fn send_terminal(events: &mpsc::Sender<ChatResponse>, ctx: &Ctx, resp: ChatResponse) {
    if let Err(mpsc::error::TrySendError::Full(resp)) = events.try_send(resp) {
        if ctx.is_done() {
            return;
        }
        let _ = events.blocking_send(resp);
    }
}
