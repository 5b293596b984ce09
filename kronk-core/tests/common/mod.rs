#![allow(dead_code)]
//! Scripted engine used by the integration tests.
//!
//! Tokens below 999 are pseudo prompt tokens, 999 is end-of-generation,
//! and 1000+i maps to the i-th scripted piece. Decoding any sequence walks
//! the script in order and then yields end-of-generation forever, so every
//! request against the engine streams the same deterministic content.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kronk_core::engine::{Batch, Engine, EngineLoader, SeqId, Token};
use kronk_core::error::{Error, Result};
use kronk_core::{ModelConfig, ModelFamily, ModelInfo};

pub const EOG: Token = 999;
const SCRIPT_BASE: Token = 1000;

#[derive(Clone)]
pub struct MockLoader {
    pub script: Vec<String>,
    pub family: ModelFamily,
    /// Artificial latency per decode/embed/rank call.
    pub delay: Duration,
    /// Number of engine instances constructed.
    pub loads: Arc<AtomicUsize>,
    /// Fail this many upcoming loads.
    pub fail_loads: Arc<AtomicUsize>,
    /// Fail this many upcoming decode calls.
    pub fail_decodes: Arc<AtomicU32>,
}

impl MockLoader {
    pub fn new(script: &[&str]) -> Self {
        Self {
            script: script.iter().map(|s| s.to_string()).collect(),
            family: ModelFamily::Standard,
            delay: Duration::ZERO,
            loads: Arc::new(AtomicUsize::new(0)),
            fail_loads: Arc::new(AtomicUsize::new(0)),
            fail_decodes: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl EngineLoader for MockLoader {
    fn load(&self, cfg: &ModelConfig) -> Result<Box<dyn Engine>> {
        if self
            .fail_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Internal("scripted load failure".into()));
        }

        self.loads.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MockEngine {
            info: ModelInfo {
                id: cfg.model_id.clone(),
                description: "scripted test model".into(),
                family: self.family,
                is_embed: cfg.embeddings,
                is_rerank: cfg.rerank,
                is_vision: cfg.projection_file.is_some(),
                n_ctx: if cfg.context_window == 0 {
                    4096
                } else {
                    cfg.context_window
                },
                n_embd: 8,
            },
            script: self.script.clone(),
            delay: self.delay,
            fail_decodes: self.fail_decodes.clone(),
            histories: HashMap::new(),
            logits_rows: HashMap::new(),
            last_logits: None,
        }))
    }
}

pub struct MockEngine {
    info: ModelInfo,
    script: Vec<String>,
    delay: Duration,
    fail_decodes: Arc<AtomicU32>,
    histories: HashMap<SeqId, Vec<Token>>,
    logits_rows: HashMap<usize, Vec<f32>>,
    last_logits: Option<Vec<f32>>,
}

impl MockEngine {
    fn vocab_size(&self) -> usize {
        SCRIPT_BASE as usize + self.script.len() + 1
    }

    /// Logits that force the next scripted token (or end-of-generation)
    /// for a sequence, regardless of sampling settings.
    fn seq_logits(&self, seq_id: SeqId) -> Vec<f32> {
        let generated = self
            .histories
            .get(&seq_id)
            .map(|h| {
                h.iter()
                    .filter(|t| **t >= SCRIPT_BASE || **t == EOG)
                    .count()
            })
            .unwrap_or(0);

        let desired = if generated < self.script.len() {
            SCRIPT_BASE + generated as Token
        } else {
            EOG
        };

        let mut logits = vec![-100.0f32; self.vocab_size()];
        logits[desired as usize] = 100.0;
        logits
    }

    fn piece(&self, token: Token) -> &str {
        if token >= SCRIPT_BASE {
            self.script
                .get((token - SCRIPT_BASE) as usize)
                .map(String::as_str)
                .unwrap_or("")
        } else {
            ""
        }
    }

    fn flush_run(&mut self, seq: SeqId, start_pos: usize, run: &[(usize, Token, bool)]) {
        let history = self.histories.entry(seq).or_default();
        if start_pos < history.len() {
            history.truncate(start_pos);
        }
        for (_, token, _) in run {
            history.push(*token);
        }

        let logits = self.seq_logits(seq);
        if let Some((index, _, _)) = run.iter().rev().find(|(_, _, l)| *l) {
            self.logits_rows.insert(*index, logits.clone());
        }
        self.last_logits = Some(logits);
    }
}

impl Engine for MockEngine {
    fn info(&self) -> ModelInfo {
        self.info.clone()
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        if add_bos {
            tokens.push(1);
        }
        for word in text.split_whitespace() {
            let id = word.bytes().map(u32::from).sum::<u32>() % 900 + 2;
            tokens.push(id);
        }
        Ok(tokens)
    }

    fn detokenize(&self, tokens: &[Token], _keep_special: bool) -> Result<String> {
        Ok(tokens.iter().map(|t| self.piece(*t)).collect())
    }

    fn is_eog(&self, token: Token) -> bool {
        token == EOG
    }

    fn decode(&mut self, batch: &Batch) -> Result<()> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        if self
            .fail_decodes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Internal("scripted decode failure".into()));
        }

        self.logits_rows.clear();

        let mut run: Vec<(usize, Token, bool)> = Vec::new();
        let mut run_seq: Option<SeqId> = None;
        let mut run_start_pos = 0usize;

        for (index, row) in batch.rows().iter().enumerate() {
            if run_seq != Some(row.seq_id) {
                if let Some(seq) = run_seq {
                    if !run.is_empty() {
                        let pending = std::mem::take(&mut run);
                        self.flush_run(seq, run_start_pos, &pending);
                    }
                }
                run_seq = Some(row.seq_id);
                run_start_pos = row.pos;
            }
            run.push((index, row.token, row.logits));
        }

        if let Some(seq) = run_seq {
            if !run.is_empty() {
                self.flush_run(seq, run_start_pos, &run);
            }
        }

        Ok(())
    }

    fn logits(&mut self, index: usize) -> Result<Vec<f32>> {
        self.logits_rows
            .get(&index)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("no logits for batch row {index}")))
    }

    fn logits_last(&mut self) -> Result<Vec<f32>> {
        self.last_logits
            .clone()
            .ok_or_else(|| Error::Internal("no decode has produced logits".into()))
    }

    fn kv_clear_seq(&mut self, seq_id: SeqId) {
        self.histories.remove(&seq_id);
    }

    fn kv_copy_seq(&mut self, src: SeqId, dst: SeqId) {
        let history = self.histories.get(&src).cloned().unwrap_or_default();
        self.histories.insert(dst, history);
    }

    fn embed_text(&mut self, text: &str) -> Result<Vec<f32>> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let sum: u32 = text.bytes().map(u32::from).sum();
        Ok(vec![
            text.len() as f32,
            (sum % 97) as f32 + 1.0,
            1.0,
        ])
    }

    fn rank_pair(&mut self, query: &str, document: &str) -> Result<f32> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        // Relevance logit: count of shared lowercase words.
        let clean = |s: &str| {
            s.split_whitespace()
                .map(|w| {
                    w.trim_matches(|c: char| !c.is_alphanumeric())
                        .to_lowercase()
                })
                .collect::<std::collections::HashSet<_>>()
        };

        let q = clean(query);
        let d = clean(document);
        let overlap = q.intersection(&d).count() as f32;
        Ok(overlap - 2.0)
    }

    fn eval_media(&mut self, prompt: &str, media: &[Vec<u8>]) -> Result<usize> {
        if media.is_empty() {
            return Err(Error::InvalidArgument("no media supplied".into()));
        }

        let consumed = self.tokenize(prompt, true)?.len() + media.len();
        self.histories.insert(0, vec![2; consumed]);
        self.last_logits = Some(self.seq_logits(0));
        Ok(consumed)
    }
}
