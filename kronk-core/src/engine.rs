//! The seam between the core and the native execution library.
//!
//! Everything above this module is written against [`Engine`]: a loaded set
//! of model weights plus one context. The production implementation lives in
//! [`crate::model`]; tests drive the core with a scripted stand-in.

use std::sync::Once;

use serde::Serialize;

use crate::config::ModelConfig;
use crate::error::Result;

/// Token identifier in the model vocabulary.
pub type Token = u32;

/// Sequence identifier partitioning the KV cache. Sequence 0 is reserved
/// for the shared system prompt in batch mode.
pub type SeqId = u32;

/// Model family discriminant. Selects the delimiter table used by the
/// token stream parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    /// `<think>` / `<tool_call>` style markers (Qwen, Llama, DeepSeek, ...).
    Standard,
    /// `<|channel|>` / `<|message|>` header markers (gpt-oss).
    Gpt,
}

/// Metadata derived from a loaded model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub description: String,
    pub family: ModelFamily,
    pub is_embed: bool,
    pub is_rerank: bool,
    pub is_vision: bool,
    pub n_ctx: usize,
    pub n_embd: usize,
}

impl ModelInfo {
    /// Sequential models are served one request per instance.
    pub fn is_sequential(&self) -> bool {
        self.is_embed || self.is_rerank || self.is_vision
    }
}

/// One row of a decode batch: a token placed at `pos` within sequence
/// `seq_id`. Logits are produced only for rows with `logits` set.
#[derive(Debug, Clone, Copy)]
pub struct BatchRow {
    pub token: Token,
    pub pos: usize,
    pub seq_id: SeqId,
    pub logits: bool,
}

/// A batch of token rows submitted to one decode call.
#[derive(Debug, Default)]
pub struct Batch {
    rows: Vec<BatchRow>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    /// Append a row and return its batch index.
    pub fn add(&mut self, token: Token, pos: usize, seq_id: SeqId, logits: bool) -> usize {
        self.rows.push(BatchRow {
            token,
            pos,
            seq_id,
            logits,
        });
        self.rows.len() - 1
    }

    /// Flip the logits flag on an existing row.
    pub fn set_logits(&mut self, index: usize, logits: bool) {
        if let Some(row) = self.rows.get_mut(index) {
            row.logits = logits;
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[BatchRow] {
        &self.rows
    }
}

/// A loaded model instance with an attached context.
///
/// One `Engine` is owned either by a pool (sequential models) or by the
/// batch scheduler task (text models); it is never shared. All methods are
/// blocking and must be called off the async runtime.
pub trait Engine: Send {
    /// Metadata derived at load time.
    fn info(&self) -> ModelInfo;

    /// Tokenize UTF-8 text. `add_bos` controls the leading
    /// beginning-of-sequence token.
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>>;

    /// Decode tokens back to text. `keep_special` preserves control tokens
    /// such as `<think>` so the stream parser can see them.
    fn detokenize(&self, tokens: &[Token], keep_special: bool) -> Result<String>;

    /// Whether `token` ends generation for this vocabulary.
    fn is_eog(&self, token: Token) -> bool;

    /// Run one forward pass over the batch.
    fn decode(&mut self, batch: &Batch) -> Result<()>;

    /// Logits for the batch row at `index` from the most recent decode.
    /// The row must have had its logits flag set.
    fn logits(&mut self, index: usize) -> Result<Vec<f32>>;

    /// Logits for the last logits-enabled row of the most recent decode
    /// (or media evaluation).
    fn logits_last(&mut self) -> Result<Vec<f32>>;

    /// Remove all KV entries for a sequence.
    fn kv_clear_seq(&mut self, seq_id: SeqId);

    /// Copy the KV entries of `src` into `dst`.
    fn kv_copy_seq(&mut self, src: SeqId, dst: SeqId);

    /// Embedding vector for one input text. Embedding models only.
    fn embed_text(&mut self, text: &str) -> Result<Vec<f32>>;

    /// Raw relevance logit for a query/document pair. Rerank models only.
    fn rank_pair(&mut self, query: &str, document: &str) -> Result<f32>;

    /// Evaluate a prompt together with media bytes through the multimodal
    /// projector, leaving the context ready to sample. Returns the number
    /// of positions consumed. Vision models only.
    fn eval_media(&mut self, prompt: &str, media: &[Vec<u8>]) -> Result<usize>;
}

/// Constructs engine instances for the manager and the kronk handle.
pub trait EngineLoader: Send + Sync {
    fn load(&self, cfg: &ModelConfig) -> Result<Box<dyn Engine>>;
}

impl<F> EngineLoader for F
where
    F: Fn(&ModelConfig) -> Result<Box<dyn Engine>> + Send + Sync,
{
    fn load(&self, cfg: &ModelConfig) -> Result<Box<dyn Engine>> {
        self(cfg)
    }
}

static INIT: Once = Once::new();

/// Process-wide backend initialization. Must be called before any model
/// load; further calls are no-ops.
pub fn init_backend() {
    INIT.call_once(|| {
        tracing::info!("native backend initialized");
    });
}

/// Incremental piece decoder for one generation stream.
///
/// Tokenizers do not guarantee that a single token round-trips to valid
/// UTF-8, so pieces are produced from the decoded-text delta of the full
/// window, holding back bytes until they form complete characters.
pub struct TokenDecoder {
    tokens: Vec<Token>,
    prev_index: usize,
    current_index: usize,
}

impl TokenDecoder {
    pub fn new() -> Self {
        Self {
            tokens: Vec::new(),
            prev_index: 0,
            current_index: 0,
        }
    }

    /// Feed one sampled token; returns the newly completed text, if any.
    pub fn next_token(&mut self, engine: &dyn Engine, token: Token) -> Result<Option<String>> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            let window = &self.tokens[self.prev_index..self.current_index];
            engine.detokenize(window, true)?
        };

        self.tokens.push(token);
        let text = engine.detokenize(&self.tokens[self.prev_index..], true)?;

        if text.len() > prev_text.len() && text.is_char_boundary(prev_text.len()) {
            let piece = text[prev_text.len()..].to_string();
            self.prev_index = self.current_index;
            self.current_index = self.tokens.len();
            Ok(Some(piece))
        } else {
            Ok(None)
        }
    }

    /// Flush any residue held back while waiting for a character boundary.
    pub fn flush(&mut self, engine: &dyn Engine) -> Result<Option<String>> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            let window = &self.tokens[self.prev_index..self.current_index];
            engine.detokenize(window, true)?
        };

        let text = engine.detokenize(&self.tokens[self.prev_index..], true)?;
        if text.len() > prev_text.len() {
            Ok(Some(text[prev_text.len()..].to_string()))
        } else {
            Ok(None)
        }
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
        self.prev_index = 0;
        self.current_index = 0;
    }
}

impl Default for TokenDecoder {
    fn default() -> Self {
        Self::new()
    }
}
