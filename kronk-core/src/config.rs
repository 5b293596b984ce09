//! Model configuration and derived metadata.

use serde::{Deserialize, Serialize};

/// KV cache quantization applied to the context memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KvCacheType {
    #[default]
    F16,
    F32,
    Q8,
    Q4,
}

/// Configuration for one logical model.
///
/// `model_id` is the canonical lowercase identifier used as the cache key.
/// `n_seq_max` controls concurrency: for text-generation models it is the
/// number of slots multiplexed onto one instance; for sequential models
/// (embedding, rerank, vision) it is the size of the instance pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Canonical model identifier, e.g. "qwen/qwen3-0.6b".
    pub model_id: String,
    /// Repository revision or branch.
    pub revision: String,
    /// Context window in tokens. 0 means use the model default.
    pub context_window: usize,
    /// Logical batch size handed to the engine per decode.
    pub n_batch: usize,
    /// Micro batch size for the physical decode.
    pub n_ubatch: usize,
    /// Maximum concurrent sequences.
    pub n_seq_max: usize,
    /// KV cache quantization.
    pub kv_cache_type: KvCacheType,
    /// Optional multimodal projection file. Presence marks the model as a
    /// vision model and forces the pooled path.
    pub projection_file: Option<String>,
    /// The model produces embeddings rather than text.
    pub embeddings: bool,
    /// The model is a relevance reranker.
    pub rerank: bool,
    /// Device hint: "cpu", "cuda", "metal" or empty for auto.
    pub device: String,
    /// System prompt decoded once and shared across all batch slots.
    pub system_prompt: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: String::new(),
            revision: "main".to_string(),
            context_window: 0,
            n_batch: 2048,
            n_ubatch: 512,
            n_seq_max: 1,
            kv_cache_type: KvCacheType::default(),
            projection_file: None,
            embeddings: false,
            rerank: false,
            device: String::new(),
            system_prompt: "You are a helpful assistant.".to_string(),
        }
    }
}

impl ModelConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into().to_lowercase(),
            ..Default::default()
        }
    }

    /// Clamp zero or inconsistent values to usable defaults. The context
    /// window falls back to 4096 when neither the caller nor the model
    /// metadata provided one.
    pub fn adjusted(mut self, metadata_ctx: Option<usize>) -> Self {
        if self.context_window == 0 {
            self.context_window = metadata_ctx.unwrap_or(4096);
        }

        if self.n_seq_max == 0 {
            self.n_seq_max = 1;
        }

        if self.n_batch == 0 {
            self.n_batch = 2048;
        }

        if self.n_ubatch == 0 || self.n_ubatch > self.n_batch {
            self.n_ubatch = self.n_batch.min(512);
        }

        self.model_id = self.model_id.to_lowercase();
        self
    }

    /// Sequential models run one request per instance and are served by an
    /// instance pool instead of the batch scheduler.
    pub fn is_sequential(&self) -> bool {
        self.projection_file.is_some() || self.embeddings || self.rerank
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjusted_fills_defaults() {
        let cfg = ModelConfig {
            context_window: 0,
            n_seq_max: 0,
            n_batch: 0,
            n_ubatch: 0,
            ..ModelConfig::new("Test/Model")
        }
        .adjusted(None);

        assert_eq!(cfg.context_window, 4096);
        assert_eq!(cfg.n_seq_max, 1);
        assert_eq!(cfg.n_batch, 2048);
        assert_eq!(cfg.n_ubatch, 512);
        assert_eq!(cfg.model_id, "test/model");
    }

    #[test]
    fn adjusted_prefers_metadata_window() {
        let cfg = ModelConfig::new("m").adjusted(Some(8192));
        assert_eq!(cfg.context_window, 8192);
    }

    #[test]
    fn sequential_detection() {
        let mut cfg = ModelConfig::new("m");
        assert!(!cfg.is_sequential());

        cfg.embeddings = true;
        assert!(cfg.is_sequential());

        let mut cfg = ModelConfig::new("m");
        cfg.projection_file = Some("mmproj.gguf".into());
        assert!(cfg.is_sequential());
    }
}
