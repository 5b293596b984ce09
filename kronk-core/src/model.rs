//! Candle-backed engine implementation.
//!
//! Loads Llama-family models from the HuggingFace Hub and adapts them to
//! the [`Engine`] seam. The underlying substrate keeps a single KV cache,
//! so per-sequence isolation is provided by tracking token histories per
//! sequence id and replaying a sequence's history whenever the cache owner
//! changes. Observable behavior matches a seq-partitioned cache; switching
//! sequences costs a replay.

use std::collections::HashMap;
use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig, LlamaEosToks};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::info;

use crate::config::{KvCacheType, ModelConfig};
use crate::engine::{
    init_backend, Batch, Engine, EngineLoader, ModelFamily, ModelInfo, SeqId, Token,
};
use crate::error::{Error, Result};

/// Loads [`CandleEngine`] instances for the manager.
pub struct CandleLoader;

impl EngineLoader for CandleLoader {
    fn load(&self, cfg: &ModelConfig) -> Result<Box<dyn Engine>> {
        Ok(Box::new(CandleEngine::load(cfg)?))
    }
}

/// One loaded model plus its generation state.
pub struct CandleEngine {
    info: ModelInfo,
    device: Device,
    kv_dtype: DType,
    llama_config: Config,
    model: Llama,
    tokenizer: Tokenizer,
    eos_tokens: Vec<Token>,
    cache: Cache,
    cache_owner: Option<SeqId>,
    histories: HashMap<SeqId, Vec<Token>>,
    logits_rows: HashMap<usize, Vec<f32>>,
    last_logits: Option<Vec<f32>>,
}

impl CandleEngine {
    pub fn load(cfg: &ModelConfig) -> Result<Self> {
        init_backend();

        let device = select_device(&cfg.device);
        let dtype = if matches!(device, Device::Cpu) {
            DType::F32
        } else {
            DType::F16
        };

        info!(model_id = %cfg.model_id, "loading model");

        let api = Api::new().map_err(Error::internal)?;
        let repo = api.repo(Repo::with_revision(
            cfg.model_id.clone(),
            RepoType::Model,
            cfg.revision.clone(),
        ));

        let tokenizer_file = repo.get("tokenizer.json").map_err(Error::internal)?;
        let tokenizer = Tokenizer::from_file(&tokenizer_file)
            .map_err(|err| Error::Internal(format!("unable to load tokenizer: {err}")))?;

        let config_file = repo.get("config.json").map_err(Error::internal)?;
        let llama_config: LlamaConfig =
            serde_json::from_slice(&std::fs::read(&config_file).map_err(Error::internal)?)
                .map_err(Error::internal)?;
        let llama_config = llama_config.into_config(false);

        let filenames = safetensor_files(&repo)?;
        info!(files = filenames.len(), "loading model weights");

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&filenames, dtype, &device)
                .map_err(Error::internal)?
        };
        let model = Llama::load(vb, &llama_config)
            .map_err(|err| Error::Internal(format!("unable to load model: {err}")))?;

        // Quantized KV formats have no counterpart on this substrate and
        // fall back to f16.
        let kv_dtype = match cfg.kv_cache_type {
            KvCacheType::F32 => DType::F32,
            KvCacheType::F16 | KvCacheType::Q8 | KvCacheType::Q4 => {
                if matches!(device, Device::Cpu) {
                    DType::F32
                } else {
                    DType::F16
                }
            }
        };

        let cache =
            Cache::new(true, kv_dtype, &llama_config, &device).map_err(Error::internal)?;

        let mut eos_tokens = match llama_config.eos_token_id.clone() {
            Some(LlamaEosToks::Single(id)) => vec![id],
            Some(LlamaEosToks::Multiple(ids)) => ids,
            None => Vec::new(),
        };
        for marker in ["</s>", "<|im_end|>", "<|return|>", "<|eot_id|>"] {
            if let Some(id) = tokenizer.token_to_id(marker) {
                if !eos_tokens.contains(&id) {
                    eos_tokens.push(id);
                }
            }
        }

        let cfg = cfg.clone().adjusted(Some(llama_config.max_position_embeddings));

        let family = if cfg.model_id.contains("gpt-oss") {
            ModelFamily::Gpt
        } else {
            ModelFamily::Standard
        };

        let info = ModelInfo {
            id: cfg.model_id.clone(),
            description: format!(
                "llama {} layers, hidden {}, vocab {}",
                llama_config.num_hidden_layers, llama_config.hidden_size, llama_config.vocab_size,
            ),
            family,
            is_embed: cfg.embeddings,
            is_rerank: cfg.rerank,
            is_vision: cfg.projection_file.is_some(),
            n_ctx: cfg.context_window,
            n_embd: llama_config.hidden_size,
        };

        info!(
            vocab = llama_config.vocab_size,
            layers = llama_config.num_hidden_layers,
            n_ctx = info.n_ctx,
            "model loaded",
        );

        Ok(Self {
            info,
            device,
            kv_dtype,
            llama_config,
            model,
            tokenizer,
            eos_tokens,
            cache,
            cache_owner: None,
            histories: HashMap::new(),
            logits_rows: HashMap::new(),
            last_logits: None,
        })
    }

    fn fresh_cache(&mut self) -> Result<()> {
        self.cache = Cache::new(true, self.kv_dtype, &self.llama_config, &self.device)
            .map_err(Error::internal)?;
        Ok(())
    }

    /// Run one forward pass over `tokens` starting at `index_pos`,
    /// returning the last-position logits.
    fn forward(&mut self, tokens: &[Token], index_pos: usize) -> Result<Vec<f32>> {
        let input = Tensor::new(tokens, &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(Error::internal)?;

        let logits = self
            .model
            .forward(&input, index_pos, &mut self.cache)
            .map_err(|err| Error::Internal(format!("decode failed: {err}")))?;

        let logits = logits.squeeze(0).map_err(Error::internal)?;
        let logits = if logits.dims().len() > 1 {
            logits
                .get(logits.dims()[0] - 1)
                .map_err(Error::internal)?
        } else {
            logits
        };

        logits
            .to_dtype(DType::F32)
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(Error::internal)
    }

    /// Decode a contiguous run of rows belonging to one sequence. The
    /// run's last logits-enabled row receives the forward-pass output.
    ///
    /// Row positions are authoritative: a row placed below the current
    /// history length truncates the history first, which makes retries of
    /// a failed batch idempotent.
    fn decode_seq_run(&mut self, seq_id: SeqId, rows: &[(usize, crate::engine::BatchRow)]) -> Result<()> {
        let tokens: Vec<Token> = rows.iter().map(|(_, row)| row.token).collect();
        let start_pos = rows[0].1.pos;

        let history = self.histories.entry(seq_id).or_default();
        if start_pos < history.len() {
            history.truncate(start_pos);
            if self.cache_owner == Some(seq_id) {
                self.cache_owner = None;
            }
        }
        let history_len = history.len();

        let logits = if self.cache_owner == Some(seq_id) {
            self.forward(&tokens, history_len)?
        } else {
            // Cache miss: replay this sequence's history together with the
            // new tokens from position zero.
            self.fresh_cache()?;
            let mut replay = self.histories.get(&seq_id).cloned().unwrap_or_default();
            replay.extend_from_slice(&tokens);
            self.forward(&replay, 0)?
        };

        self.cache_owner = Some(seq_id);
        self.histories.entry(seq_id).or_default().extend(tokens);

        if let Some((index, _)) = rows.iter().rev().find(|(_, row)| row.logits) {
            self.logits_rows.insert(*index, logits.clone());
        }
        self.last_logits = Some(logits);

        Ok(())
    }
}

impl Engine for CandleEngine {
    fn info(&self) -> ModelInfo {
        self.info.clone()
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>> {
        self.tokenizer
            .encode(text, add_bos)
            .map_err(|err| Error::Internal(format!("tokenization error: {err}")))
            .map(|enc| enc.get_ids().to_vec())
    }

    fn detokenize(&self, tokens: &[Token], keep_special: bool) -> Result<String> {
        self.tokenizer
            .decode(tokens, !keep_special)
            .map_err(|err| Error::Internal(format!("decode error: {err}")))
    }

    fn is_eog(&self, token: Token) -> bool {
        self.eos_tokens.contains(&token)
    }

    fn decode(&mut self, batch: &Batch) -> Result<()> {
        self.logits_rows.clear();

        // Split the batch into contiguous single-sequence runs and decode
        // them in order.
        let mut run: Vec<(usize, crate::engine::BatchRow)> = Vec::new();
        let mut run_seq: Option<SeqId> = None;

        for (index, row) in batch.rows().iter().enumerate() {
            if run_seq != Some(row.seq_id) && !run.is_empty() {
                self.decode_seq_run(run_seq.unwrap(), &run)?;
                run.clear();
            }
            run_seq = Some(row.seq_id);
            run.push((index, *row));
        }

        if let Some(seq_id) = run_seq {
            if !run.is_empty() {
                self.decode_seq_run(seq_id, &run)?;
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
        if self.cache_owner == Some(seq_id) {
            self.cache_owner = None;
        }
    }

    fn kv_copy_seq(&mut self, src: SeqId, dst: SeqId) {
        let history = self.histories.get(&src).cloned().unwrap_or_default();
        self.histories.insert(dst, history);
        if self.cache_owner == Some(dst) {
            self.cache_owner = None;
        }
    }

    fn embed_text(&mut self, _text: &str) -> Result<Vec<f32>> {
        Err(Error::Internal(
            "embedding output is not supported by the causal-lm engine".into(),
        ))
    }

    fn rank_pair(&mut self, _query: &str, _document: &str) -> Result<f32> {
        Err(Error::Internal(
            "rerank scoring is not supported by the causal-lm engine".into(),
        ))
    }

    fn eval_media(&mut self, _prompt: &str, _media: &[Vec<u8>]) -> Result<usize> {
        Err(Error::Internal(
            "no multimodal projector is loaded".into(),
        ))
    }
}

/// Resolve the safetensor file set, handling sharded checkpoints.
fn safetensor_files(repo: &hf_hub::api::sync::ApiRepo) -> Result<Vec<PathBuf>> {
    if let Ok(single) = repo.get("model.safetensors") {
        return Ok(vec![single]);
    }

    let index_file = repo
        .get("model.safetensors.index.json")
        .map_err(Error::internal)?;
    let index: serde_json::Value = serde_json::from_reader(
        &std::fs::File::open(&index_file).map_err(Error::internal)?,
    )
    .map_err(Error::internal)?;

    let Some(weight_map) = index.get("weight_map").and_then(|v| v.as_object()) else {
        return Err(Error::Internal(format!("no weight map in {index_file:?}")));
    };

    let mut files = std::collections::HashSet::new();
    for value in weight_map.values() {
        if let Some(file) = value.as_str() {
            files.insert(file.to_string());
        }
    }

    files
        .iter()
        .map(|f| repo.get(f).map_err(Error::internal))
        .collect()
}

fn select_device(hint: &str) -> Device {
    match hint {
        "cpu" => Device::Cpu,
        "cuda" => cuda_device().unwrap_or(Device::Cpu),
        "metal" => metal_device().unwrap_or(Device::Cpu),
        _ => cuda_device()
            .or_else(metal_device)
            .unwrap_or(Device::Cpu),
    }
}

fn cuda_device() -> Option<Device> {
    if cfg!(feature = "cuda") {
        Device::new_cuda(0).ok()
    } else {
        None
    }
}

fn metal_device() -> Option<Device> {
    if cfg!(feature = "metal") {
        Device::new_metal(0).ok()
    } else {
        None
    }
}
