//! Request documents and sampling parameters.
//!
//! Requests arrive as free-form JSON documents. The boundary validation
//! here turns the option bag into a typed [`Params`] and extracts messages,
//! tools and media. Every recognized key coerces from string, integer or
//! float form; anything else is an `InvalidArgument`.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// A free-form request document.
pub type Doc = Map<String, Value>;

/// One chat turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Reasoning effort requested for GPT-family models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    None,
    Minimal,
    Low,
    #[default]
    Medium,
    High,
}

impl ReasoningEffort {
    fn parse(name: &str, val: &Value) -> Result<Self> {
        let Some(s) = val.as_str() else {
            return Err(Error::InvalidArgument(format!("{name} is not a valid type")));
        };

        match s {
            "none" => Ok(Self::None),
            "minimal" => Ok(Self::Minimal),
            "low" => Ok(Self::Low),
            "medium" | "" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(Error::InvalidArgument(format!(
                "{name} is not a valid option: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

const DEF_TEMPERATURE: f32 = 0.8;
const DEF_TOP_K: i32 = 40;
const DEF_TOP_P: f32 = 0.9;
const DEF_REPEAT_PENALTY: f32 = 1.1;
const DEF_REPEAT_LAST_N: usize = 64;
const DEF_DRY_BASE: f32 = 1.75;
const DEF_DRY_ALLOWED_LENGTH: usize = 2;
const DEF_XTC_THRESHOLD: f32 = 0.1;
const DEF_XTC_MIN_KEEP: usize = 1;
const DEF_SEED: u64 = 0xD2A7;

/// Typed sampling and generation options. Zero values are replaced with
/// defaults by [`Params::adjusted`]; `max_tokens` defaults to the model's
/// context window.
#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub max_tokens: usize,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    pub dry_multiplier: f32,
    pub dry_base: f32,
    pub dry_allowed_length: usize,
    pub dry_penalty_last_n: usize,
    pub xtc_probability: f32,
    pub xtc_threshold: f32,
    pub xtc_min_keep: usize,
    pub enable_thinking: bool,
    pub reasoning_effort: ReasoningEffort,
    pub return_prompt: bool,
    pub seed: u64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            temperature: DEF_TEMPERATURE,
            top_k: DEF_TOP_K,
            top_p: DEF_TOP_P,
            min_p: 0.0,
            max_tokens: 0,
            repeat_penalty: DEF_REPEAT_PENALTY,
            repeat_last_n: DEF_REPEAT_LAST_N,
            dry_multiplier: 0.0,
            dry_base: DEF_DRY_BASE,
            dry_allowed_length: DEF_DRY_ALLOWED_LENGTH,
            dry_penalty_last_n: 0,
            xtc_probability: 0.0,
            xtc_threshold: DEF_XTC_THRESHOLD,
            xtc_min_keep: DEF_XTC_MIN_KEEP,
            enable_thinking: true,
            reasoning_effort: ReasoningEffort::Medium,
            return_prompt: false,
            seed: DEF_SEED,
        }
    }
}

/// Every option key the core understands, including the non-sampling
/// fields consumed elsewhere in the request pipeline.
const RECOGNIZED_KEYS: &[&str] = &[
    "messages",
    "tools",
    "image",
    "model",
    "stream",
    "input",
    "query",
    "documents",
    "top_n",
    "return_documents",
    "temperature",
    "top_k",
    "top_p",
    "min_p",
    "max_tokens",
    "repeat_penalty",
    "repeat_last_n",
    "dry_multiplier",
    "dry_base",
    "dry_allowed_length",
    "dry_penalty_last_n",
    "xtc_probability",
    "xtc_threshold",
    "xtc_min_keep",
    "enable_thinking",
    "reasoning_effort",
    "return_prompt",
    "seed",
];

impl Params {
    /// Parse the option bag out of a request document. `strict` rejects
    /// unrecognized keys.
    pub fn from_doc(d: &Doc, strict: bool) -> Result<Self> {
        if strict {
            for key in d.keys() {
                if !RECOGNIZED_KEYS.contains(&key.as_str()) {
                    return Err(Error::InvalidArgument(format!("unknown option: {key}")));
                }
            }
        }

        let mut p = Params {
            temperature: 0.0,
            top_k: 0,
            top_p: 0.0,
            min_p: 0.0,
            max_tokens: 0,
            repeat_penalty: 0.0,
            repeat_last_n: 0,
            dry_multiplier: 0.0,
            dry_base: 0.0,
            dry_allowed_length: 0,
            dry_penalty_last_n: 0,
            xtc_probability: 0.0,
            xtc_threshold: 0.0,
            xtc_min_keep: 0,
            enable_thinking: true,
            reasoning_effort: ReasoningEffort::Medium,
            return_prompt: false,
            seed: DEF_SEED,
        };

        if let Some(v) = d.get("temperature") {
            p.temperature = parse_f32("temperature", v)?;
        }
        if let Some(v) = d.get("top_k") {
            p.top_k = parse_int("top_k", v)? as i32;
        }
        if let Some(v) = d.get("top_p") {
            p.top_p = parse_f32("top_p", v)?;
        }
        if let Some(v) = d.get("min_p") {
            p.min_p = parse_f32("min_p", v)?;
        }
        if let Some(v) = d.get("max_tokens") {
            p.max_tokens = parse_int("max_tokens", v)?.max(0) as usize;
        }
        if let Some(v) = d.get("repeat_penalty") {
            p.repeat_penalty = parse_f32("repeat_penalty", v)?;
        }
        if let Some(v) = d.get("repeat_last_n") {
            p.repeat_last_n = parse_int("repeat_last_n", v)?.max(0) as usize;
        }
        if let Some(v) = d.get("dry_multiplier") {
            p.dry_multiplier = parse_f32("dry_multiplier", v)?;
        }
        if let Some(v) = d.get("dry_base") {
            p.dry_base = parse_f32("dry_base", v)?;
        }
        if let Some(v) = d.get("dry_allowed_length") {
            p.dry_allowed_length = parse_int("dry_allowed_length", v)?.max(0) as usize;
        }
        if let Some(v) = d.get("dry_penalty_last_n") {
            p.dry_penalty_last_n = parse_int("dry_penalty_last_n", v)?.max(0) as usize;
        }
        if let Some(v) = d.get("xtc_probability") {
            p.xtc_probability = parse_f32("xtc_probability", v)?;
        }
        if let Some(v) = d.get("xtc_threshold") {
            p.xtc_threshold = parse_f32("xtc_threshold", v)?;
        }
        if let Some(v) = d.get("xtc_min_keep") {
            p.xtc_min_keep = parse_int("xtc_min_keep", v)?.max(0) as usize;
        }
        if let Some(v) = d.get("enable_thinking") {
            p.enable_thinking = parse_bool("enable_thinking", v)?;
        }
        if let Some(v) = d.get("reasoning_effort") {
            p.reasoning_effort = ReasoningEffort::parse("reasoning_effort", v)?;
        }
        if let Some(v) = d.get("return_prompt") {
            p.return_prompt = parse_bool("return_prompt", v)?;
        }
        if let Some(v) = d.get("seed") {
            p.seed = parse_int("seed", v)?.max(0) as u64;
        }

        Ok(p)
    }

    /// Replace unset values with defaults. `context_window` caps and
    /// defaults `max_tokens`.
    pub fn adjusted(mut self, context_window: usize) -> Self {
        if self.temperature <= 0.0 {
            self.temperature = DEF_TEMPERATURE;
        }
        if self.top_k <= 0 {
            self.top_k = DEF_TOP_K;
        }
        if self.top_p <= 0.0 {
            self.top_p = DEF_TOP_P;
        }
        if self.min_p < 0.0 {
            self.min_p = 0.0;
        }
        if self.max_tokens == 0 || self.max_tokens > context_window {
            self.max_tokens = context_window;
        }
        if self.repeat_penalty <= 0.0 {
            self.repeat_penalty = DEF_REPEAT_PENALTY;
        }
        if self.repeat_last_n == 0 {
            self.repeat_last_n = DEF_REPEAT_LAST_N;
        }
        if self.dry_base <= 0.0 {
            self.dry_base = DEF_DRY_BASE;
        }
        if self.dry_allowed_length == 0 {
            self.dry_allowed_length = DEF_DRY_ALLOWED_LENGTH;
        }
        if self.xtc_threshold <= 0.0 {
            self.xtc_threshold = DEF_XTC_THRESHOLD;
        }
        if self.xtc_min_keep == 0 {
            self.xtc_min_keep = DEF_XTC_MIN_KEEP;
        }
        self
    }
}

/// Extract and validate the `messages` list.
pub fn messages_from_doc(d: &Doc) -> Result<Vec<ChatMessage>> {
    let Some(messages) = d.get("messages") else {
        return Err(Error::InvalidArgument("no messages found in request".into()));
    };

    let Some(list) = messages.as_array() else {
        return Err(Error::InvalidArgument(
            "messages is not a list of documents".into(),
        ));
    };

    let mut out = Vec::with_capacity(list.len());
    for (i, msg) in list.iter().enumerate() {
        let role = msg
            .get("role")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidArgument(format!("messages[{i}] missing role")))?;
        let content = msg
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidArgument(format!("messages[{i}] missing content")))?;
        out.push(ChatMessage::new(role, content));
    }

    if out.is_empty() {
        return Err(Error::InvalidArgument("messages cannot be empty".into()));
    }

    Ok(out)
}

/// The raw `tools` array, passed through to prompt rendering.
pub fn tools_from_doc(d: &Doc) -> Option<&Value> {
    d.get("tools").filter(|v| {
        v.as_array().map(|a| !a.is_empty()).unwrap_or(false)
    })
}

/// Decode media bytes from the `image` field, which carries either one
/// base64 string or a list of them.
pub fn media_from_doc(d: &Doc) -> Result<Vec<Vec<u8>>> {
    let Some(image) = d.get("image") else {
        return Ok(Vec::new());
    };

    let decode = |s: &str| {
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|err| Error::InvalidArgument(format!("image is not valid base64: {err}")))
    };

    match image {
        Value::String(s) => Ok(vec![decode(s)?]),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let Some(s) = item.as_str() else {
                    return Err(Error::InvalidArgument(format!(
                        "image[{i}] is not a string"
                    )));
                };
                out.push(decode(s)?);
            }
            Ok(out)
        }
        _ => Err(Error::InvalidArgument("image is not a valid type".into())),
    }
}

fn parse_f32(name: &str, val: &Value) -> Result<f32> {
    match val {
        Value::String(s) => s
            .parse::<f32>()
            .map_err(|err| Error::InvalidArgument(format!("{name} is not valid: {err}"))),
        Value::Number(n) => n
            .as_f64()
            .map(|f| f as f32)
            .ok_or_else(|| Error::InvalidArgument(format!("{name} is not a valid number"))),
        _ => Err(Error::InvalidArgument(format!("{name} is not a valid type"))),
    }
}

fn parse_int(name: &str, val: &Value) -> Result<i64> {
    match val {
        Value::String(s) => s
            .parse::<f64>()
            .map(|f| f as i64)
            .map_err(|err| Error::InvalidArgument(format!("{name} is not valid: {err}"))),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else {
                n.as_f64()
                    .map(|f| f as i64)
                    .ok_or_else(|| Error::InvalidArgument(format!("{name} is not a valid number")))
            }
        }
        _ => Err(Error::InvalidArgument(format!("{name} is not a valid type"))),
    }
}

fn parse_bool(name: &str, val: &Value) -> Result<bool> {
    match val {
        Value::Bool(b) => Ok(*b),
        Value::String(s) if s.is_empty() => Ok(true),
        Value::String(s) => s
            .parse::<bool>()
            .map_err(|err| Error::InvalidArgument(format!("{name} is not valid: {err}"))),
        _ => Err(Error::InvalidArgument(format!("{name} is not a valid type"))),
    }
}
