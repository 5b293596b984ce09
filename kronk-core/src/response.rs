//! Response documents produced by the core.
//!
//! Shapes follow the OpenAI-compatible wire format: streaming chat chunks
//! culminating in one final response with populated usage, list-shaped
//! rerank and embedding responses.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::Error;

/// Object tags carried in the `object` field.
pub const OBJECT_CHAT: &str = "chat.completion";
pub const OBJECT_CHAT_CHUNK: &str = "chat.completion.chunk";
pub const OBJECT_LIST: &str = "list";
pub const OBJECT_EMBEDDING: &str = "embedding";

/// Why a generation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Error,
    /// Delta events carry no finish reason.
    #[serde(rename = "")]
    None,
}

/// Token usage for one request. Counts are monotonically non-decreasing
/// across a request's events; `output_tokens` is always the sum of the
/// reasoning and completion buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Usage {
    pub input_tokens: usize,
    pub reasoning_tokens: usize,
    pub completion_tokens: usize,
    pub output_tokens: usize,
    pub tokens_per_second: f64,
}

/// A structured tool call extracted from the stream.
///
/// `status` 0 means the payload parsed cleanly, 1 means the model produced
/// no payload, 2 means the payload was not valid JSON (`raw` preserves it
/// for debugging).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub raw: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub status: u8,
}

impl ToolCall {
    /// Parse a tool-call payload collected between delimiters. The id is a
    /// fresh UUID the caller can use to reference this call later.
    pub fn parse(content: &str) -> Self {
        let content = content.trim_matches('\n');

        let mut call = ToolCall {
            id: uuid::Uuid::new_v4().to_string(),
            raw: content.to_string(),
            ..ToolCall::default()
        };

        if content.is_empty() {
            call.status = 1;
            call.error = "response missing".to_string();
            return call;
        }

        #[derive(serde::Deserialize)]
        struct Payload {
            name: String,
            #[serde(default)]
            arguments: Option<serde_json::Value>,
        }

        match serde_json::from_str::<Payload>(content) {
            Ok(payload) => {
                call.name = payload.name;
                call.arguments = payload.arguments;
                call.status = 0;
            }
            Err(err) => {
                call.error = err.to_string();
                call.status = 2;
            }
        }

        call
    }
}

/// Incremental message content for one chunk.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Delta {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reasoning: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Choice {
    pub index: usize,
    pub delta: Delta,
    pub finish_reason: FinishReason,
}

/// One event of a chat stream. The final event of a well-formed stream is
/// either a `finish_reason: stop|length|tool_calls` response with usage or
/// an `error` response.
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choice: Vec<Choice>,
    pub usage: Usage,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub prompt: String,
}

impl ChatResponse {
    /// A delta chunk carrying reasoning or completion text.
    pub fn delta(
        id: &str,
        model: &str,
        content: &str,
        reasoning: bool,
        usage: Usage,
    ) -> Self {
        let delta = if reasoning {
            Delta {
                role: "assistant".to_string(),
                reasoning: content.to_string(),
                ..Delta::default()
            }
        } else {
            Delta {
                role: "assistant".to_string(),
                content: content.to_string(),
                ..Delta::default()
            }
        };

        Self {
            id: id.to_string(),
            object: OBJECT_CHAT_CHUNK.to_string(),
            created: unix_seconds(),
            model: model.to_string(),
            choice: vec![Choice {
                index: 0,
                delta,
                finish_reason: FinishReason::None,
            }],
            usage,
            prompt: String::new(),
        }
    }

    /// The final response carrying the concatenated content, reasoning,
    /// optional tool call, and cumulative usage.
    #[allow(clippy::too_many_arguments)]
    pub fn fin(
        id: &str,
        model: &str,
        content: String,
        reasoning: String,
        tool_call: Option<ToolCall>,
        finish_reason: FinishReason,
        usage: Usage,
        prompt: String,
    ) -> Self {
        let delta = Delta {
            role: "assistant".to_string(),
            content,
            reasoning,
            tool_calls: tool_call.map(|tc| vec![tc]),
        };

        Self {
            id: id.to_string(),
            object: OBJECT_CHAT.to_string(),
            created: unix_seconds(),
            model: model.to_string(),
            choice: vec![Choice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
            prompt,
        }
    }

    /// A terminal error response. Partial progress already streamed to the
    /// caller stays valid; this is always the last event.
    pub fn err(id: &str, model: &str, err: &Error, usage: Usage) -> Self {
        Self {
            id: id.to_string(),
            object: OBJECT_CHAT.to_string(),
            created: unix_seconds(),
            model: model.to_string(),
            choice: vec![Choice {
                index: 0,
                delta: Delta {
                    role: "assistant".to_string(),
                    content: err.to_string(),
                    ..Delta::default()
                },
                finish_reason: FinishReason::Error,
            }],
            usage,
            prompt: String::new(),
        }
    }

    /// Whether this is a terminal event.
    pub fn is_final(&self) -> bool {
        self.choice
            .first()
            .map(|c| c.finish_reason != FinishReason::None)
            .unwrap_or(false)
    }

    pub fn finish_reason(&self) -> FinishReason {
        self.choice
            .first()
            .map(|c| c.finish_reason)
            .unwrap_or(FinishReason::None)
    }
}

/// One reranked document.
#[derive(Debug, Clone, Serialize)]
pub struct RerankResult {
    pub index: usize,
    pub relevance_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RerankUsage {
    pub prompt_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RerankResponse {
    pub object: String,
    pub model: String,
    pub created: u64,
    pub data: Vec<RerankResult>,
    pub usage: RerankUsage,
}

impl RerankResponse {
    pub fn new(model: &str, data: Vec<RerankResult>, usage: RerankUsage) -> Self {
        Self {
            object: OBJECT_LIST.to_string(),
            model: model.to_string(),
            created: unix_millis(),
            data,
            usage,
        }
    }
}

/// One embedding vector, positioned to match its input text.
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingData {
    pub index: usize,
    pub object: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingResponse {
    pub object: String,
    pub model: String,
    pub created: u64,
    pub data: Vec<EmbeddingData>,
    pub usage: RerankUsage,
}

impl EmbeddingResponse {
    pub fn new(model: &str, vectors: Vec<Vec<f32>>, prompt_tokens: usize) -> Self {
        let data = vectors
            .into_iter()
            .enumerate()
            .map(|(index, embedding)| EmbeddingData {
                index,
                object: OBJECT_EMBEDDING.to_string(),
                embedding,
            })
            .collect();

        Self {
            object: OBJECT_LIST.to_string(),
            model: model.to_string(),
            created: unix_seconds(),
            data,
            usage: RerankUsage {
                prompt_tokens,
                total_tokens: prompt_tokens,
            },
        }
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_parses_clean_payload() {
        let call = ToolCall::parse(r#"{"name":"get_weather","arguments":{"location":"London"}}"#);
        assert_eq!(call.status, 0);
        assert_eq!(call.name, "get_weather");
        assert_eq!(
            call.arguments.unwrap()["location"],
            serde_json::json!("London")
        );
        assert!(!call.id.is_empty());
    }

    #[test]
    fn tool_call_missing_payload() {
        let call = ToolCall::parse("\n\n");
        assert_eq!(call.status, 1);
        assert_eq!(call.error, "response missing");
    }

    #[test]
    fn tool_call_bad_json_keeps_raw() {
        let call = ToolCall::parse("{not json");
        assert_eq!(call.status, 2);
        assert_eq!(call.raw, "{not json");
        assert!(!call.error.is_empty());
    }

    #[test]
    fn delta_routes_reasoning_and_content() {
        let usage = Usage::default();
        let d = ChatResponse::delta("id", "m", "thinking", true, usage);
        assert_eq!(d.choice[0].delta.reasoning, "thinking");
        assert!(d.choice[0].delta.content.is_empty());
        assert!(!d.is_final());

        let d = ChatResponse::delta("id", "m", "answer", false, usage);
        assert_eq!(d.choice[0].delta.content, "answer");
        assert!(d.choice[0].delta.reasoning.is_empty());
    }

    #[test]
    fn final_and_error_are_terminal() {
        let fin = ChatResponse::fin(
            "id",
            "m",
            "text".into(),
            String::new(),
            None,
            FinishReason::Stop,
            Usage::default(),
            String::new(),
        );
        assert!(fin.is_final());
        assert_eq!(fin.finish_reason(), FinishReason::Stop);

        let err = ChatResponse::err("id", "m", &Error::Canceled, Usage::default());
        assert!(err.is_final());
        assert_eq!(err.finish_reason(), FinishReason::Error);
    }

    #[test]
    fn finish_reason_serializes_snake_case() {
        let v = serde_json::to_value(FinishReason::ToolCalls).unwrap();
        assert_eq!(v, serde_json::json!("tool_calls"));
        let v = serde_json::to_value(FinishReason::None).unwrap();
        assert_eq!(v, serde_json::json!(""));
    }
}
