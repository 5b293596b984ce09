//! Token stream parser.
//!
//! Converts the raw piece stream of one generation into typed events:
//! reasoning deltas, completion deltas, and tool calls. The delimiter table
//! is selected by the model family discriminant attached at load time.
//!
//! Standard family markers:
//!   `<think>` ... `</think>`        reasoning segment
//!   `<tool_call>` ... `</tool_call>` tool-call payload (`{name, arguments}`)
//!
//! GPT family markers:
//!   `<|channel|>HEADER<|message|>`  channel switch; HEADER `analysis` is
//!   reasoning, `final` is completion, `commentary ...` opens a tool call
//!   whose function name rides in a `to=functions.<name>` header field.
//!   `<|end|>` closes a channel; the two following tokens (`<|start|>`,
//!   `assistant`) are consumed.

use serde_json::Value;

use crate::engine::ModelFamily;
use crate::response::{FinishReason, ToolCall, Usage};

/// The result of feeding one piece to the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// The piece was swallowed by the state machine.
    Consumed,
    /// Emit a delta to the client.
    Delta { text: String, reasoning: bool },
    /// A complete tool call was collected; generation must stop.
    ToolCall,
    /// The stream is malformed beyond recovery.
    Fail(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Completion,
    Reasoning,
    ToolBuffer,
    GptHeader,
    GptToolArgs,
}

/// Per-request parser state machine.
pub struct TokenParser {
    family: ModelFamily,
    mode: Mode,
    reasoning_tokens: usize,
    completion_tokens: usize,
    reasoning_emitted: bool,
    completion_emitted: bool,
    final_reasoning: String,
    final_content: String,
    tooling: String,
    gpt_header: String,
    gpt_tool_header: Option<String>,
    tool_done: bool,
    skip_remaining: u8,
}

impl TokenParser {
    pub fn new(family: ModelFamily) -> Self {
        Self {
            family,
            mode: Mode::Completion,
            reasoning_tokens: 0,
            completion_tokens: 0,
            reasoning_emitted: false,
            completion_emitted: false,
            final_reasoning: String::new(),
            final_content: String::new(),
            tooling: String::new(),
            gpt_header: String::new(),
            gpt_tool_header: None,
            tool_done: false,
            skip_remaining: 0,
        }
    }

    /// Feed one decoded piece.
    pub fn feed(&mut self, piece: &str) -> Step {
        if self.skip_remaining > 0 {
            self.skip_remaining -= 1;
            return Step::Consumed;
        }

        match self.mode {
            Mode::GptHeader => return self.feed_gpt_header(piece),
            Mode::GptToolArgs => return self.feed_gpt_tool_args(piece),
            Mode::ToolBuffer => return self.feed_tool_buffer(piece),
            Mode::Completion | Mode::Reasoning => {}
        }

        match (self.family, piece) {
            (ModelFamily::Standard, "<think>") => {
                self.mode = Mode::Reasoning;
                self.reasoning_tokens += 1;
                Step::Consumed
            }

            (ModelFamily::Standard, "</think>") => {
                self.mode = Mode::Completion;
                self.completion_tokens += 1;
                Step::Consumed
            }

            (ModelFamily::Standard, "<tool_call>") => {
                self.mode = Mode::ToolBuffer;
                Step::Consumed
            }

            (ModelFamily::Gpt, "<|channel|>") => {
                self.mode = Mode::GptHeader;
                self.gpt_header.clear();
                Step::Consumed
            }

            (ModelFamily::Gpt, "<|end|>") => {
                // The next two tokens are <|start|> and assistant.
                self.skip_remaining = 2;
                Step::Consumed
            }

            _ => self.emit(piece),
        }
    }

    fn feed_gpt_header(&mut self, piece: &str) -> Step {
        if piece != "<|message|>" {
            self.gpt_header.push_str(piece);
            return Step::Consumed;
        }

        let header = std::mem::take(&mut self.gpt_header);
        match header.as_str() {
            "analysis" => {
                self.mode = Mode::Reasoning;
                Step::Consumed
            }
            "final" => {
                self.mode = Mode::Completion;
                Step::Consumed
            }
            h if h.starts_with("commentary") => {
                self.gpt_tool_header = Some(header);
                self.mode = Mode::GptToolArgs;
                Step::Consumed
            }
            other => Step::Fail(format!("unknown channel type: {other}")),
        }
    }

    fn feed_gpt_tool_args(&mut self, piece: &str) -> Step {
        if piece == "<|end|>" {
            self.tool_done = true;
            return Step::ToolCall;
        }

        self.tooling.push_str(piece);
        Step::Consumed
    }

    fn feed_tool_buffer(&mut self, piece: &str) -> Step {
        if piece == "</tool_call>" {
            self.tool_done = true;
            return Step::ToolCall;
        }

        self.tooling.push_str(piece);
        Step::Consumed
    }

    fn emit(&mut self, piece: &str) -> Step {
        let reasoning = self.mode == Mode::Reasoning;

        // A spurious newline rides along right after a mode switch.
        if reasoning && !self.reasoning_emitted && piece == "\n" {
            return Step::Consumed;
        }
        if !reasoning && !self.completion_emitted && (piece == "\n" || piece == "\n\n") {
            return Step::Consumed;
        }

        if reasoning {
            self.reasoning_emitted = true;
            self.reasoning_tokens += 1;
            self.final_reasoning.push_str(piece);
        } else {
            self.completion_emitted = true;
            self.completion_tokens += 1;
            self.final_content.push_str(piece);
        }

        Step::Delta {
            text: piece.to_string(),
            reasoning,
        }
    }

    /// The delimiter family this parser was built for.
    pub fn family(&self) -> ModelFamily {
        self.family
    }

    /// The raw tool-call payload collected so far.
    pub fn tool_raw(&self) -> &str {
        &self.tooling
    }

    /// Whether a tool call has been fully collected.
    pub fn tool_call_pending(&self) -> bool {
        self.tool_done
            || (!self.tooling.is_empty()
                && matches!(self.mode, Mode::ToolBuffer | Mode::GptToolArgs))
    }

    /// The accumulated completion text, used for end-marker detection.
    pub fn content_tail(&self) -> &str {
        &self.final_content
    }

    pub fn reasoning_tokens(&self) -> usize {
        self.reasoning_tokens
    }

    pub fn completion_tokens(&self) -> usize {
        self.completion_tokens
    }

    /// Charge extra completion tokens (the final tool-call JSON is counted
    /// at emission time).
    pub fn add_completion_tokens(&mut self, n: usize) {
        self.completion_tokens += n;
    }

    /// Usage snapshot for the current counters.
    pub fn usage(&self, input_tokens: usize, tokens_per_second: f64) -> Usage {
        Usage {
            input_tokens,
            reasoning_tokens: self.reasoning_tokens,
            completion_tokens: self.completion_tokens,
            output_tokens: self.reasoning_tokens + self.completion_tokens,
            tokens_per_second,
        }
    }

    /// Close the stream and produce the final parts. `end_marker` trailing
    /// text is trimmed from the content when the stop came from marker
    /// detection rather than an end-of-generation token.
    pub fn finish(mut self, hit_max_tokens: bool) -> FinalParts {
        let marker = end_marker(self.family);
        if let Some(stripped) = self.final_content.strip_suffix(marker) {
            self.final_content = stripped.to_string();
        }

        let tool_call = self.build_tool_call();

        let finish_reason = if tool_call.is_some() {
            FinishReason::ToolCalls
        } else if hit_max_tokens {
            FinishReason::Length
        } else {
            FinishReason::Stop
        };

        FinalParts {
            content: self.final_content,
            reasoning: self.final_reasoning,
            tool_raw: self.tooling,
            tool_call,
            finish_reason,
        }
    }

    fn build_tool_call(&self) -> Option<ToolCall> {
        if !self.tool_call_pending() {
            return None;
        }

        match self.family {
            ModelFamily::Standard => Some(ToolCall::parse(&self.tooling)),
            ModelFamily::Gpt => {
                let header = self.gpt_tool_header.clone().unwrap_or_default();
                Some(parse_gpt_tool_call(&header, &self.tooling))
            }
        }
    }
}

/// The pieces a finished stream folds down to.
pub struct FinalParts {
    pub content: String,
    pub reasoning: String,
    pub tool_raw: String,
    pub tool_call: Option<ToolCall>,
    pub finish_reason: FinishReason,
}

/// The literal stop marker each family's chat template closes turns with.
pub fn end_marker(family: ModelFamily) -> &'static str {
    match family {
        ModelFamily::Standard => "<|im_end|>",
        ModelFamily::Gpt => "<|return|>",
    }
}

/// Build a tool call from a GPT commentary header and its argument text.
///
/// Header form: `commentary to=functions.get_weather <|constrain|>json`.
fn parse_gpt_tool_call(header: &str, args: &str) -> ToolCall {
    let args = args.trim_matches('\n');

    let mut call = ToolCall {
        id: uuid::Uuid::new_v4().to_string(),
        raw: format!("{header}<|message|>{args}"),
        ..ToolCall::default()
    };

    if args.is_empty() {
        call.status = 1;
        call.error = "response missing".to_string();
        return call;
    }

    call.name = extract_function_name(header);

    match serde_json::from_str::<Value>(args) {
        Ok(arguments) => {
            call.arguments = Some(arguments);
            call.status = 0;
        }
        Err(err) => {
            call.error = err.to_string();
            call.status = 2;
        }
    }

    call
}

/// Pull `<name>` out of the first `key=functions.<name>` field.
fn extract_function_name(header: &str) -> String {
    for field in header.split_whitespace() {
        let Some((_, after)) = field.split_once('=') else {
            continue;
        };

        let parts: Vec<&str> = after.split('.').collect();
        if parts.len() != 2 {
            return String::new();
        }

        if parts[0] == "functions" {
            return parts[1].to_string();
        }

        return String::new();
    }

    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut TokenParser, pieces: &[&str]) -> Vec<Step> {
        pieces.iter().map(|p| parser.feed(p)).collect()
    }

    fn deltas(steps: &[Step]) -> (String, String) {
        let mut content = String::new();
        let mut reasoning = String::new();
        for step in steps {
            if let Step::Delta { text, reasoning: r } = step {
                if *r {
                    reasoning.push_str(text);
                } else {
                    content.push_str(text);
                }
            }
        }
        (content, reasoning)
    }

    #[test]
    fn plain_completion_stream() {
        let mut p = TokenParser::new(ModelFamily::Standard);
        let steps = feed_all(&mut p, &["Hello", ",", " world"]);
        let (content, reasoning) = deltas(&steps);
        assert_eq!(content, "Hello, world");
        assert!(reasoning.is_empty());
        assert_eq!(p.completion_tokens(), 3);

        let parts = p.finish(false);
        assert_eq!(parts.content, "Hello, world");
        assert_eq!(parts.finish_reason, FinishReason::Stop);
        assert!(parts.tool_call.is_none());
    }

    #[test]
    fn reasoning_segment_round_trip() {
        let mut p = TokenParser::new(ModelFamily::Standard);
        let steps = feed_all(
            &mut p,
            &["<think>", "\n", "chain", " of", " thought", "</think>", "\n\n", "answer"],
        );
        let (content, reasoning) = deltas(&steps);
        assert_eq!(reasoning, "chain of thought");
        assert_eq!(content, "answer");

        // The delimiters count into their buckets; stripped newlines do not.
        assert_eq!(p.reasoning_tokens(), 4);
        assert_eq!(p.completion_tokens(), 2);

        let parts = p.finish(false);
        assert_eq!(parts.reasoning, "chain of thought");
        assert_eq!(parts.content, "answer");
    }

    #[test]
    fn reasoning_deltas_precede_completion_deltas() {
        let mut p = TokenParser::new(ModelFamily::Standard);
        let steps = feed_all(&mut p, &["<think>", "hm", "</think>", "ok"]);

        let first_delta = steps.iter().position(|s| matches!(s, Step::Delta { .. }));
        assert!(matches!(
            steps[first_delta.unwrap()],
            Step::Delta { reasoning: true, .. }
        ));
    }

    #[test]
    fn leading_newline_only_stripped_before_first_delta() {
        let mut p = TokenParser::new(ModelFamily::Standard);
        let steps = feed_all(&mut p, &["\n", "a", "\n", "b"]);
        let (content, _) = deltas(&steps);
        assert_eq!(content, "a\nb");
    }

    #[test]
    fn tool_call_collected_and_parsed() {
        let mut p = TokenParser::new(ModelFamily::Standard);
        let steps = feed_all(
            &mut p,
            &[
                "<tool_call>",
                "\n",
                r#"{"name":"get_weather","#,
                r#""arguments":{"location":"London, England"}}"#,
                "</tool_call>",
            ],
        );

        assert_eq!(*steps.last().unwrap(), Step::ToolCall);
        assert!(p.tool_call_pending());

        let parts = p.finish(false);
        assert_eq!(parts.finish_reason, FinishReason::ToolCalls);
        let call = parts.tool_call.unwrap();
        assert_eq!(call.status, 0);
        assert_eq!(call.name, "get_weather");
        assert!(call.arguments.unwrap()["location"]
            .as_str()
            .unwrap()
            .contains("London"));
    }

    #[test]
    fn tool_call_bad_json_status_2() {
        let mut p = TokenParser::new(ModelFamily::Standard);
        feed_all(&mut p, &["<tool_call>", "garbage", "</tool_call>"]);
        let parts = p.finish(false);
        let call = parts.tool_call.unwrap();
        assert_eq!(call.status, 2);
        assert_eq!(call.raw, "garbage");
    }

    #[test]
    fn tool_call_empty_payload_status_1() {
        let mut p = TokenParser::new(ModelFamily::Standard);
        feed_all(&mut p, &["<tool_call>", "\n", "</tool_call>"]);
        let parts = p.finish(false);
        let call = parts.tool_call.unwrap();
        assert_eq!(call.status, 1);
    }

    #[test]
    fn gpt_analysis_then_final() {
        let mut p = TokenParser::new(ModelFamily::Gpt);
        let steps = feed_all(
            &mut p,
            &[
                "<|channel|>", "analysis", "<|message|>", "thinking", " here",
                "<|end|>", "<|start|>", "assistant",
                "<|channel|>", "final", "<|message|>", "the", " answer",
            ],
        );

        let (content, reasoning) = deltas(&steps);
        assert_eq!(reasoning, "thinking here");
        assert_eq!(content, "the answer");
    }

    #[test]
    fn gpt_commentary_tool_call() {
        let mut p = TokenParser::new(ModelFamily::Gpt);
        let steps = feed_all(
            &mut p,
            &[
                "<|channel|>",
                "commentary to=functions.get_weather ",
                "<|constrain|>json",
                "<|message|>",
                r#"{"location":"#,
                r#""London"}"#,
                "<|end|>",
            ],
        );

        assert_eq!(*steps.last().unwrap(), Step::ToolCall);
        let parts = p.finish(false);
        let call = parts.tool_call.unwrap();
        assert_eq!(call.status, 0);
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.arguments.unwrap()["location"], "London");
    }

    #[test]
    fn gpt_unknown_channel_fails() {
        let mut p = TokenParser::new(ModelFamily::Gpt);
        let steps = feed_all(&mut p, &["<|channel|>", "mystery", "<|message|>"]);
        assert!(matches!(steps.last().unwrap(), Step::Fail(_)));
    }

    #[test]
    fn gpt_end_skips_two_tokens() {
        let mut p = TokenParser::new(ModelFamily::Gpt);
        let steps = feed_all(
            &mut p,
            &["<|channel|>", "final", "<|message|>", "hi", "<|end|>", "<|start|>", "assistant", "!"],
        );
        let (content, _) = deltas(&steps);
        assert_eq!(content, "hi!");
    }

    #[test]
    fn usage_totals_are_consistent() {
        let mut p = TokenParser::new(ModelFamily::Standard);
        feed_all(&mut p, &["<think>", "a", "</think>", "b", "c"]);
        let usage = p.usage(10, 2.0);
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(
            usage.output_tokens,
            usage.reasoning_tokens + usage.completion_tokens
        );
    }

    #[test]
    fn end_marker_trimmed_from_content() {
        let mut p = TokenParser::new(ModelFamily::Standard);
        feed_all(&mut p, &["done", "<|im_end|>"]);
        let parts = p.finish(false);
        assert_eq!(parts.content, "done");
    }

    #[test]
    fn max_tokens_finish_reason() {
        let mut p = TokenParser::new(ModelFamily::Standard);
        p.feed("text");
        let parts = p.finish(true);
        assert_eq!(parts.finish_reason, FinishReason::Length);
    }

    #[test]
    fn function_name_extraction() {
        assert_eq!(
            extract_function_name("commentary to=functions.get_weather <|constrain|>json"),
            "get_weather"
        );
        assert_eq!(extract_function_name("commentary to=browser.open"), "");
        assert_eq!(extract_function_name("commentary"), "");
    }
}
