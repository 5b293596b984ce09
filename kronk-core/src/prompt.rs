//! Built-in prompt rendering.
//!
//! Full Jinja chat templating is a concern of the wrapping process; the
//! core ships the two fixed renderings its parser understands: ChatML for
//! the standard family and a harmony-style layout for the GPT family.
//!
//! Rendering is split the way the batch scheduler consumes it: a system
//! prefix decoded once under sequence id 0, and per-request turns appended
//! behind it. Per-request options (`enable_thinking`, `reasoning_effort`)
//! therefore ride in the turn text, never in the shared prefix.

use serde_json::Value;

use crate::engine::ModelFamily;
use crate::request::{ChatMessage, Params, ReasoningEffort};

/// Render a full conversation, including the system turn. Used by the
/// pooled path where each request owns the whole context.
pub fn render(
    family: ModelFamily,
    system_prompt: &str,
    messages: &[ChatMessage],
    tools: Option<&Value>,
    params: &Params,
) -> String {
    let mut out = render_system(family, system_prompt, tools, params);

    // ChatML tools already live in the system turn rendered above; the
    // GPT developer turn is the only per-turn carrier.
    let turn_tools = match family {
        ModelFamily::Standard => None,
        ModelFamily::Gpt => tools,
    };

    out.push_str(&render_turns(family, messages, turn_tools, params));
    out
}

/// Render the shared system prefix decoded once by the batch scheduler
/// under sequence id 0. Tools and the standard-family thinking switch are
/// per-request concerns and live in [`render_turns`]; only the GPT
/// reasoning line belongs here, since harmony expects it in the system
/// message (the scheduler renders it with the default effort).
pub fn render_system(
    family: ModelFamily,
    system_prompt: &str,
    tools: Option<&Value>,
    params: &Params,
) -> String {
    match family {
        ModelFamily::Standard => {
            let mut out = String::new();
            out.push_str("<|im_start|>system\n");
            out.push_str(system_prompt);

            if let Some(tools) = tools {
                push_chatml_tools(&mut out, tools);
            }

            out.push_str("<|im_end|>\n");
            out
        }

        ModelFamily::Gpt => {
            let mut out = String::new();
            out.push_str("<|start|>system<|message|>");
            out.push_str(system_prompt);
            out.push_str("\nReasoning: ");
            out.push_str(params.reasoning_effort.as_str());
            if tools.is_some() {
                out.push_str("\n# Valid channels: analysis, commentary, final. ");
                out.push_str("Calls to these tools must go to the commentary channel: 'functions'.");
            }
            out.push_str("<|end|>");
            out
        }
    }
}

/// Render the per-request turns appended after the shared system prefix.
/// Tokenized without BOS because the system prompt supplied it.
///
/// The shared prefix is fixed at scheduler start, so everything
/// request-scoped lands here: the tools block, the GPT developer turn
/// carrying a non-default reasoning effort, and the standard-family
/// `/no_think` switch on the trailing user turn.
pub fn render_turns(
    family: ModelFamily,
    messages: &[ChatMessage],
    tools: Option<&Value>,
    params: &Params,
) -> String {
    match family {
        ModelFamily::Standard => render_chatml_turns(messages, tools, params),
        ModelFamily::Gpt => render_gpt_turns(messages, tools, params),
    }
}

fn render_chatml_turns(messages: &[ChatMessage], tools: Option<&Value>, params: &Params) -> String {
    let mut out = String::new();

    if let Some(tools) = tools {
        out.push_str("<|im_start|>user\n# Tools");
        push_chatml_tools(&mut out, tools);
        out.push_str("<|im_end|>\n");
    }

    let last_user = messages.iter().rposition(|m| m.role == "user");

    for (i, msg) in messages.iter().enumerate() {
        // The system turn is owned by the scheduler; client-supplied system
        // text is folded into a user turn to keep the shared KV prefix valid.
        let role = if msg.role == "system" { "user" } else { &msg.role };
        out.push_str("<|im_start|>");
        out.push_str(role);
        out.push('\n');
        out.push_str(&msg.content);

        // The thinking soft switch rides on the final user turn.
        if !params.enable_thinking && last_user == Some(i) {
            out.push_str(" /no_think");
        }

        out.push_str("<|im_end|>\n");
    }

    out.push_str("<|im_start|>assistant\n");
    out
}

fn render_gpt_turns(messages: &[ChatMessage], tools: Option<&Value>, params: &Params) -> String {
    let mut out = String::new();

    // A developer turn carries the request-scoped pieces the shared system
    // prefix cannot: the tools listing and a non-default reasoning effort.
    let effort_override = params.reasoning_effort != ReasoningEffort::Medium;
    if tools.is_some() || effort_override {
        out.push_str("<|start|>developer<|message|>");
        if effort_override {
            out.push_str("Reasoning: ");
            out.push_str(params.reasoning_effort.as_str());
            out.push('\n');
        }
        if let Some(tools) = tools {
            out.push_str("# Tools\n\n## functions\n\n");
            out.push_str(&tools.to_string());
        }
        out.push_str("<|end|>");
    }

    for msg in messages {
        let role = if msg.role == "system" { "user" } else { &msg.role };
        out.push_str("<|start|>");
        out.push_str(role);
        out.push_str("<|message|>");
        out.push_str(&msg.content);
        out.push_str("<|end|>");
    }

    out.push_str("<|start|>assistant");
    out
}

fn push_chatml_tools(out: &mut String, tools: &Value) {
    out.push_str("\n\nYou may call one of the following functions. ");
    out.push_str("Return the call inside <tool_call></tool_call> tags as a JSON ");
    out.push_str("object with name and arguments keys.\n<tools>\n");
    out.push_str(&tools.to_string());
    out.push_str("\n</tools>");
}

/// Format a query/document pair for reranker models. BGE-style rerankers
/// expect the bare pair without prefixes.
pub fn rerank_pair(query: &str, document: &str) -> String {
    format!("{query} {document}")
}
