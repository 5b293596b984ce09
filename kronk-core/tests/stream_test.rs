//! Streaming behavior of the batch scheduler through the Kronk handle.

mod common;

use std::time::Duration;

use serde_json::json;

use common::MockLoader;
use kronk_core::{
    ChatResponse, Ctx, Doc, Error, FinishReason, Kronk, ModelConfig, ModelFamily, Options,
};

fn chat_config(n_seq_max: usize) -> ModelConfig {
    ModelConfig {
        n_seq_max,
        context_window: 4096,
        ..ModelConfig::new("test/chat")
    }
}

fn chat_doc() -> Doc {
    json!({
        "messages": [{"role": "user", "content": "Echo back the word: Gorilla"}],
    })
    .as_object()
    .unwrap()
    .clone()
}

async fn collect(mut rx: tokio::sync::mpsc::Receiver<ChatResponse>) -> Vec<ChatResponse> {
    let mut events = Vec::new();
    while let Some(resp) = rx.recv().await {
        events.push(resp);
    }
    events
}

#[tokio::test]
async fn stream_ends_with_exactly_one_terminal_event() {
    let loader = MockLoader::new(&["The", " word", " is", " Gorilla"]);
    let kronk = Kronk::new(&loader, chat_config(1), Options::default()).unwrap();

    let ctx = Ctx::with_timeout(Duration::from_secs(10));
    let rx = kronk.chat_stream(&ctx, chat_doc()).await.unwrap();
    let events = collect(rx).await;

    let terminals = events.iter().filter(|e| e.is_final()).count();
    assert_eq!(terminals, 1);
    assert!(events.last().unwrap().is_final());

    kronk.unload(&Ctx::with_timeout(Duration::from_secs(5))).await.unwrap();
}

#[tokio::test]
async fn deltas_concatenate_to_final_content_and_reasoning() {
    let loader = MockLoader::new(&[
        "<think>", "Let", " me", " think", "</think>", "The", " word", " is", " Gorilla",
    ]);
    let kronk = Kronk::new(&loader, chat_config(1), Options::default()).unwrap();

    let ctx = Ctx::with_timeout(Duration::from_secs(10));
    let rx = kronk.chat_stream(&ctx, chat_doc()).await.unwrap();
    let events = collect(rx).await;

    let mut content = String::new();
    let mut reasoning = String::new();
    for event in &events {
        if event.is_final() {
            continue;
        }
        content.push_str(&event.choice[0].delta.content);
        reasoning.push_str(&event.choice[0].delta.reasoning);
    }

    let fin = events.last().unwrap();
    assert_eq!(fin.finish_reason(), FinishReason::Stop);
    assert_eq!(fin.choice[0].delta.content, content);
    assert_eq!(fin.choice[0].delta.reasoning, reasoning);
    assert_eq!(fin.choice[0].delta.content, "The word is Gorilla");
    assert_eq!(fin.choice[0].delta.reasoning, "Let me think");

    // Reasoning deltas come before any completion delta.
    let first_completion = events
        .iter()
        .position(|e| !e.is_final() && !e.choice[0].delta.content.is_empty());
    let first_reasoning = events
        .iter()
        .position(|e| !e.is_final() && !e.choice[0].delta.reasoning.is_empty());
    assert!(first_reasoning.unwrap() < first_completion.unwrap());

    let usage = fin.usage;
    assert!(usage.output_tokens > 0);
    assert!(usage.reasoning_tokens > 0);
    assert_eq!(
        usage.output_tokens,
        usage.reasoning_tokens + usage.completion_tokens
    );
    assert!(usage.input_tokens > 0);
}

#[tokio::test]
async fn gpt_family_streams_through_channel_markers() {
    let mut loader = MockLoader::new(&[
        "<|channel|>", "analysis", "<|message|>", "thinking", " hard",
        "<|end|>", "<|start|>", "assistant",
        "<|channel|>", "final", "<|message|>", "the", " answer",
    ]);
    loader.family = ModelFamily::Gpt;

    let cfg = ModelConfig {
        n_seq_max: 1,
        context_window: 4096,
        ..ModelConfig::new("test/gpt-oss")
    };
    let kronk = Kronk::new(&loader, cfg, Options::default()).unwrap();

    let ctx = Ctx::with_timeout(Duration::from_secs(10));
    let mut doc = chat_doc();
    doc.insert("reasoning_effort".into(), serde_json::json!("high"));

    let fin = kronk.chat(&ctx, doc).await.unwrap();
    assert_eq!(fin.finish_reason(), FinishReason::Stop);
    assert_eq!(fin.choice[0].delta.reasoning, "thinking hard");
    assert_eq!(fin.choice[0].delta.content, "the answer");
    assert!(fin.usage.reasoning_tokens > 0);
}

#[tokio::test]
async fn tool_call_is_extracted() {
    let loader = MockLoader::new(&[
        "<tool_call>",
        "\n",
        r#"{"name":"get_weather","#,
        r#""arguments":{"location":"London, England"}}"#,
        "</tool_call>",
    ]);
    let kronk = Kronk::new(&loader, chat_config(1), Options::default()).unwrap();

    let ctx = Ctx::with_timeout(Duration::from_secs(10));
    let doc = json!({
        "messages": [{"role": "user", "content": "What is the weather like in London, England?"}],
        "tools": [{
            "type": "function",
            "function": {
                "name": "get_weather",
                "parameters": {"location": {"type": "string"}},
            },
        }],
    })
    .as_object()
    .unwrap()
    .clone();

    let fin = kronk.chat(&ctx, doc).await.unwrap();
    assert_eq!(fin.finish_reason(), FinishReason::ToolCalls);

    let calls = fin.choice[0].delta.tool_calls.as_ref().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, "get_weather");
    assert_eq!(calls[0].status, 0);
    assert!(calls[0].arguments.as_ref().unwrap()["location"]
        .as_str()
        .unwrap()
        .contains("London"));
    assert!(fin.usage.completion_tokens > 0);
}

#[tokio::test]
async fn cancel_before_stream_loop_yields_terminal_error() {
    let loader = MockLoader::new(&["a", "b", "c"]).with_delay(Duration::from_millis(5));
    let kronk = Kronk::new(&loader, chat_config(1), Options::default()).unwrap();

    let ctx = Ctx::with_timeout(Duration::from_secs(10));
    let rx = kronk.chat_stream(&ctx, chat_doc()).await.unwrap();
    ctx.cancel();

    let events = collect(rx).await;
    let last = events.last().unwrap();
    assert_eq!(last.finish_reason(), FinishReason::Error);
    assert!(last.choice[0].delta.content.contains("canceled"));
}

#[tokio::test]
async fn cancel_mid_stream_stops_deltas() {
    let loader = MockLoader::new(&[
        "one", " two", " three", " four", " five", " six", " seven", " eight",
    ])
    .with_delay(Duration::from_millis(10));
    let kronk = Kronk::new(&loader, chat_config(1), Options::default()).unwrap();

    let ctx = Ctx::with_timeout(Duration::from_secs(10));
    let mut rx = kronk.chat_stream(&ctx, chat_doc()).await.unwrap();

    let mut deltas = 0;
    let mut saw_terminal_error = false;

    while let Some(event) = rx.recv().await {
        if event.is_final() {
            saw_terminal_error = event.finish_reason() == FinishReason::Error;
            break;
        }

        deltas += 1;
        if deltas == 2 {
            ctx.cancel();
        }
    }

    assert!(saw_terminal_error);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn streaming_requires_a_deadline() {
    let loader = MockLoader::new(&["x"]);
    let kronk = Kronk::new(&loader, chat_config(1), Options::default()).unwrap();

    let err = kronk
        .chat_stream(&Ctx::background(), chat_doc())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_argument");
}

#[tokio::test]
async fn max_tokens_finishes_with_length() {
    let loader = MockLoader::new(&["a", "b", "c", "d", "e", "f", "g", "h"]);
    let kronk = Kronk::new(&loader, chat_config(1), Options::default()).unwrap();

    let ctx = Ctx::with_timeout(Duration::from_secs(10));
    let mut doc = chat_doc();
    doc.insert("max_tokens".into(), json!(2));

    let fin = kronk.chat(&ctx, doc).await.unwrap();
    assert_eq!(fin.finish_reason(), FinishReason::Length);
    assert!(fin.usage.output_tokens < 8);
}

#[tokio::test]
async fn concurrent_streams_do_not_interleave_content() {
    let script = ["The", " quick", " brown", " fox", " jumps"];
    let loader = MockLoader::new(&script).with_delay(Duration::from_millis(2));
    let kronk = std::sync::Arc::new(
        Kronk::new(&loader, chat_config(3), Options::default()).unwrap(),
    );

    let mut handles = Vec::new();
    for _ in 0..3 {
        let kronk = kronk.clone();
        handles.push(tokio::spawn(async move {
            let ctx = Ctx::with_timeout(Duration::from_secs(10));
            kronk.chat(&ctx, chat_doc()).await
        }));
    }

    for handle in handles {
        let fin = handle.await.unwrap().unwrap();
        assert_eq!(fin.finish_reason(), FinishReason::Stop);
        assert_eq!(fin.choice[0].delta.content, "The quick brown fox jumps");
    }
}

#[tokio::test]
async fn decode_failures_fail_the_slot_after_retries() {
    let loader = MockLoader::new(&["a", "b", "c"]);
    loader
        .fail_decodes
        .store(10, std::sync::atomic::Ordering::SeqCst);

    // The system prompt decode also fails, so the scheduler never comes
    // up; submissions must surface unavailability rather than hang.
    let kronk = Kronk::new(&loader, chat_config(1), Options::default()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let ctx = Ctx::with_timeout(Duration::from_secs(2));
    let result = kronk.chat(&ctx, chat_doc()).await;
    match result {
        Err(err) => assert_eq!(err.kind(), "unavailable"),
        Ok(resp) => assert_eq!(resp.finish_reason(), FinishReason::Error),
    }
}

#[tokio::test]
async fn return_prompt_echoes_the_rendered_prompt() {
    let loader = MockLoader::new(&["ok"]);
    let kronk = Kronk::new(&loader, chat_config(1), Options::default()).unwrap();

    let ctx = Ctx::with_timeout(Duration::from_secs(10));
    let mut doc = chat_doc();
    doc.insert("return_prompt".into(), json!(true));

    let fin = kronk.chat(&ctx, doc).await.unwrap();
    assert!(fin.prompt.contains("Gorilla"));
}

#[tokio::test]
async fn strict_options_reject_unknown_keys() {
    let loader = MockLoader::new(&["ok"]);
    let opts = Options {
        strict_options: true,
        ..Options::default()
    };
    let kronk = Kronk::new(&loader, chat_config(1), opts).unwrap();

    let ctx = Ctx::with_timeout(Duration::from_secs(10));
    let mut doc = chat_doc();
    doc.insert("temperatur".into(), json!(0.5));

    let err = kronk.chat(&ctx, doc).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}
