//! Single-sequence generation for pooled instances.
//!
//! Sequential models (vision, and any model served through the instance
//! pool) own their engine for the lifetime of one request, so generation is
//! a plain decode loop feeding the token parser. Runs on a blocking thread;
//! events leave through the request's channel.

use std::time::Instant;

use tokio::sync::mpsc;
use tracing::debug;

use crate::ctx::Ctx;
use crate::engine::{Batch, Engine, Token, TokenDecoder};
use crate::error::Error;
use crate::parser::{end_marker, Step, TokenParser};
use crate::request::Params;
use crate::response::{ChatResponse, Usage};
use crate::sampler::SamplerChain;

/// One pooled generation job.
pub struct Job {
    pub id: String,
    pub prompt: String,
    pub media: Vec<Vec<u8>>,
    pub params: Params,
    pub ctx: Ctx,
}

/// Run one generation to completion, emitting deltas and exactly one
/// terminal event on `events`.
pub fn run(engine: &mut dyn Engine, job: &Job, events: &mpsc::Sender<ChatResponse>) {
    let info = engine.info();
    let model_id = info.id.clone();
    let mut parser = TokenParser::new(info.family);
    let mut sampler = SamplerChain::new(&job.params, 0);
    let mut decoder = TokenDecoder::new();

    engine.kv_clear_seq(0);

    // Prompt evaluation. Vision requests route the prompt and media
    // through the projector; text requests decode the prompt directly.
    let input_tokens = match engine.tokenize(&job.prompt, true) {
        Ok(tokens) => tokens.len(),
        Err(err) => {
            send_error(events, &job.ctx, &job.id, &model_id, &err, Usage::default());
            return;
        }
    };

    let eval = if job.media.is_empty() {
        prompt_pass(engine, &job.prompt)
    } else {
        engine.eval_media(&job.prompt, &job.media)
    };

    let mut n_past = match eval {
        Ok(consumed) => consumed,
        Err(err) => {
            send_error(events, &job.ctx, &job.id, &model_id, &err, Usage::default());
            return;
        }
    };

    let started = Instant::now();
    let mut n_decoded = 0usize;
    let mut hit_max_tokens = false;

    loop {
        if let Some(err) = job.ctx.err() {
            let usage = parser.usage(input_tokens, tokens_per_second(&parser, started));
            // Best effort only; the caller may already be gone.
            let _ = events.try_send(ChatResponse::err(&job.id, &model_id, &err, usage));
            return;
        }

        let mut logits = match engine.logits_last() {
            Ok(l) => l,
            Err(err) => {
                let usage = parser.usage(input_tokens, tokens_per_second(&parser, started));
                send_error(events, &job.ctx, &job.id, &model_id, &err, usage);
                return;
            }
        };

        let token = sampler.sample(&mut logits);
        sampler.accept(token);
        n_decoded += 1;

        if engine.is_eog(token) {
            break;
        }

        match decoder.next_token(engine, token) {
            Ok(Some(piece)) => match parser.feed(&piece) {
                Step::Consumed => {}
                Step::Delta { text, reasoning } => {
                    let usage = parser.usage(input_tokens, tokens_per_second(&parser, started));
                    if events
                        .blocking_send(ChatResponse::delta(&job.id, &model_id, &text, reasoning, usage))
                        .is_err()
                    {
                        // Receiver gone; nothing left to report to.
                        return;
                    }
                }
                Step::ToolCall => break,
                Step::Fail(msg) => {
                    let usage = parser.usage(input_tokens, tokens_per_second(&parser, started));
                    send_error(
                        events,
                        &job.ctx,
                        &job.id,
                        &model_id,
                        &Error::Internal(msg),
                        usage,
                    );
                    return;
                }
            },
            Ok(None) => {}
            Err(err) => {
                let usage = parser.usage(input_tokens, tokens_per_second(&parser, started));
                send_error(events, &job.ctx, &job.id, &model_id, &err, usage);
                return;
            }
        }

        if parser.content_tail().ends_with(end_marker(parser.family())) {
            break;
        }

        if n_decoded >= job.params.max_tokens {
            hit_max_tokens = true;
            break;
        }

        if let Err(err) = next_pass(engine, token, n_past) {
            let usage = parser.usage(input_tokens, tokens_per_second(&parser, started));
            send_error(events, &job.ctx, &job.id, &model_id, &err, usage);
            return;
        }
        n_past += 1;
    }

    // Flush residue, charge the tool-call JSON, emit the final event.
    if let Ok(Some(piece)) = decoder.flush(engine) {
        if let Step::Delta { text, reasoning } = parser.feed(&piece) {
            let usage = parser.usage(input_tokens, tokens_per_second(&parser, started));
            let _ = events.blocking_send(ChatResponse::delta(
                &job.id, &model_id, &text, reasoning, usage,
            ));
        }
    }

    if parser.tool_call_pending() && !parser.tool_raw().is_empty() {
        if let Ok(tokens) = engine.tokenize(parser.tool_raw(), false) {
            parser.add_completion_tokens(tokens.len());
        }
    }

    let usage = parser.usage(input_tokens, tokens_per_second(&parser, started));
    let parts = parser.finish(hit_max_tokens);

    let prompt_echo = if job.params.return_prompt {
        job.prompt.clone()
    } else {
        String::new()
    };

    let fin = ChatResponse::fin(
        &job.id,
        &model_id,
        parts.content,
        parts.reasoning,
        parts.tool_call,
        parts.finish_reason,
        usage,
        prompt_echo,
    );

    if events.try_send(fin.clone()).is_err() && !job.ctx.is_done() {
        let _ = events.blocking_send(fin);
    }

    debug!(n_decoded, "generation finished");
}

/// Decode the full prompt with logits enabled on the last position,
/// returning the number of positions consumed.
fn prompt_pass(engine: &mut dyn Engine, prompt: &str) -> crate::error::Result<usize> {
    let tokens = engine.tokenize(prompt, true)?;
    if tokens.is_empty() {
        return Err(Error::InvalidArgument("prompt produced no tokens".into()));
    }

    let mut batch = Batch::new();
    let mut last = 0;
    for (pos, token) in tokens.iter().enumerate() {
        last = batch.add(*token, pos, 0, false);
    }
    batch.set_logits(last, true);
    engine.decode(&batch)?;
    Ok(tokens.len())
}

/// Decode the previously sampled token at the next position.
fn next_pass(engine: &mut dyn Engine, token: Token, n_past: usize) -> crate::error::Result<()> {
    let mut batch = Batch::new();
    batch.add(token, n_past, 0, true);
    engine.decode(&batch)
}

fn tokens_per_second(parser: &TokenParser, started: Instant) -> f64 {
    let elapsed = started.elapsed().as_secs_f64();
    if elapsed <= 0.0 {
        return 0.0;
    }
    (parser.reasoning_tokens() + parser.completion_tokens()) as f64 / elapsed
}

fn send_error(
    events: &mpsc::Sender<ChatResponse>,
    ctx: &Ctx,
    id: &str,
    model_id: &str,
    err: &Error,
    usage: Usage,
) {
    let resp = ChatResponse::err(id, model_id, err, usage);
    if events.try_send(resp.clone()).is_err() && !ctx.is_done() {
        let _ = events.blocking_send(resp);
    }
}
