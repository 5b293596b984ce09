//! OpenAI-compatible HTTP front end for the kronk inference core.
//!
//! Transport only: routing, request decoding, SSE bridging and status
//! mapping. All inference semantics live in `kronk-core`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, Level};

use kronk_core::{CandleLoader, Ctx, Doc, Error, Manager, ManagerConfig, ModelConfig};

/// Default deadline applied to every request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone)]
struct AppState {
    manager: Arc<Manager>,
}

struct ServerError(Error);

impl From<Error> for ServerError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Canceled | Error::DeadlineExceeded => StatusCode::REQUEST_TIMEOUT,
            Error::Unavailable(_) | Error::Busy { .. } | Error::AlreadyUnloaded => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": {
                "message": self.0.to_string(),
                "type": self.0.kind(),
            }
        }));

        (status, body).into_response()
    }
}

fn model_id(doc: &Doc) -> Result<String, Error> {
    doc.get("model")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidArgument("model is required".into()))
}

async fn chat_completions(
    State(state): State<AppState>,
    Json(doc): Json<Doc>,
) -> Result<Response, ServerError> {
    let model = model_id(&doc)?;
    let stream = doc
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let ctx = Ctx::with_timeout(REQUEST_TIMEOUT);
    let kronk = state.manager.acquire(&ctx, &model).await?;

    if !stream {
        let resp = kronk.chat(&ctx, doc).await?;
        return Ok(Json(resp).into_response());
    }

    let events = kronk.chat_stream(&ctx, doc).await?;
    let sse = ReceiverStream::new(events)
        .map(|resp| Event::default().json_data(&resp))
        .chain(futures_util::stream::once(async {
            Ok::<_, axum::Error>(Event::default().data("[DONE]"))
        }));

    Ok(Sse::new(sse).keep_alive(KeepAlive::default()).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmbeddingInput {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct EmbeddingRequest {
    model: String,
    input: EmbeddingInput,
}

async fn embeddings(
    State(state): State<AppState>,
    Json(req): Json<EmbeddingRequest>,
) -> Result<Response, ServerError> {
    let inputs = match req.input {
        EmbeddingInput::One(text) => vec![text],
        EmbeddingInput::Many(texts) => texts,
    };

    let ctx = Ctx::with_timeout(REQUEST_TIMEOUT);
    let kronk = state.manager.acquire(&ctx, &req.model).await?;
    let resp = kronk.embed(&ctx, inputs).await?;

    Ok(Json(resp).into_response())
}

async fn rerank(
    State(state): State<AppState>,
    Json(doc): Json<Doc>,
) -> Result<Response, ServerError> {
    let model = model_id(&doc)?;

    let ctx = Ctx::with_timeout(REQUEST_TIMEOUT);
    let kronk = state.manager.acquire(&ctx, &model).await?;
    let resp = kronk.rerank(&ctx, doc).await?;

    Ok(Json(resp).into_response())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "models_resident": state.manager.len(),
    }))
}

async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let data: Vec<serde_json::Value> = state
        .manager
        .model_infos()
        .into_iter()
        .map(|info| {
            json!({
                "id": info.id,
                "object": "model",
                "owned_by": "kronk",
                "family": info.family,
                "embed": info.is_embed,
                "rerank": info.is_rerank,
                "vision": info.is_vision,
                "context_window": info.n_ctx,
            })
        })
        .collect();

    Json(json!({"object": "list", "data": data}))
}

fn env_usize(key: &str, def: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(def)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let device = std::env::var("KRONK_DEVICE").unwrap_or_default();
    let context_window = env_usize("KRONK_CONTEXT_WINDOW", 0);
    let n_seq_max = env_usize("KRONK_NSEQ", 4);

    let manager_cfg = ManagerConfig {
        max_models: env_usize("KRONK_MAX_MODELS", 3),
        ttl: Duration::from_secs(env_usize("KRONK_TTL_SECS", 300) as u64),
        ..ManagerConfig::default()
    };

    // Any hub model id resolves; capability flags ride on the id prefix
    // convention used by embedding and reranker checkpoints.
    let resolver = move |model_id: &str| -> kronk_core::Result<ModelConfig> {
        let lower = model_id.to_lowercase();
        Ok(ModelConfig {
            context_window,
            n_seq_max,
            embeddings: lower.contains("embed"),
            rerank: lower.contains("rerank"),
            device: device.clone(),
            ..ModelConfig::new(model_id)
        })
    };

    let manager = Manager::new(manager_cfg, Arc::new(CandleLoader), Arc::new(resolver));

    let state = AppState {
        manager: manager.clone(),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/rerank", post(rerank))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state);

    let port = env_usize("KRONK_PORT", 8080);
    let addr = format!("0.0.0.0:{port}");
    info!(%addr, "starting server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    manager
        .shutdown(&Ctx::with_timeout(Duration::from_secs(45)))
        .await
        .ok();

    Ok(())
}
