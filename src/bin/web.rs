//! Hive Web 服务
//!
//! 启动: cargo run --bin hive-web --features web
//! 默认监听 127.0.0.1:8080，可用 HIVE_WEB_ADDR 覆盖

#![cfg(feature = "web")]

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;

use hive::core::{create_supervisor, Supervisor};
use hive::memory::Message;

#[derive(Clone)]
struct AppState {
    supervisor: Arc<Supervisor>,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CancelRequest {
    conversation_id: String,
}

/// POST /api/chat/stream：SSE，首个事件为 session（会话 id），之后为 chunk* 与一个 done / error。
/// 轮次在后台任务中执行，客户端断开后仍会完成并写入历史。
async fn api_chat_stream(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>, (StatusCode, String)> {
    let message = req.message.trim().to_string();
    if message.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "message is required".to_string()));
    }

    let (conversation_id, turn) = state.supervisor.submit(req.conversation_id, message);
    let session = Event::default()
        .event("session")
        .data(serde_json::json!({ "conversation_id": conversation_id }).to_string());

    let events = turn.into_stream().map(|ev| {
        let data = serde_json::to_string(&ev).unwrap_or_default();
        Ok(Event::default().event(ev.name()).data(data))
    });
    let stream = stream::once(async move { Ok(session) }).chain(events);

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    ))
}

/// GET /api/history/:id：会话完整消息
async fn api_history(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Vec<Message>>, (StatusCode, String)> {
    state
        .supervisor
        .history(&conversation_id)
        .await
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "conversation not found".to_string()))
}

/// POST /api/chat/cancel：停止该会话当前的生成
async fn api_chat_cancel(
    State(state): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> Json<serde_json::Value> {
    let cancelled = state.supervisor.cancel(&req.conversation_id).await;
    Json(serde_json::json!({ "cancelled": cancelled }))
}

/// GET /api/metrics：返回 JSON 格式的 metrics
async fn api_metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.supervisor.metrics().to_json())
}

/// GET /api/metrics/prometheus：返回 Prometheus 格式的 metrics
async fn api_metrics_prometheus(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.supervisor.metrics().to_prometheus())
}

async fn api_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "agents": state.supervisor.router().agent_ids(),
        "conversations": state.supervisor.store().len().await,
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let supervisor = create_supervisor(None).context("Failed to create supervisor")?;
    let state = AppState {
        supervisor: supervisor.clone(),
    };

    let app = Router::new()
        .route("/api/chat/stream", post(api_chat_stream))
        .route("/api/chat/cancel", post(api_chat_cancel))
        .route("/api/history/:id", get(api_history))
        .route("/api/metrics", get(api_metrics))
        .route("/api/metrics/prometheus", get(api_metrics_prometheus))
        .route("/api/health", get(api_health))
        .with_state(state);

    let addr = std::env::var("HIVE_WEB_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    tracing::info!("Hive web listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            supervisor.shutdown();
        })
        .await?;

    Ok(())
}
