//! HTTP transport: research as a `text/event-stream`, plus search, status and health.

use crate::research::ResearchRequest;
use crate::runtime::Runtime;
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use deepsurf_core::{Error, Event};
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type AppState = Arc<Runtime>;

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

fn error_code(e: &Error) -> (StatusCode, &'static str) {
    match e {
        Error::InvalidUrl(_) => (StatusCode::BAD_REQUEST, "invalid_url"),
        Error::InvalidArgs(_) => (StatusCode::BAD_REQUEST, "invalid_params"),
        Error::NotConfigured(_) => (StatusCode::SERVICE_UNAVAILABLE, "not_configured"),
        Error::NotSupported(_) => (StatusCode::NOT_IMPLEMENTED, "not_supported"),
        Error::Exhausted(_) => (StatusCode::SERVICE_UNAVAILABLE, "exhausted"),
        Error::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
        Error::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "cancelled"),
        _ => (StatusCode::BAD_GATEWAY, "upstream_failed"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = error_code(&self.0);
        let body = serde_json::json!({
            "ok": false,
            "error": { "code": code, "message": self.0.to_string() },
        });
        (status, Json(body)).into_response()
    }
}

pub fn router(rt: AppState) -> Router {
    Router::new()
        .route("/research", get(research))
        .route("/search", get(search))
        .route("/status", get(status))
        .route("/health", get(health))
        .with_state(rt)
}

/// Serve until Ctrl-C, then close every pooled worker.
pub async fn serve(rt: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router(rt.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    rt.shutdown().await;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ResearchParams {
    #[serde(default)]
    query: String,
    #[serde(default)]
    image: Option<String>,
}

/// Stream of SSE frames for one request. Dropping the stream (client gone) cancels the run.
fn event_body(rx: mpsc::Receiver<Event>, cancel: CancellationToken) -> Body {
    let guard = cancel.drop_guard();
    let frames = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let ev = rx.recv().await?;
        Some((Ok::<_, Infallible>(ev.to_sse()), (rx, guard)))
    });
    Body::from_stream(frames)
}

async fn research(State(rt): State<AppState>, Query(p): Query<ResearchParams>) -> Response {
    let (tx, rx) = mpsc::channel::<Event>(32);
    let cancel = CancellationToken::new();
    match rt.orchestrator() {
        Ok(orch) => {
            let orch = orch.clone();
            let req = ResearchRequest {
                query: p.query,
                image_url: p.image.filter(|s| !s.trim().is_empty()),
            };
            let token = cancel.clone();
            tokio::spawn(async move { orch.run(req, tx, token).await });
        }
        Err(e) => {
            let _ = tx.try_send(Event::error(0, 0, e.to_string()));
        }
    }
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        event_body(rx, cancel),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    query: String,
    #[serde(default)]
    images: bool,
    #[serde(default)]
    max: Option<usize>,
}

async fn search(
    State(rt): State<AppState>,
    Query(p): Query<SearchParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let query = p.query.trim();
    if query.is_empty() {
        return Err(Error::InvalidArgs("query must not be empty".to_string()).into());
    }
    if p.images {
        let max = p.max.unwrap_or(10).clamp(1, 30);
        let hits = rt.images()?.search_images(query, max).await?;
        return Ok(Json(serde_json::json!({
            "ok": true,
            "query": query,
            "images": hits,
        })));
    }
    let trace = rt
        .search()
        .search_with_trace(query, &CancellationToken::new())
        .await;
    Ok(Json(serde_json::json!({
        "ok": true,
        "query": query,
        "engine": trace.engine,
        "urls": trace.urls,
        "attempts": trace.attempts,
    })))
}

async fn status(State(rt): State<AppState>) -> Json<serde_json::Value> {
    let pool = rt.pool_status().await;
    Json(serde_json::json!({
        "ok": true,
        "primary": pool.is_some(),
        "engines": rt.search().engine_names(),
        "pool": pool,
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "name": "deepsurf",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use deepsurf_core::EventKind;
    use deepsurf_local::Config;

    async fn spawn_app() -> String {
        let cfg = Config {
            primary_enabled: false,
            secondary_engines: Vec::new(),
            ..Config::default()
        };
        let rt = Arc::new(Runtime::build(cfg).unwrap());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(rt)).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn health_and_status_report_the_runtime() {
        let base = spawn_app().await;
        let h: serde_json::Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(h["name"], "deepsurf");
        let s: serde_json::Value = reqwest::get(format!("{base}/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(s["primary"], false);
        assert!(s["pool"].is_null());
    }

    #[tokio::test]
    async fn search_without_engines_is_an_empty_success() {
        let base = spawn_app().await;
        let resp = reqwest::get(format!("{base}/search?query=rust")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let v: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(v["urls"], serde_json::json!([]));
        assert!(v["engine"].is_null());

        let bad = reqwest::get(format!("{base}/search?query=%20")).await.unwrap();
        assert_eq!(bad.status(), 400);
        let images = reqwest::get(format!("{base}/search?query=x&images=true"))
            .await
            .unwrap();
        assert_eq!(images.status(), 503);
    }

    #[tokio::test]
    async fn research_without_planner_streams_one_error_frame() {
        let base = spawn_app().await;
        let resp = reqwest::get(format!("{base}/research?query=hello")).await.unwrap();
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE.as_str()],
            "text/event-stream"
        );
        let body = resp.text().await.unwrap();
        let frames = deepsurf_core::event::split_frames(&body);
        assert_eq!(frames.len(), 1);
        let ev = Event::from_sse(frames[0]).unwrap();
        assert_eq!(ev.kind, EventKind::Error);
    }
}
