use crate::daemon::fanout::FanoutHub;
use crate::daemon::pipeline::{IngestError, IngressSource, Pipeline};
use crate::daemon::snapshot;
use crate::storage::RecordStore;
use crate::util::logging::{debug, info};
use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::Stream;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use telemux_core::frame::Frame;
use tokio::net::TcpListener;

use super::{ShutdownSignal, ws};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub fanout: Arc<FanoutHub>,
    pub store: Arc<dyn RecordStore>,
    pub snapshot_bus: Arc<snapshot::SnapshotBus>,
    pub shutdown: ShutdownSignal,
}

/// `POST /data` only reports acceptance. Cycle results are never returned
/// to the submitter.
async fn submit_handler(State(state): State<AppState>, body: Bytes) -> (StatusCode, &'static str) {
    let frame = Frame::Binary(body.to_vec());
    match state.pipeline.submit(frame, IngressSource::Http).await {
        Ok(admission) => {
            debug!("http submission admitted: {:?}", admission);
            (StatusCode::OK, "OK")
        }
        Err(IngestError::NotStructured { .. }) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "body is not a structured envelope",
        ),
        Err(IngestError::Saturated { .. }) => {
            (StatusCode::SERVICE_UNAVAILABLE, "too many cycles in flight")
        }
        Err(IngestError::Closed) => (StatusCode::SERVICE_UNAVAILABLE, "shutting down"),
    }
}

async fn snapshot_handler(State(state): State<AppState>) -> Json<snapshot::Snapshot> {
    let s = state.snapshot_bus.snapshot();
    Json((*s).clone())
}

async fn stream_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    use futures_util::StreamExt;
    use tokio_stream::wrappers::WatchStream;
    let rx = state.snapshot_bus.watch_snapshot();
    let stream = WatchStream::new(rx)
        .map(|snap| {
            let data = serde_json::to_string(&*snap).unwrap_or_else(|_| "{}".into());
            Ok(Event::default().data(data))
        })
        .take_until(state.shutdown.clone().wait());
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/data", post(submit_handler))
        .route("/ws", get(ws::ws_handler))
        .route("/v1/snapshot", get(snapshot_handler))
        .route("/v1/stream", get(stream_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener
        .local_addr()
        .context("reading HTTP listener address")?;
    info!("HTTP listening on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;
    info!("HTTP server stopped");
    Ok(())
}
