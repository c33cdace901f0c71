//! `GET /ws`: one subscriber per connection.
//!
//! The subscriber is registered before the replay is read, so live
//! broadcasts produced while the replay is in flight wait in its queue and
//! are sent after it. Records the replay already carried are skipped.

use crate::daemon::fanout::{
    Outbound, ReplayWatermark, Subscription, SubscriberId, replay_messages,
};
use crate::util::logging::{debug, warn};
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use telemux_core::error::DeliveryError;

use super::http::AppState;

pub(super) async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, state))
}

async fn run_session(socket: WebSocket, state: AppState) {
    let subscription = state.fanout.subscribe();
    let id = subscription.id();
    let (sink, stream) = socket.split();

    let outcome = tokio::select! {
        res = write_loop(sink, subscription, &state) => res,
        res = read_loop(stream, id, &state) => res,
        _ = state.shutdown.clone().wait() => Ok(()),
    };

    state.fanout.unsubscribe(id, outcome.as_ref().err());
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut subscription: Subscription,
    state: &AppState,
) -> Result<(), DeliveryError> {
    let id = subscription.id();
    let config = state.fanout.config();

    let replay = match replay_messages(state.store.as_ref(), config.replay_limit).await {
        Ok(messages) => messages,
        Err(err) => {
            warn!("subscriber {}: replay unavailable: {:#}", id, err);
            Vec::new()
        }
    };
    debug!("subscriber {}: replaying {} records", id, replay.len());
    let watermark = ReplayWatermark::from_replay(&replay);
    for message in replay {
        send(&mut sink, message, config.send_timeout).await?;
    }

    while let Some(message) = subscription.recv().await {
        let Some(message) = watermark.filter(message) else {
            debug!("subscriber {}: live records already replayed", id);
            continue;
        };
        send(&mut sink, message, config.send_timeout).await?;
    }
    // The hub already removed us (queue overflow); just close.
    let _ = tokio::time::timeout(config.send_timeout, sink.close()).await;
    Ok(())
}

async fn send(
    sink: &mut SplitSink<WebSocket, Message>,
    message: Outbound,
    limit: Duration,
) -> Result<(), DeliveryError> {
    let frame = match message {
        Outbound::Text(text) | Outbound::Records { text, .. } => Message::Text(text.to_string()),
        Outbound::Binary(data) => Message::Binary(data.to_vec()),
    };
    match tokio::time::timeout(limit, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(DeliveryError::Transport(err.to_string())),
        Err(_) => Err(DeliveryError::TimedOut {
            after_ms: limit.as_millis() as u64,
        }),
    }
}

/// Client messages are opaque: relayed unchanged to every other subscriber.
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    id: SubscriberId,
    state: &AppState,
) -> Result<(), DeliveryError> {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                state.fanout.relay(id, Outbound::Text(Arc::from(text)));
            }
            Ok(Message::Binary(data)) => {
                state.fanout.relay(id, Outbound::Binary(Arc::from(data)));
            }
            Ok(Message::Close(_)) => return Ok(()),
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(err) => return Err(DeliveryError::Transport(err.to_string())),
        }
    }
    Ok(())
}
