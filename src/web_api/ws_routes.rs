//! Realtime endpoints: WebSocket subscriptions and the MJPEG preview.

use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Local;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::analytics;
use crate::counting::CounterStats;
use crate::realtime_hub::{HubMessage, StatsMessage, StatusMessage};
use crate::state::AppState;

/// WebSocket endpoint for real-time updates.
pub async fn ws_endpoint(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let mut subscription = state.hub.subscribe();
    let (mut sender, mut receiver) = socket.split();
    let idle_timeout = Duration::from_secs(state.config.ws_idle_timeout_sec);

    // New subscribers get one stats and one analytics message up front so
    // dashboards render without waiting for the next broadcast tick.
    let status = state.worker.status();
    let initial_stats = HubMessage::Stats(StatsMessage::new(
        CounterStats {
            in_count: status.in_count,
            out_count: status.out_count,
            active_tracks: status.active_tracks,
        },
        status.camera_status.as_str(),
        status.fps,
    ));
    if send_message(&mut sender, &initial_stats).await.is_err() {
        state.hub.unsubscribe(&subscription.id);
        return;
    }
    if let Ok(snapshot) = analytics::snapshot(&state.store, Local::now()).await {
        if send_message(&mut sender, &HubMessage::Analytics(snapshot))
            .await
            .is_err()
        {
            state.hub.unsubscribe(&subscription.id);
            return;
        }
    }

    let mut deadline = Instant::now() + idle_timeout;
    loop {
        tokio::select! {
            broadcast = subscription.receiver.recv() => match broadcast {
                Ok(message) => {
                    if send_message(&mut sender, &message).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    // This subscriber fell behind and lost its oldest
                    // messages; tell it once and continue.
                    let notice = HubMessage::Status(StatusMessage::overflow(dropped));
                    if send_message(&mut sender, &notice).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {
                    // Any client frame counts as activity.
                    deadline = Instant::now() + idle_timeout;
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                tracing::debug!(connection_id = %subscription.id, "Subscription idle timeout");
                break;
            }
        }
    }

    state.hub.unsubscribe(&subscription.id);
}

async fn send_message(
    sender: &mut (impl SinkExt<Message> + Unpin),
    message: &HubMessage,
) -> std::result::Result<(), ()> {
    let json = serde_json::to_string(message).map_err(|_| ())?;
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}

/// MJPEG preview: multipart stream of the newest annotated frame. Late or
/// slow clients always see the most recent frame, never a backlog.
pub async fn video_feed(State(state): State<AppState>) -> Response {
    let frames = state.worker.frames();

    let stream = futures::stream::unfold(frames, |mut frames| async move {
        loop {
            if frames.changed().await.is_err() {
                return None;
            }
            let jpeg = frames.borrow_and_update().clone();
            if let Some(jpeg) = jpeg {
                let mut part = Vec::with_capacity(jpeg.len() + 64);
                part.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
                part.extend_from_slice(&jpeg);
                part.extend_from_slice(b"\r\n");
                return Some((Ok::<_, std::convert::Infallible>(Bytes::from(part)), frames));
            }
        }
    });

    Response::builder()
        .header(
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )
        .body(Body::from_stream(stream))
        .expect("static response parts")
}
