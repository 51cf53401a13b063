//! Live progress over WebSocket.
//!
//! Each connection subscribes to the progress bus and forwards events as
//! JSON. Slow clients lag and lose intermediate `downloading` events;
//! terminal events get a generous send window before the client is dropped.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::progress::ProgressEvent;

use super::state::AppState;

/// Send window for terminal events before the subscriber is dropped.
const TERMINAL_SEND_WINDOW: Duration = Duration::from_secs(10);
/// Send window for droppable events.
const EVENT_SEND_WINDOW: Duration = Duration::from_secs(2);

/// `GET /ws/progress`.
pub async fn ws_progress(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    debug!("Progress subscriber connected");
    let (mut sink, mut incoming) = socket.split();
    let mut events = state.progress.subscribe();

    // Synthetic opening event summarising where things stand.
    let queue_len = state
        .store
        .queue_counts()
        .map(|counts| counts.active())
        .unwrap_or(0);
    let cache_size = state.store.cache_size().unwrap_or(0);
    if send_event(
        &mut sink,
        &ProgressEvent::status_summary(queue_len, cache_size),
    )
    .await
    .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            message = next_incoming(&mut incoming) => {
                if message.is_none() {
                    break;
                }
                // Protocol pings are answered by the stack; client text is
                // ignored.
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let window = if event.is_terminal() {
                            TERMINAL_SEND_WINDOW
                        } else {
                            EVENT_SEND_WINDOW
                        };
                        match tokio::time::timeout(window, send_event(&mut sink, &event)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) => break,
                            Err(_) => {
                                warn!("Progress subscriber too slow, dropping");
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Progress subscriber lagged, skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
    debug!("Progress subscriber disconnected");
}

/// `Some(())` while the connection is healthy, `None` once it closed.
async fn next_incoming(incoming: &mut SplitStream<WebSocket>) -> Option<()> {
    match incoming.next().await {
        None | Some(Err(_)) | Some(Ok(Message::Close(_))) => None,
        Some(Ok(_)) => Some(()),
    }
}

async fn send_event(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &ProgressEvent,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap_or_default();
    sink.send(Message::Text(text.into())).await
}
