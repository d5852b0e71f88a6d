//! WebSocket event subscriptions.
//!
//! Clients subscribe to hub topics (`jobs`, `containers`, `security`,
//! `ha`) and receive each published event as one JSON text frame.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Query};
use axum::response::Response;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::server::app::AppState;

const KNOWN_TOPICS: [&str; 4] = ["jobs", "containers", "security", "ha"];

#[derive(Deserialize)]
pub struct WsQuery {
    /// Comma-separated topic list; defaults to every topic.
    pub channels: Option<String>,
}

pub async fn ws_handler(
    Extension(state): Extension<AppState>,
    Query(query): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let topics: Vec<String> = query
        .channels
        .as_deref()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|topic| KNOWN_TOPICS.contains(topic))
                .map(str::to_string)
                .collect()
        })
        .filter(|topics: &Vec<String>| !topics.is_empty())
        .unwrap_or_else(|| KNOWN_TOPICS.iter().map(|t| t.to_string()).collect());

    upgrade.on_upgrade(move |socket| serve(socket, state, topics))
}

async fn serve(socket: WebSocket, state: AppState, topics: Vec<String>) {
    let mut receivers = Vec::new();
    for topic in &topics {
        receivers.push(state.deps.hub.subscribe(topic).await);
    }

    let (mut sink, mut stream) = socket.split();

    // Merge every subscribed topic into one outbound task.
    let (merged_tx, mut merged_rx) = tokio::sync::mpsc::channel::<serde_json::Value>(64);
    for mut receiver in receivers {
        let tx = merged_tx.clone();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(value) => {
                        if tx.send(value).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        let _ = tx
                            .send(serde_json::json!({
                                "event": "lagged",
                                "skipped": skipped,
                            }))
                            .await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
    drop(merged_tx);

    loop {
        tokio::select! {
            outbound = merged_rx.recv() => {
                let Some(value) = outbound else { break };
                let frame = Message::Text(value.to_string());
                if futures::SinkExt::send(&mut sink, frame).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Pings are answered by axum; other client frames are
                    // ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
