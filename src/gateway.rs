//! Viewer gateway: WebSocket attach/detach and input relay.
//!
//! One route, `GET /ws`. Each upgraded socket becomes a viewer: an outbound
//! pump forwards its bounded frame queue to the wire, and the inbound half
//! relays keystrokes and resizes into the shared shell. Deregistration is
//! idempotent and runs on every exit path, so the fan-out never keeps a
//! dead viewer.

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};

use crate::bus::{ClientFrame, ServerFrame};
use crate::orchestrator::Orchestrator;

/// Build the viewer-facing router.
pub fn router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(orchestrator)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(orchestrator): State<Orchestrator>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, orchestrator))
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).unwrap_or_default();
    sink.send(Message::Text(json.into())).await
}

async fn handle_socket(socket: WebSocket, orchestrator: Orchestrator) {
    let viewers = orchestrator.viewers();
    let (viewer_id, mut frames) = viewers.register().await;
    let (mut sink, mut stream) = socket.split();

    let connected = orchestrator.terminal_status().await.connected;
    if send_frame(&mut sink, &ServerFrame::Status { connected })
        .await
        .is_err()
    {
        viewers.deregister(viewer_id).await;
        return;
    }

    // Outbound pump: bounded queue to wire. Ends when the queue closes
    // (session teardown or lag disconnect) or the socket write fails.
    let mut pump = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if send_frame(&mut sink, &frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            _ = &mut pump => break,
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientFrame>(text.as_str()) {
                        Ok(ClientFrame::Input { data }) => {
                            if let Err(e) = orchestrator.viewer_input(&data).await {
                                tracing::debug!(viewer = %viewer_id, error = %e, "input dropped");
                            }
                        }
                        Ok(ClientFrame::Resize { cols, rows }) => {
                            if let Err(e) = orchestrator.viewer_resize(cols, rows).await {
                                tracing::debug!(viewer = %viewer_id, error = %e, "resize dropped");
                            }
                        }
                        Err(e) => {
                            tracing::debug!(viewer = %viewer_id, error = %e, "unparseable frame");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(viewer = %viewer_id, error = %e, "socket read error");
                    break;
                }
            }
        }
    }

    viewers.deregister(viewer_id).await;
    pump.abort();
}
