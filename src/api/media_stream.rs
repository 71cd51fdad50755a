//! Telephony media stream WebSocket

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::ApiState;
use crate::session::CallSession;
use crate::telephony::{BridgeEvent, OutboundEvent, StartMeta};

/// Build media stream router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/connection", get(ws_upgrade))
        .with_state(state)
}

async fn ws_upgrade(State(state): State<Arc<ApiState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Run one call over an accepted media stream
async fn handle_socket(socket: WebSocket, state: Arc<ApiState>) {
    let (mut sender, mut receiver) = socket.split();
    let capacity = state.config.playback.mailbox_capacity.max(1);

    let Some(start) = await_start(&mut receiver).await else {
        tracing::info!("media stream closed before start");
        return;
    };

    // Forward outbound events to the bridge
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundEvent>(capacity);
    let send_task = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let frame = match event.to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode outbound event");
                    continue;
                }
            };
            if sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    // Parse inbound frames for the session
    let (bridge_tx, bridge_rx) = mpsc::channel::<BridgeEvent>(capacity);
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match BridgeEvent::parse(&text) {
                    Ok(event) => {
                        if bridge_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "dropping malformed bridge frame"),
                },
                Message::Close(_) => {
                    tracing::debug!("media stream closed by bridge");
                    break;
                }
                _ => {}
            }
        }
    });

    let (session, inbox) = CallSession::start(
        start,
        bridge_rx,
        outbound_tx,
        state.services.clone(),
        Arc::clone(&state.config),
        Arc::clone(&state.registry),
    )
    .await;
    let call_id = session.call_id().to_string();

    session.run(inbox).await;

    recv_task.abort();
    if let Err(e) = send_task.await
        && !e.is_cancelled()
    {
        tracing::warn!(call_id = %call_id, error = %e, "media stream writer failed");
    }

    tracing::info!(call_id = %call_id, "media stream disconnected");
}

/// Read frames until the bridge announces the stream
async fn await_start(receiver: &mut SplitStream<WebSocket>) -> Option<StartMeta> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match BridgeEvent::parse(&text) {
                Ok(BridgeEvent::Start { start }) => return Some(start),
                Ok(BridgeEvent::Stop) => return None,
                Ok(_) => tracing::trace!("ignoring frame before start"),
                Err(e) => tracing::warn!(error = %e, "dropping malformed bridge frame"),
            },
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}
