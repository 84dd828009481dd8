use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::AppState;

/// GET /ws/{id}
///
/// Upgrade and relay the job's bus events until a terminal event or client
/// disconnect.
pub async fn ws_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, job_id, socket))
}

async fn handle_socket(state: AppState, job_id: String, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();

    let connected = json!({
        "type": "connected",
        "job_id": job_id,
        "timestamp": chrono::Utc::now(),
    });
    if sender
        .send(Message::Text(connected.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    let Some(bus) = state.bus.clone() else {
        let unavailable = json!({
            "type": "error",
            "job_id": job_id,
            "error": "Event bus unavailable",
            "timestamp": chrono::Utc::now(),
        });
        let _ = sender
            .send(Message::Text(unavailable.to_string().into()))
            .await;
        return;
    };

    let stop = CancellationToken::new();
    let mut events = bus.subscribe(&job_id, stop.clone());

    // Reader task: the client never sends meaningful frames; reads exist to
    // detect disconnect and flip the stop signal.
    let reader_stop = stop.clone();
    let reader = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
        reader_stop.cancel();
    });

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                let terminal = event.event_type.is_terminal();
                let payload = match serde_json::to_string(&event) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::error!(job_id = %job_id, error = %e, "Event serialization failed");
                        continue;
                    }
                };
                if sender.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
                if terminal {
                    break;
                }
            }
        }
    }

    stop.cancel();
    reader.abort();
    let _ = sender.close().await;
    tracing::debug!(job_id = %job_id, "WebSocket subscriber closed");
}
