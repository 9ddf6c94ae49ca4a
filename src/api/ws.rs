//! Live-log subscriber: one long-lived WebSocket per client, streaming one
//! job's envelopes. The session authenticates a short-lived query-param
//! token, authorizes against the job's ACL, replays the history buffer and
//! then forwards live envelopes until either side goes away.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::auth::{can_read_job, resolve_stream_token};
use crate::logbus::{Envelope, EnvelopeBody};
use crate::state::AppState;

// WebSocket close codes used by the subscriber.
pub const WS_GOING_AWAY: u16 = 1001;
pub const WS_UNSUPPORTED_DATA: u16 = 1003;
pub const WS_POLICY_VIOLATION: u16 = 1008;
pub const WS_INTERNAL_ERROR: u16 = 1011;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

pub async fn job_logs_ws(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_session(state, job_id, params.token, socket))
}

type WsSender = SplitSink<WebSocket, Message>;

async fn close_with(sender: &mut WsSender, code: u16, reason: &'static str) {
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn send_error_payload(sender: &mut WsSender, message: &str) {
    let payload = serde_json::json!({
        "type": "error",
        "payload": {"message": message},
    });
    let _ = sender.send(Message::Text(payload.to_string())).await;
}

/// True when the raw envelope is a terminal `status`; the session closes
/// 1001 after forwarding it.
fn is_terminal_status(raw: &str) -> bool {
    match serde_json::from_str::<Envelope>(raw) {
        Ok(Envelope {
            body: EnvelopeBody::Status { status, .. },
            ..
        }) => status.is_terminal(),
        _ => false,
    }
}

async fn stream_session(state: AppState, job_id: String, token: Option<String>, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // 1. Credentials: short-lived stream token from the query string.
    let user = match token {
        Some(token) => match resolve_stream_token(&state, &token).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                close_with(&mut ws_tx, WS_POLICY_VIOLATION, "Invalid authentication credentials")
                    .await;
                return;
            }
            Err(e) => {
                warn!("Stream token lookup failed for job {}: {}", job_id, e);
                close_with(&mut ws_tx, WS_INTERNAL_ERROR, "Internal error").await;
                return;
            }
        },
        None => {
            close_with(&mut ws_tx, WS_POLICY_VIOLATION, "Invalid authentication credentials").await;
            return;
        }
    };

    // 2. Job access.
    let job = match state.database.get_job(&job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            send_error_payload(&mut ws_tx, &format!("Job {} not found", job_id)).await;
            close_with(&mut ws_tx, WS_UNSUPPORTED_DATA, "Job not found").await;
            return;
        }
        Err(e) => {
            warn!("Job lookup failed for stream {}: {}", job_id, e);
            send_error_payload(&mut ws_tx, "Log streaming service temporarily unavailable.").await;
            close_with(&mut ws_tx, WS_INTERNAL_ERROR, "Internal error").await;
            return;
        }
    };
    if !can_read_job(&user, &job) {
        send_error_payload(&mut ws_tx, "Forbidden to access this job's logs").await;
        close_with(&mut ws_tx, WS_POLICY_VIOLATION, "Forbidden").await;
        return;
    }

    info!("User {} streaming logs for job {}", user.email, job_id);

    // 3. Live subscription first so nothing published after this point is
    //    lost, then hello + history replay in seq order.
    let (history, mut live_rx) = state.logbus.subscribe(&job_id);

    let hello = serde_json::json!({
        "type": "system",
        "payload": {"message": "Log streaming started.", "job_id": job_id},
    });
    if ws_tx.send(Message::Text(hello.to_string())).await.is_err() {
        return;
    }

    let mut terminal_replayed = false;
    for item in history {
        terminal_replayed = terminal_replayed || is_terminal_status(&item);
        if ws_tx.send(Message::Text(item)).await.is_err() {
            return;
        }
    }
    if terminal_replayed {
        // The job already finished; the final status envelope was part of
        // the replay.
        close_with(&mut ws_tx, WS_GOING_AWAY, "Stream ended").await;
        return;
    }

    // 4. Ingress watcher + egress forwarder until either side completes.
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                close_with(&mut ws_tx, WS_GOING_AWAY, "Server shutting down").await;
                return;
            }
            incoming = ws_rx.next() => match incoming {
                // Client payloads are keep-alives; only disconnects matter.
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    debug!("Log stream client for job {} disconnected", job_id);
                    return;
                }
                Some(Ok(_)) => {}
            },
            outgoing = live_rx.recv() => match outgoing {
                Ok(raw) => {
                    let terminal = is_terminal_status(&raw);
                    if ws_tx.send(Message::Text(raw)).await.is_err() {
                        return;
                    }
                    if terminal {
                        close_with(&mut ws_tx, WS_GOING_AWAY, "Stream ended").await;
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // At-most-once delivery: slow clients lose messages
                    // rather than stalling the publisher.
                    warn!("Log stream for job {} lagged, skipped {} envelopes", job_id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    close_with(&mut ws_tx, WS_GOING_AWAY, "Stream ended").await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::JobStatus;
    use crate::logbus::LogBus;

    #[test]
    fn terminal_status_detection() {
        let bus = LogBus::new(10);
        let publisher = bus.connect("job-1").unwrap();

        let running = publisher.publish_status(JobStatus::Running, None).unwrap();
        let raw = serde_json::to_string(&running).unwrap();
        assert!(!is_terminal_status(&raw));

        let done = publisher.publish_status(JobStatus::Succeeded, Some(0)).unwrap();
        let raw = serde_json::to_string(&done).unwrap();
        assert!(is_terminal_status(&raw));

        let log = publisher
            .publish_log(crate::logbus::LogStream::Stdout, "hi")
            .unwrap();
        let raw = serde_json::to_string(&log).unwrap();
        assert!(!is_terminal_status(&raw));

        assert!(!is_terminal_status("not json"));
    }
}
