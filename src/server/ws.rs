//! Live checkpoint and sequence events over `/ws`.

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use editorial_common::CheckpointType;

use super::api::SharedState;
use crate::orchestrator::CheckpointStatus;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    // Checkpoint lifecycle
    CheckpointCreated {
        checkpoint_id: String,
        checkpoint_type: CheckpointType,
        status: CheckpointStatus,
    },
    CheckpointUpdated {
        checkpoint_id: String,
        status: CheckpointStatus,
        error_message: Option<String>,
    },

    // Sequence lifecycle
    SequenceStarted {
        flow_id: String,
    },
    SequenceStepStarted {
        flow_id: String,
        step: String,
    },
    SequenceStepCompleted {
        flow_id: String,
        step: String,
        skipped: bool,
        rule_count: Option<usize>,
    },
    SequenceCompleted {
        flow_id: String,
    },
    SequenceFailed {
        flow_id: String,
        reason: String,
    },
}

impl WsMessage {
    /// The checkpoint or sequence this event is about.
    pub fn subject(&self) -> Subject<'_> {
        match self {
            Self::CheckpointCreated { checkpoint_id, .. }
            | Self::CheckpointUpdated { checkpoint_id, .. } => {
                Subject::Checkpoint(checkpoint_id)
            }
            Self::SequenceStarted { flow_id }
            | Self::SequenceStepStarted { flow_id, .. }
            | Self::SequenceStepCompleted { flow_id, .. }
            | Self::SequenceCompleted { flow_id }
            | Self::SequenceFailed { flow_id, .. } => Subject::Flow(flow_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject<'a> {
    Checkpoint(&'a str),
    Flow(&'a str),
}

/// Which events a client wants. Empty means everything. Given as query
/// parameters on `/ws`, or sent later as a JSON text frame to re-scope the
/// connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Subscription {
    #[serde(default)]
    pub flow_id: Option<String>,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
}

impl Subscription {
    pub fn is_everything(&self) -> bool {
        self.flow_id.is_none() && self.checkpoint_id.is_none()
    }

    pub fn admits(&self, msg: &WsMessage) -> bool {
        if self.is_everything() {
            return true;
        }
        match msg.subject() {
            Subject::Flow(id) => self.flow_id.as_deref() == Some(id),
            Subject::Checkpoint(id) => self.checkpoint_id.as_deref() == Some(id),
        }
    }

    /// Whether a serialized event should reach this client. Frames that do
    /// not parse only reach unfiltered clients.
    fn admits_frame(&self, frame: &str) -> bool {
        self.is_everything()
            || serde_json::from_str::<WsMessage>(frame).is_ok_and(|msg| self.admits(&msg))
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(subscription): Query<Subscription>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    // Subscribe before the upgrade so nothing sent after the handshake is missed.
    let events = state.ws_tx.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, events, subscription))
}

async fn handle_socket(
    socket: WebSocket,
    events: broadcast::Receiver<String>,
    subscription: Subscription,
) {
    let (sender, receiver) = socket.split();
    debug!(?subscription, "WebSocket client connected");
    run_socket_loop(sender, receiver, events, subscription).await;
    debug!("WebSocket client disconnected");
}

/// Forward matching events to one client, with ping/pong keepalive.
///
/// If no Pong arrives within [`PONG_TIMEOUT`] of a Ping the connection is
/// treated as dead.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut events: broadcast::Receiver<String>,
    mut subscription: Subscription,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick is immediate.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!("WebSocket client stopped answering pings");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            event = events.recv() => match event {
                Ok(frame) if subscription.admits_frame(&frame) => {
                    if sender.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "WebSocket client lagging; events dropped");
                }
            },

            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Pong(_))) => {
                    last_pong = Instant::now();
                    awaiting_pong = false;
                }
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<Subscription>(text.as_str()) {
                        Ok(next) => {
                            debug!(subscription = ?next, "WebSocket client re-scoped");
                            subscription = next;
                        }
                        Err(e) => debug!(error = %e, "Ignoring unreadable client frame"),
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast an event to every connected client whose
/// subscription admits it. Having no clients is not an error.
pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => warn!(error = %e, "Failed to serialize WsMessage"),
    }
}
