//! Receive loop for an established participant connection.
//!
//! Decodes every frame from the host and dispatches it:
//! - `Ping` is answered with a `Pong` stamped at receipt
//! - `Pong` feeds the clock estimator
//! - `ControlBroadcast` / `SessionState` go to the playback scheduler
//! - membership, kicks and errors surface as [`TogetherEvent`]s

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::SplitStream;
use together_proto::codec::{decode_message, encode_message};
use together_proto::messages::{ControlBroadcast, Pong, SessionState};
use together_proto::{ControlAction, ErrorCode, ProtocolMessage};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::{ClientShared, WsStream};
use crate::scheduler::PlaybackScheduler;

/// Notifications for the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TogetherEvent {
    /// Handshake accepted.
    Welcome { participant_id: String },
    /// Host snapshot applied (sent right after joining).
    SessionState(SessionState),
    ParticipantJoined {
        participant_id: String,
        display_name: String,
    },
    ParticipantLeft {
        participant_id: String,
        reason: Option<String>,
    },
    /// A broadcast action was queued for `local_deadline_ms`.
    ActionScheduled {
        action: ControlAction,
        local_deadline_ms: u64,
    },
    /// An action ran without a fresh clock estimate and may be audibly off.
    OutOfSync { action: ControlAction },
    /// The host rejected something we sent.
    ServerError { code: ErrorCode, message: String },
    /// Removed by the host. `banned` means rejoining will be refused.
    Kicked {
        reason: Option<String>,
        banned: bool,
    },
    /// Connection is gone; no further events follow.
    Disconnected { reason: String },
}

pub(crate) struct ReceiveLoop {
    pub stream: SplitStream<WsStream>,
    pub shared: Arc<ClientShared>,
    pub scheduler: Arc<PlaybackScheduler>,
    pub outbound: mpsc::Sender<Message>,
    pub events: mpsc::Sender<TogetherEvent>,
    pub session_id: String,
    pub participant_id: String,
    pub cancel: CancellationToken,
    pub malformed_streak: u32,
}

/// Outcome of handling one frame.
enum Exit {
    Continue,
    Stop(String),
}

impl ReceiveLoop {
    pub async fn run(mut self) {
        let heartbeat = self.shared.policy.heartbeat_timeout();
        let reason = loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break "left session".to_owned(),
                frame = tokio::time::timeout(heartbeat, self.stream.next()) => frame,
            };

            let exit = match frame {
                Err(_) => Exit::Stop(format!(
                    "no traffic from host for {} ms",
                    heartbeat.as_millis()
                )),
                Ok(None) => Exit::Stop("connection closed".to_owned()),
                Ok(Some(Err(e))) => Exit::Stop(format!("websocket error: {e}")),
                Ok(Some(Ok(msg))) => self.on_frame(msg),
            };
            if let Exit::Stop(reason) = exit {
                break reason;
            }
        };

        self.shutdown(reason);
    }

    fn on_frame(&mut self, frame: Message) -> Exit {
        // Frames that race with leave() are ignored.
        if self.shared.is_closed() {
            return Exit::Stop("left session".to_owned());
        }
        match frame {
            Message::Text(text) => match decode_message(text.as_str()) {
                Ok(msg) => {
                    self.malformed_streak = 0;
                    self.on_message(msg)
                }
                Err(e) => self.on_malformed(&e.to_string()),
            },
            Message::Binary(_) => self.on_malformed("binary frame"),
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| f.reason.as_str().to_owned())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "closed by host".to_owned());
                Exit::Stop(reason)
            }
            // Control frames are handled by tungstenite.
            _ => Exit::Continue,
        }
    }

    fn on_malformed(&mut self, detail: &str) -> Exit {
        self.malformed_streak += 1;
        warn!(
            streak = self.malformed_streak,
            detail, "dropping malformed frame from host"
        );
        if self.malformed_streak >= self.shared.policy.max_malformed_streak {
            return Exit::Stop("too many malformed frames".to_owned());
        }
        Exit::Continue
    }

    fn on_message(&mut self, msg: ProtocolMessage) -> Exit {
        let kind = msg.kind();
        trace!(kind, "received");
        if let Some(session_id) = msg.session_id()
            && session_id != self.session_id
        {
            warn!(kind, session_id, "message for another session ignored");
            return Exit::Continue;
        }

        match msg {
            ProtocolMessage::Ping(ping) => {
                let pong = Pong::answer(ping, self.shared.clock.now_ms());
                self.send(pong.into());
            }
            ProtocolMessage::Pong(pong) => {
                // Arrival is stamped locally; the wire field is not trusted.
                let received = self.shared.clock.now_ms();
                let sample = self.shared.estimator.lock().on_pong(
                    pong.sent_at_elapsed_ms,
                    received,
                    pong.server_elapsed_ms,
                );
                match sample {
                    Ok(snapshot) => {
                        trace!(
                            offset_ms = snapshot.estimated_offset_ms,
                            rtt_ms = snapshot.estimated_rtt_ms,
                            "clock sample"
                        );
                        self.shared.refresh_health();
                    }
                    Err(e) => debug!(error = %e, "clock sample dropped"),
                }
            }
            ProtocolMessage::ControlBroadcast(broadcast) => self.on_broadcast(broadcast),
            ProtocolMessage::SessionState(state) => {
                let snapshot = self.shared.fresh_snapshot();
                self.scheduler.sync_to_state(&state, snapshot.as_ref());
                self.emit(TogetherEvent::SessionState(state));
            }
            ProtocolMessage::ParticipantJoined(joined) => {
                info!(participant_id = %joined.participant_id, "participant joined");
                self.emit(TogetherEvent::ParticipantJoined {
                    participant_id: joined.participant_id,
                    display_name: joined.display_name,
                });
            }
            ProtocolMessage::ParticipantLeft(left) => {
                info!(participant_id = %left.participant_id, "participant left");
                self.emit(TogetherEvent::ParticipantLeft {
                    participant_id: left.participant_id,
                    reason: left.reason,
                });
            }
            ProtocolMessage::Kicked(kicked) => {
                if kicked.participant_id == self.participant_id {
                    warn!(reason = ?kicked.reason, banned = kicked.banned, "kicked from session");
                    self.emit(TogetherEvent::Kicked {
                        reason: kicked.reason,
                        banned: kicked.banned,
                    });
                    return Exit::Stop("kicked".to_owned());
                }
            }
            ProtocolMessage::ErrorMsg(err) => {
                warn!(code = %err.code, message = %err.message, "host reported an error");
                self.emit(TogetherEvent::ServerError {
                    code: err.code,
                    message: err.message,
                });
            }
            ProtocolMessage::ClientHello(_)
            | ProtocolMessage::ServerWelcome(_)
            | ProtocolMessage::ControlRequest(_)
            | ProtocolMessage::ClientLeave(_) => {
                warn!(kind, "unexpected message from host ignored");
            }
        }
        Exit::Continue
    }

    fn on_broadcast(&mut self, broadcast: ControlBroadcast) {
        let snapshot = self.shared.fresh_snapshot();
        let scheduled = self.scheduler.schedule(
            broadcast.action.clone(),
            broadcast.effective_at_logical_ms,
            snapshot.as_ref(),
        );
        if scheduled.immediate {
            warn!(
                kind = broadcast.action.kind(),
                origin = %broadcast.origin_participant_id,
                "no fresh clock estimate, applying action immediately"
            );
            self.emit(TogetherEvent::OutOfSync {
                action: broadcast.action,
            });
        } else {
            self.emit(TogetherEvent::ActionScheduled {
                action: broadcast.action,
                local_deadline_ms: scheduled.local_deadline_ms,
            });
        }
    }

    fn send(&self, msg: ProtocolMessage) {
        match encode_message(&msg) {
            Ok(text) => {
                if self.outbound.try_send(Message::text(text)).is_err() {
                    debug!(kind = msg.kind(), "outbound queue full, message dropped");
                }
            }
            Err(e) => warn!(error = %e, kind = msg.kind(), "failed to encode"),
        }
    }

    fn emit(&self, event: TogetherEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!(error = %e, "event dropped");
        }
    }

    fn shutdown(self, reason: String) {
        info!(%reason, "disconnected from session");
        self.shared.mark_closed();
        self.scheduler.close();
        self.cancel.cancel();
        let _ = self.outbound.try_send(Message::Close(None));
        self.emit(TogetherEvent::Disconnected { reason });
    }
}
