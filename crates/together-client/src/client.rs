//! WebSocket participant client.
//!
//! [`join_session`] dials the join link, runs the `ClientHello` /
//! `ServerWelcome` handshake and then leaves three tasks running:
//!
//! - writer: drains the outbound queue into the socket
//! - receive loop: see [`crate::handler`]
//! - pinger: sends a clock `Ping` every `ping_interval` and re-evaluates
//!   clock health, independently of the control path

use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use together_proto::codec::{decode_message, encode_message};
use together_proto::messages::{ClientHello, ClientLeave, ControlRequest, Ping, ServerWelcome};
use together_proto::{
    ClockEstimator, ClockHealth, ClockSnapshot, ControlAction, ElapsedClock, JoinInfo,
    ProtoError, ProtocolMessage, TOGETHER_PROTOCOL_VERSION,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{ClientConfig, SyncPolicy};
use crate::error::ClientError;
use crate::handler::{ReceiveLoop, TogetherEvent};
use crate::playback::PlaybackController;
use crate::scheduler::PlaybackScheduler;
use crate::session::ConnectionState;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 64;

/// State shared between the client handle and its background tasks.
pub(crate) struct ClientShared {
    pub clock: ElapsedClock,
    pub policy: SyncPolicy,
    pub estimator: Mutex<ClockEstimator>,
    pub state: watch::Sender<ConnectionState>,
    pub health: watch::Sender<ClockHealth>,
}

impl ClientShared {
    /// Current estimate, or `None` if it is missing or stale.
    pub fn fresh_snapshot(&self) -> Option<ClockSnapshot> {
        let now = self.clock.now_ms();
        let estimator = self.estimator.lock();
        match estimator.health(now) {
            ClockHealth::Synced => estimator.snapshot(),
            ClockHealth::Degraded => None,
        }
    }

    /// Re-evaluate clock freshness and publish any change.
    pub fn refresh_health(&self) -> ClockHealth {
        let health = self.estimator.lock().health(self.clock.now_ms());
        self.health.send_if_modified(|current| {
            let changed = *current != health;
            *current = health;
            changed
        });
        self.state.send_if_modified(|state| {
            let next = state.with_health(health);
            state.advance(next)
        });
        health
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().is_closed()
    }

    /// Move to `Closed`. Returns false if it already was.
    pub fn mark_closed(&self) -> bool {
        self.state
            .send_if_modified(|state| state.advance(ConnectionState::Closed))
    }
}

/// A joined session.
///
/// Dropping the handle tears the connection down without a `ClientLeave`;
/// call [`TogetherClient::leave`] to say goodbye.
pub struct TogetherClient {
    join_info: JoinInfo,
    participant_id: String,
    outbound: mpsc::Sender<Message>,
    shared: Arc<ClientShared>,
    scheduler: Arc<PlaybackScheduler>,
    events: Mutex<Option<mpsc::Receiver<TogetherEvent>>>,
    cancel: CancellationToken,
}

/// Join the session described by `join_info`.
///
/// Resolves once the host accepted the handshake. Control broadcasts are
/// applied to `playback` from then on.
pub async fn join_session(
    join_info: &JoinInfo,
    config: ClientConfig,
    playback: Arc<dyn PlaybackController>,
) -> Result<TogetherClient, ClientError> {
    let policy = config.policy.clone();
    let url = join_info.websocket_url();
    debug!(host = join_info.host(), port = join_info.port(), "connecting");

    let (ws, _response) = tokio::time::timeout(policy.handshake_timeout(), connect_async(url))
        .await
        .map_err(|_| ClientError::HandshakeTimeout)?
        .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
    let (mut sink, mut stream) = ws.split();

    let client_id = if config.client_id.is_empty() {
        hex::encode(rand::random::<[u8; 8]>())
    } else {
        config.client_id.clone()
    };
    let hello: ProtocolMessage = ClientHello {
        protocol_version: TOGETHER_PROTOCOL_VERSION,
        session_id: join_info.session_id().to_owned(),
        session_key: join_info.session_key().to_owned(),
        client_id,
        display_name: config.display_name.clone(),
    }
    .into();
    sink.send(Message::text(encode_message(&hello)?)).await?;

    let welcome = tokio::time::timeout(policy.handshake_timeout(), await_welcome(&mut stream))
        .await
        .map_err(|_| ClientError::HandshakeTimeout)??;
    if welcome.protocol_version != TOGETHER_PROTOCOL_VERSION {
        return Err(ProtoError::UnsupportedVersion(welcome.protocol_version).into());
    }
    info!(
        session_id = %welcome.session_id,
        participant_id = %welcome.participant_id,
        "joined session"
    );

    let clock = ElapsedClock::new();
    let (state_tx, _) = watch::channel(ConnectionState::Degraded);
    let (health_tx, _) = watch::channel(ClockHealth::Degraded);
    let shared = Arc::new(ClientShared {
        clock,
        estimator: Mutex::new(ClockEstimator::new(policy.clock_config())),
        policy: policy.clone(),
        state: state_tx,
        health: health_tx,
    });

    let scheduler = Arc::new(PlaybackScheduler::spawn(playback, clock));
    let cancel = CancellationToken::new();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);

    let _ = event_tx.try_send(TogetherEvent::Welcome {
        participant_id: welcome.participant_id.clone(),
    });

    tokio::spawn(run_writer(sink, outbound_rx));
    tokio::spawn(
        ReceiveLoop {
            stream,
            shared: shared.clone(),
            scheduler: scheduler.clone(),
            outbound: outbound_tx.clone(),
            events: event_tx,
            session_id: welcome.session_id.clone(),
            participant_id: welcome.participant_id.clone(),
            cancel: cancel.clone(),
            malformed_streak: 0,
        }
        .run(),
    );
    tokio::spawn(run_pinger(
        shared.clone(),
        outbound_tx.clone(),
        cancel.clone(),
    ));

    Ok(TogetherClient {
        join_info: join_info.clone(),
        participant_id: welcome.participant_id,
        outbound: outbound_tx,
        shared,
        scheduler,
        events: Mutex::new(Some(event_rx)),
        cancel,
    })
}

async fn await_welcome(stream: &mut SplitStream<WsStream>) -> Result<ServerWelcome, ClientError> {
    while let Some(frame) = stream.next().await {
        let text = match frame? {
            Message::Text(text) => text,
            Message::Close(frame) => {
                let reason = frame.map(|f| f.reason.as_str().to_owned()).unwrap_or_default();
                return Err(ClientError::ConnectionFailed(format!(
                    "closed during handshake: {reason}"
                )));
            }
            _ => continue,
        };
        match decode_message(text.as_str())? {
            ProtocolMessage::ServerWelcome(welcome) => return Ok(welcome),
            ProtocolMessage::ErrorMsg(err) => {
                return Err(ClientError::Rejected {
                    code: err.code,
                    message: err.message,
                });
            }
            other => return Err(ClientError::UnexpectedMessage(other.kind())),
        }
    }
    Err(ClientError::ConnectionFailed(
        "closed during handshake".to_owned(),
    ))
}

async fn run_writer(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let is_close = matches!(msg, Message::Close(_));
        if let Err(e) = sink.send(msg).await {
            debug!(error = %e, "send failed, writer exiting");
            break;
        }
        if is_close {
            break;
        }
    }
    let _ = sink.close().await;
    trace!("writer stopped");
}

async fn run_pinger(
    shared: Arc<ClientShared>,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(shared.policy.ping_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        shared.refresh_health();

        let ping: ProtocolMessage = Ping {
            sent_at_elapsed_ms: shared.clock.now_ms(),
        }
        .into();
        match encode_message(&ping) {
            Ok(text) => {
                if let Err(mpsc::error::TrySendError::Closed(_)) =
                    outbound.try_send(Message::text(text))
                {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "failed to encode ping"),
        }
    }
    trace!("pinger stopped");
}

impl TogetherClient {
    pub fn join_info(&self) -> &JoinInfo {
        &self.join_info
    }

    pub fn session_id(&self) -> &str {
        self.join_info.session_id()
    }

    /// Id assigned by the host in `ServerWelcome`.
    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Ask the host to apply `action`. Parameters are checked locally first.
    ///
    /// The action takes effect when the host's `ControlBroadcast` comes back,
    /// not when this call returns.
    pub async fn submit_control_action(&self, action: ControlAction) -> Result<(), ClientError> {
        if self.shared.is_closed() {
            return Err(ClientError::NotConnected);
        }
        action.validate()?;
        let request: ProtocolMessage = ControlRequest {
            session_id: self.session_id().to_owned(),
            participant_id: self.participant_id.clone(),
            action,
        }
        .into();
        self.outbound
            .send(Message::text(encode_message(&request)?))
            .await
            .map_err(|_| ClientError::ChannelSend)
    }

    pub fn observe_clock_health(&self) -> watch::Receiver<ClockHealth> {
        self.shared.health.subscribe()
    }

    pub fn observe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Latest clock estimate against the host, fresh or not.
    pub fn clock_snapshot(&self) -> Option<ClockSnapshot> {
        self.shared.estimator.lock().snapshot()
    }

    /// Session events. Returns `None` after the first call.
    pub fn events(&self) -> Option<mpsc::Receiver<TogetherEvent>> {
        self.events.lock().take()
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    /// Leave the session: notify the host, close the socket and cancel every
    /// pending playback action. Idempotent.
    pub async fn leave(&self) {
        if !self.shared.mark_closed() {
            return;
        }
        info!(participant_id = %self.participant_id, "leaving session");
        self.scheduler.close();

        let leave: ProtocolMessage = ClientLeave {
            session_id: self.session_id().to_owned(),
            participant_id: self.participant_id.clone(),
        }
        .into();
        if let Ok(text) = encode_message(&leave) {
            let _ = self.outbound.send(Message::text(text)).await;
        }
        let _ = self.outbound.send(Message::Close(None)).await;
        self.cancel.cancel();
    }
}

impl Drop for TogetherClient {
    fn drop(&mut self) {
        self.shared.mark_closed();
        self.cancel.cancel();
    }
}
