//! Host side of a listening session.
//!
//! Connection tasks (see [`net::ws`]) turn WebSocket traffic into
//! [`InboundEvent`]s. A single session actor ([`run_host`]) consumes them
//! together with [`HostCommand`]s from the [`HostHandle`] and is the only
//! writer of [`Session`] state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use together_client::{ConnectionState, PlaybackController, PlaybackScheduler, SyncPolicy};
use together_proto::clock::health_of;
use together_proto::messages::{ErrorMsg, ParticipantLeft};
use together_proto::{ClockHealth, ClockSnapshot, ElapsedClock, ProtocolMessage};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dispatch::Sequencer;
use crate::net::inbound::{ConnId, InboundEvent};
use crate::net::outbound::{OutboundTx, broadcast, send_msg};
use crate::proto_dispatch::error::HandlerError;
use crate::proto_dispatch::handlers::dispatch_message;

pub mod config;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod net;
pub mod proto_dispatch;
pub mod session;

pub use config::HostConfig;
pub use error::HostError;
pub use host::{HostCommand, HostHandle};
pub use session::{ParticipantInfo, Session};

/// Per-connection context held by the actor.
pub(crate) struct ConnCtx {
    pub(crate) outbound: OutboundTx,
    pub(crate) cancel: CancellationToken,
    pub(crate) phase: watch::Sender<ConnectionState>,
    pub(crate) peer: SocketAddr,
    /// Set once the handshake succeeded.
    pub(crate) participant_id: Option<String>,
}

impl ConnCtx {
    fn is_open_participant(&self) -> bool {
        self.participant_id.is_some() && !self.phase.borrow().is_closed()
    }
}

/// State owned by the session actor.
pub struct SessionActor {
    pub(crate) session: Session,
    pub(crate) conns: HashMap<ConnId, ConnCtx>,
    pub(crate) sequencer: Sequencer,
    pub(crate) clock: ElapsedClock,
    pub(crate) policy: SyncPolicy,
    pub(crate) local_playback: Option<PlaybackScheduler>,
    health: watch::Sender<ClockHealth>,
    next_participant: u64,
}

impl SessionActor {
    /// `playback` is the host's own audio engine, if it plays along.
    pub fn new(
        session: Session,
        clock: ElapsedClock,
        policy: SyncPolicy,
        playback: Option<Arc<dyn PlaybackController>>,
    ) -> Self {
        let (health, _) = watch::channel(ClockHealth::Synced);
        Self {
            session,
            conns: HashMap::new(),
            sequencer: Sequencer::new(policy.schedule_lead_ms),
            clock,
            local_playback: playback.map(|p| PlaybackScheduler::spawn(p, clock)),
            policy,
            health,
            next_participant: 1,
        }
    }

    /// Aggregate clock health: `Degraded` while any participant is.
    pub fn observe_clock_health(&self) -> watch::Receiver<ClockHealth> {
        self.health.subscribe()
    }

    pub(crate) fn next_participant_id(&mut self) -> String {
        let id = format!("p{}", self.next_participant);
        self.next_participant += 1;
        id
    }

    /// Outbound queues of every joined, still-open participant.
    pub(crate) fn participant_outbounds(
        &self,
        except: Option<ConnId>,
    ) -> impl Iterator<Item = &OutboundTx> {
        self.conns
            .iter()
            .filter(move |(id, ctx)| Some(**id) != except && ctx.is_open_participant())
            .map(|(_, ctx)| &ctx.outbound)
    }

    pub(crate) fn send_to(&self, conn_id: ConnId, msg: &ProtocolMessage) -> bool {
        self.conns
            .get(&conn_id)
            .is_some_and(|ctx| send_msg(&ctx.outbound, msg))
    }

    /// Report `err` to the connection; terminal codes also close it.
    pub(crate) fn reject(&mut self, conn_id: ConnId, err: HandlerError) {
        debug!(conn_id, code = %err.code, message = %err.message, "rejecting");
        let terminal = err.code.is_terminal();
        self.send_to(conn_id, &ProtocolMessage::from(ErrorMsg::from(err)));
        if terminal {
            self.close_conn(conn_id, "rejected");
        }
    }

    /// Close a connection after its queued frames are flushed and remove its
    /// participant, if any.
    pub(crate) fn close_conn(&mut self, conn_id: ConnId, reason: &str) {
        if let Some(ctx) = self.conns.get(&conn_id) {
            let _ = ctx.outbound.try_send(Message::Close(None));
            ctx.phase.send_replace(ConnectionState::Closed);
            ctx.cancel.cancel();
        }
        self.remove_participant_of(conn_id, reason);
    }

    fn remove_participant_of(&mut self, conn_id: ConnId, reason: &str) {
        let Some(participant_id) = self
            .conns
            .get_mut(&conn_id)
            .and_then(|ctx| ctx.participant_id.take())
        else {
            return;
        };
        self.session.participants.remove(&participant_id);
        info!(conn_id, %participant_id, %reason, "participant left");

        let left: ProtocolMessage = ParticipantLeft {
            session_id: self.session.session_id.clone(),
            participant_id,
            reason: Some(reason.to_owned()),
        }
        .into();
        broadcast(self.participant_outbounds(Some(conn_id)), &left);
        self.refresh_health();
    }

    /// Re-evaluate every participant's clock freshness, flip connection
    /// phases between `Synced` and `Degraded`, and publish the aggregate.
    pub(crate) fn refresh_health(&mut self) {
        let now = self.clock.now_ms();
        let degraded_after = self.policy.degraded_after_ms;
        let mut aggregate = ClockHealth::Synced;

        for participant in self.session.participants.values() {
            let health = match participant.last_clock_snapshot.as_ref() {
                Some(snapshot) => health_of(Some(snapshot), now, degraded_after),
                // Grace period until the first sample arrives.
                None if now.saturating_sub(participant.joined_at_elapsed_ms) <= degraded_after => {
                    ClockHealth::Synced
                }
                None => ClockHealth::Degraded,
            };
            if health == ClockHealth::Degraded {
                aggregate = ClockHealth::Degraded;
            }
            if let Some(ctx) = self.conns.get(&participant.conn_id) {
                let changed = ctx.phase.send_if_modified(|state| {
                    let next = state.with_health(health);
                    state.advance(next)
                });
                if changed {
                    info!(participant_id = %participant.participant_id, %health, "clock health changed");
                }
            }
        }

        self.health.send_if_modified(|current| {
            let changed = *current != aggregate;
            *current = aggregate;
            changed
        });
    }

    fn handle_connected(
        &mut self,
        conn_id: ConnId,
        peer: SocketAddr,
        outbound: OutboundTx,
        cancel: CancellationToken,
        phase: watch::Sender<ConnectionState>,
    ) {
        self.conns.insert(
            conn_id,
            ConnCtx {
                outbound,
                cancel,
                phase,
                peer,
                participant_id: None,
            },
        );
        debug!(conn_id, %peer, "connection accepted");
    }

    fn handle_disconnected(&mut self, conn_id: ConnId, peer: SocketAddr, reason: String) {
        self.remove_participant_of(conn_id, &reason);
        self.conns.remove(&conn_id);
        info!(conn_id, %peer, %reason, "connection closed");
    }

    fn handle_message(&mut self, conn_id: ConnId, message: ProtocolMessage) {
        // Frames still in flight after the actor closed the connection.
        if self
            .conns
            .get(&conn_id)
            .is_none_or(|ctx| ctx.phase.borrow().is_closed())
        {
            return;
        }
        if let Err(err) = dispatch_message(self, conn_id, message) {
            self.reject(conn_id, err);
        }
    }

    fn handle_clock_sample(&mut self, conn_id: ConnId, snapshot: ClockSnapshot) {
        let Some(participant_id) = self
            .conns
            .get(&conn_id)
            .and_then(|ctx| ctx.participant_id.clone())
        else {
            return;
        };
        if let Some(participant) = self.session.participants.get_mut(&participant_id) {
            participant.last_clock_snapshot = Some(snapshot);
        }
        self.refresh_health();
    }

    fn handle_event(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Connected {
                conn_id,
                peer,
                outbound,
                cancel_token,
                phase,
            } => self.handle_connected(conn_id, peer, outbound, cancel_token, phase),
            InboundEvent::Message { conn_id, message } => self.handle_message(conn_id, message),
            InboundEvent::ClockSample { conn_id, snapshot } => {
                self.handle_clock_sample(conn_id, snapshot)
            }
            InboundEvent::Disconnected {
                conn_id,
                peer,
                reason,
            } => self.handle_disconnected(conn_id, peer, reason),
        }
    }

    fn close_all(&mut self) {
        let ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for conn_id in ids {
            self.close_conn(conn_id, "host shut down");
        }
        if let Some(local) = &self.local_playback {
            local.close();
        }
    }
}

/// Run the session actor until `shutdown` fires or every event source is
/// gone.
pub async fn run_host(
    mut rx: mpsc::Receiver<InboundEvent>,
    mut commands: mpsc::Receiver<HostCommand>,
    mut actor: SessionActor,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut health_timer = tokio::time::interval(actor.policy.ping_interval());
    health_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(session_id = %actor.session.session_id, "session actor started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            ev = rx.recv() => {
                let Some(ev) = ev else {
                    break;
                };
                actor.handle_event(ev);
            }
            cmd = commands.recv() => {
                let Some(cmd) = cmd else {
                    break;
                };
                actor.handle_command(cmd);
            }
            _ = health_timer.tick() => actor.refresh_health(),
        }
    }

    actor.close_all();
    info!(session_id = %actor.session.session_id, "session actor stopped");
    Ok(())
}
