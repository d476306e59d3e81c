//! Public host handle.
//!
//! [`HostHandle::start`] binds the listener, creates the session and spawns
//! the session actor. Every other method is a request to the actor over a
//! command channel, so callers never touch session state directly.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use together_client::PlaybackController;
use together_proto::messages::{Kicked, SessionState};
use together_proto::{ClockHealth, ControlAction, ElapsedClock, JoinInfo, ProtocolMessage};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::HostConfig;
use crate::dispatch::HOST_PARTICIPANT_ID;
use crate::error::HostError;
use crate::net::rate_limit::IpRateLimiter;
use crate::net::ws::{ConnParams, run_ws_listener};
use crate::session::{ParticipantInfo, Session};
use crate::{SessionActor, run_host};

const EVENT_QUEUE: usize = 1024;
const COMMAND_QUEUE: usize = 64;

/// Requests from the [`HostHandle`] to the session actor.
#[derive(Debug)]
pub enum HostCommand {
    SubmitAction {
        action: ControlAction,
        reply: oneshot::Sender<Result<u64, HostError>>,
    },
    Kick {
        participant_id: String,
        reason: Option<String>,
        reply: oneshot::Sender<Result<(), HostError>>,
    },
    /// Kick and refuse the participant's client id from now on.
    Ban {
        participant_id: String,
        reason: Option<String>,
        reply: oneshot::Sender<Result<(), HostError>>,
    },
    SetGuestControl {
        allowed: bool,
        reply: oneshot::Sender<()>,
    },
    Participants {
        reply: oneshot::Sender<Vec<ParticipantInfo>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionState>,
    },
}

impl SessionActor {
    pub(crate) fn handle_command(&mut self, cmd: HostCommand) {
        match cmd {
            HostCommand::SubmitAction { action, reply } => {
                let result = match self.check_action(&action) {
                    Ok(()) => Ok(self.dispatch_action(HOST_PARTICIPANT_ID, action)),
                    Err(err) => Err(HostError::Rejected {
                        code: err.code,
                        message: err.message,
                    }),
                };
                let _ = reply.send(result);
            }
            HostCommand::Kick {
                participant_id,
                reason,
                reply,
            } => {
                let _ = reply.send(self.kick(&participant_id, reason, false));
            }
            HostCommand::Ban {
                participant_id,
                reason,
                reply,
            } => {
                let _ = reply.send(self.kick(&participant_id, reason, true));
            }
            HostCommand::SetGuestControl { allowed, reply } => {
                info!(allowed, "guest playback control changed");
                self.session.allow_guest_control = allowed;
                let _ = reply.send(());
            }
            HostCommand::Participants { reply } => {
                let _ = reply.send(self.participant_infos());
            }
            HostCommand::Snapshot { reply } => {
                let _ = reply.send(self.session.snapshot(self.clock.now_ms()));
            }
        }
    }

    fn kick(
        &mut self,
        participant_id: &str,
        reason: Option<String>,
        ban: bool,
    ) -> Result<(), HostError> {
        let (conn_id, client_id) = self
            .session
            .participants
            .get(participant_id)
            .map(|p| (p.conn_id, p.client_id.clone()))
            .ok_or_else(|| HostError::UnknownParticipant(participant_id.to_owned()))?;

        info!(%participant_id, ?reason, ban, "kicking participant");
        if ban {
            self.session.banned_clients.insert(client_id);
        }
        let kicked = ProtocolMessage::from(Kicked {
            session_id: self.session.session_id.clone(),
            participant_id: participant_id.to_owned(),
            reason,
            banned: ban,
        });
        self.send_to(conn_id, &kicked);
        self.close_conn(conn_id, if ban { "banned" } else { "kicked" });
        Ok(())
    }

    fn participant_infos(&self) -> Vec<ParticipantInfo> {
        let mut infos: Vec<ParticipantInfo> = self
            .session
            .participants
            .values()
            .map(|p| ParticipantInfo {
                participant_id: p.participant_id.clone(),
                display_name: p.display_name.clone(),
                joined_at_elapsed_ms: p.joined_at_elapsed_ms,
                clock: p.last_clock_snapshot,
                state: self
                    .conns
                    .get(&p.conn_id)
                    .map(|ctx| *ctx.phase.borrow())
                    .unwrap_or_default(),
            })
            .collect();
        infos.sort_by(|a, b| {
            a.joined_at_elapsed_ms
                .cmp(&b.joined_at_elapsed_ms)
                .then_with(|| a.participant_id.cmp(&b.participant_id))
        });
        infos
    }
}

/// A running session host.
///
/// Dropping the handle stops the session; [`HostHandle::shutdown`] also
/// waits for the actor to close every connection.
pub struct HostHandle {
    join_info: JoinInfo,
    local_addr: SocketAddr,
    commands: mpsc::Sender<HostCommand>,
    health: watch::Receiver<ClockHealth>,
    shutdown: CancellationToken,
    actor_task: Mutex<Option<JoinHandle<anyhow::Result<()>>>>,
}

impl HostHandle {
    /// Create a session and start accepting participants.
    ///
    /// `playback` is the host's own player; actions are scheduled on it at
    /// the same logical instants as on every participant.
    pub async fn start(
        config: HostConfig,
        playback: Option<Arc<dyn PlaybackController>>,
    ) -> Result<Self, HostError> {
        let listener = TcpListener::bind(config.bind).await?;
        let local_addr = listener.local_addr()?;

        let advertise_host = config
            .advertise_host
            .clone()
            .unwrap_or_else(|| advertised_ip(local_addr.ip()).to_string());
        let session_id = config
            .session_id
            .clone()
            .unwrap_or_else(|| hex::encode(rand::random::<[u8; 8]>()));
        let session_key = config
            .session_key
            .clone()
            .unwrap_or_else(|| URL_SAFE_NO_PAD.encode(rand::random::<[u8; 16]>()));
        let join_info = JoinInfo::new(
            &advertise_host,
            local_addr.port(),
            session_id.clone(),
            session_key.clone(),
        )?;

        let clock = ElapsedClock::new();
        let mut session = Session::new(session_id, session_key);
        session.allow_guest_control = config.allow_guest_control;
        let actor = SessionActor::new(
            session,
            clock,
            config.policy.clone(),
            playback,
        );
        let health = actor.observe_clock_health();

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let shutdown = CancellationToken::new();

        let actor_task = tokio::spawn(run_host(event_rx, command_rx, actor, shutdown.clone()));

        let ip_rate_limiter = config
            .rate_limit
            .as_ref()
            .map(|c| Arc::new(IpRateLimiter::new(c)));
        let params = ConnParams {
            clock,
            policy: config.policy,
            rate_limit: config.rate_limit,
        };
        let listener_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) =
                run_ws_listener(listener, event_tx, params, ip_rate_limiter, listener_shutdown)
                    .await
            {
                error!(error = %e, "listener stopped");
            }
        });

        info!(
            %local_addr,
            session_id = join_info.session_id(),
            "session host started"
        );

        Ok(Self {
            join_info,
            local_addr,
            commands: command_tx,
            health,
            shutdown,
            actor_task: Mutex::new(Some(actor_task)),
        })
    }

    pub fn join_info(&self) -> &JoinInfo {
        &self.join_info
    }

    /// Join link to hand out to participants.
    pub fn link(&self) -> String {
        self.join_info.to_link()
    }

    pub fn session_id(&self) -> &str {
        self.join_info.session_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Apply `action` as the host's own participant. Returns the effective
    /// logical time it was sequenced at.
    pub async fn submit_control_action(&self, action: ControlAction) -> Result<u64, HostError> {
        self.request(|reply| HostCommand::SubmitAction { action, reply })
            .await?
    }

    /// Remove a participant. It receives `Kicked` and is disconnected.
    pub async fn kick(
        &self,
        participant_id: impl Into<String>,
        reason: Option<String>,
    ) -> Result<(), HostError> {
        let participant_id = participant_id.into();
        self.request(|reply| HostCommand::Kick {
            participant_id,
            reason,
            reply,
        })
        .await?
    }

    /// Kick a participant and refuse its client id for the rest of the
    /// session.
    pub async fn ban(
        &self,
        participant_id: impl Into<String>,
        reason: Option<String>,
    ) -> Result<(), HostError> {
        let participant_id = participant_id.into();
        self.request(|reply| HostCommand::Ban {
            participant_id,
            reason,
            reply,
        })
        .await?
    }

    /// Allow or refuse participants' control requests. The host's own
    /// actions are never affected.
    pub async fn set_guest_control(&self, allowed: bool) -> Result<(), HostError> {
        self.request(|reply| HostCommand::SetGuestControl { allowed, reply })
            .await
    }

    /// Copy of the current participant list, oldest first.
    pub async fn participants(&self) -> Result<Vec<ParticipantInfo>, HostError> {
        self.request(|reply| HostCommand::Participants { reply })
            .await
    }

    /// Playback state as a late joiner would receive it now.
    pub async fn session_snapshot(&self) -> Result<SessionState, HostError> {
        self.request(|reply| HostCommand::Snapshot { reply }).await
    }

    /// `Degraded` while any participant lacks a fresh clock estimate.
    pub fn observe_clock_health(&self) -> watch::Receiver<ClockHealth> {
        self.health.clone()
    }

    /// Close every connection and stop the session. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.actor_task.lock().take();
        if let Some(task) = task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "session actor failed"),
                Err(e) => error!(error = %e, "session actor panicked"),
            }
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> HostCommand,
    ) -> Result<T, HostError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| HostError::Closed)?;
        rx.await.map_err(|_| HostError::Closed)
    }
}

impl Drop for HostHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Address written into the join link when none is configured.
fn advertised_ip(bound: IpAddr) -> IpAddr {
    if bound.is_unspecified() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unspecified_bind_advertises_loopback() {
        assert_eq!(
            advertised_ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
        let lan = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
        assert_eq!(advertised_ip(lan), lan);
    }
}
