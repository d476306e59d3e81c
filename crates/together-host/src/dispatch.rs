//! Action sequencing.
//!
//! Every accepted action, whether it came from a participant or from the
//! host itself, is stamped with an effective logical time, applied to the
//! session and broadcast to all participants. Effective times never go
//! backwards, so every receiver observes actions in the same order.

use together_client::ConnectionState;
use together_proto::messages::ControlBroadcast;
use together_proto::{ClockSnapshot, ControlAction, ProtocolMessage};
use tracing::{info, warn};

use crate::SessionActor;
use crate::net::outbound::broadcast;
use crate::proto_dispatch::error::HandlerError;

/// Origin id used for actions submitted through the host handle.
pub const HOST_PARTICIPANT_ID: &str = "host";

/// Hands out monotonically non-decreasing effective times.
#[derive(Debug, Clone)]
pub struct Sequencer {
    lead_ms: u64,
    last_effective_at: u64,
}

impl Sequencer {
    /// `lead_ms` is how far ahead of "now" actions are scheduled, so that the
    /// broadcast reaches receivers before it is due.
    pub fn new(lead_ms: u64) -> Self {
        Self {
            lead_ms,
            last_effective_at: 0,
        }
    }

    pub fn next(&mut self, now_ms: u64) -> u64 {
        let at = now_ms.saturating_add(self.lead_ms).max(self.last_effective_at);
        self.last_effective_at = at;
        at
    }

    pub fn last(&self) -> u64 {
        self.last_effective_at
    }
}

impl SessionActor {
    /// Reject actions whose parameters are out of range or that need a
    /// track when none is selected.
    pub(crate) fn check_action(&self, action: &ControlAction) -> Result<(), HandlerError> {
        action
            .validate()
            .map_err(|e| HandlerError::invalid_parameters(e.to_string()))?;
        let needs_track = matches!(action, ControlAction::Play | ControlAction::Seek { .. });
        if needs_track && self.session.current_track_id.is_none() {
            return Err(HandlerError::invalid_parameters(format!(
                "{} requires a selected track",
                action.kind()
            )));
        }
        Ok(())
    }

    /// Sequence an already checked action and fan it out. Returns the
    /// effective logical time.
    pub(crate) fn dispatch_action(&mut self, origin: &str, action: ControlAction) -> u64 {
        let now = self.clock.now_ms();
        let effective_at = self.sequencer.next(now);
        self.session.apply(&action, effective_at);

        let degraded: Vec<&str> = self
            .session
            .participants
            .values()
            .filter(|p| {
                self.conns
                    .get(&p.conn_id)
                    .is_some_and(|ctx| *ctx.phase.borrow() == ConnectionState::Degraded)
            })
            .map(|p| p.participant_id.as_str())
            .collect();
        if !degraded.is_empty() {
            warn!(
                kind = action.kind(),
                ?degraded,
                "participants without a fresh clock estimate may play out of sync"
            );
        }

        let msg = ProtocolMessage::from(ControlBroadcast {
            session_id: self.session.session_id.clone(),
            origin_participant_id: origin.to_owned(),
            action: action.clone(),
            effective_at_logical_ms: effective_at,
        });
        let dropped = broadcast(self.participant_outbounds(None), &msg);

        if let Some(local) = &self.local_playback {
            local.schedule(action.clone(), effective_at, Some(&ClockSnapshot::local()));
        }

        info!(
            kind = action.kind(),
            origin,
            effective_at_logical_ms = effective_at,
            in_ms = effective_at.saturating_sub(now),
            dropped,
            "action sequenced"
        );
        effective_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_times_lead_now() {
        let mut seq = Sequencer::new(150);
        assert_eq!(seq.next(1_000), 1_150);
        assert_eq!(seq.next(2_000), 2_150);
        assert_eq!(seq.last(), 2_150);
    }

    #[test]
    fn effective_times_never_go_backwards() {
        let mut seq = Sequencer::new(150);
        let first = seq.next(5_000);
        // A smaller "now" must not produce an earlier slot.
        let second = seq.next(4_000);
        assert_eq!(second, first);
        assert!(seq.next(5_000) >= second);
    }

    #[test]
    fn zero_lead_uses_now() {
        let mut seq = Sequencer::new(0);
        assert_eq!(seq.next(42), 42);
    }
}
