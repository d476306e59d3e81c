use std::collections::{HashMap, HashSet};

use together_client::ConnectionState;
use together_proto::messages::SessionState;
use together_proto::{ClockSnapshot, ControlAction};

use crate::net::inbound::ConnId;

/// A joined participant, as tracked by the host.
#[derive(Debug, Clone)]
pub struct Participant {
    pub participant_id: String,
    pub display_name: String,
    pub client_id: String,
    pub conn_id: ConnId,
    /// Host-side estimate of the participant's clock.
    pub last_clock_snapshot: Option<ClockSnapshot>,
    pub joined_at_elapsed_ms: u64,
}

/// Copy of a participant handed out by [`crate::HostHandle::participants`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub participant_id: String,
    pub display_name: String,
    pub joined_at_elapsed_ms: u64,
    pub clock: Option<ClockSnapshot>,
    pub state: ConnectionState,
}

/// Authoritative playback state of a session.
///
/// `current_position_ms` holds at logical time `position_anchor_ms`; the
/// position at any later instant is derived by [`Session::position_at`].
#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub session_key: String,
    pub current_track_id: Option<String>,
    pub current_position_ms: u64,
    pub position_anchor_ms: u64,
    pub is_playing: bool,
    pub participants: HashMap<String, Participant>,
    /// When `false` only the host may submit control actions.
    pub allow_guest_control: bool,
    /// Client ids refused at handshake.
    pub banned_clients: HashSet<String>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, session_key: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            session_key: session_key.into(),
            current_track_id: None,
            current_position_ms: 0,
            position_anchor_ms: 0,
            is_playing: false,
            participants: HashMap::new(),
            allow_guest_control: true,
            banned_clients: HashSet::new(),
        }
    }

    /// Playback position at logical time `t`. Advances at rate 1 while
    /// playing; times before the anchor read the anchored position.
    pub fn position_at(&self, t: u64) -> u64 {
        if self.is_playing {
            self.current_position_ms + t.saturating_sub(self.position_anchor_ms)
        } else {
            self.current_position_ms
        }
    }

    /// Apply `action` as taking effect at logical time `at`.
    pub fn apply(&mut self, action: &ControlAction, at: u64) {
        let position = match action {
            ControlAction::Play | ControlAction::Pause => self.position_at(at),
            ControlAction::Seek { position_ms } => (*position_ms).max(0) as u64,
            ControlAction::SeekToTrack {
                track_id,
                position_ms,
            } => {
                self.current_track_id = Some(track_id.clone());
                (*position_ms).max(0) as u64
            }
            ControlAction::ChangeTrack { track_id } => {
                self.current_track_id = Some(track_id.clone());
                0
            }
        };
        self.current_position_ms = position;
        self.position_anchor_ms = at;
        self.is_playing = match action {
            ControlAction::Pause => false,
            // Seeking keeps the play state.
            ControlAction::Seek { .. } => self.is_playing,
            _ => true,
        };
    }

    /// Late-join snapshot as of `now`.
    ///
    /// When the latest action takes effect in the future, the snapshot is
    /// anchored there so receivers apply it at the same instant.
    pub fn snapshot(&self, now: u64) -> SessionState {
        let at = now.max(self.position_anchor_ms);
        SessionState {
            session_id: self.session_id.clone(),
            current_track_id: self.current_track_id.clone(),
            current_position_ms: self.position_at(at),
            is_playing: self.is_playing,
            host_logical_ms: at,
        }
    }
}
