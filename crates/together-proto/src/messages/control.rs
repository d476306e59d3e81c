use serde::{Deserialize, Serialize};

use crate::limits::MAX_TRACK_ID_BYTES;

/// A playback intent.
///
/// Positions are signed on the wire so out-of-range values can be detected
/// and rejected instead of failing to parse.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, strum::IntoStaticStr)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ControlAction {
    Play,
    Pause,
    Seek { position_ms: i64 },
    SeekToTrack { track_id: String, position_ms: i64 },
    ChangeTrack { track_id: String },
}

/// Why an action's parameters were rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ActionParamError {
    #[error("position must not be negative")]
    NegativePosition,
    #[error("track id must not be empty")]
    EmptyTrackId,
    #[error("track id too long")]
    TrackIdTooLong,
}

impl ControlAction {
    pub fn kind(&self) -> &'static str {
        self.into()
    }

    /// Check parameter ranges (`position_ms >= 0`, non-empty track id).
    pub fn validate(&self) -> Result<(), ActionParamError> {
        match self {
            ControlAction::Play | ControlAction::Pause => Ok(()),
            ControlAction::Seek { position_ms } => check_position(*position_ms),
            ControlAction::SeekToTrack {
                track_id,
                position_ms,
            } => {
                check_track_id(track_id)?;
                check_position(*position_ms)
            }
            ControlAction::ChangeTrack { track_id } => check_track_id(track_id),
        }
    }

    /// Track the action switches to, if any.
    pub fn target_track(&self) -> Option<&str> {
        match self {
            ControlAction::SeekToTrack { track_id, .. } | ControlAction::ChangeTrack { track_id } => {
                Some(track_id)
            }
            _ => None,
        }
    }

    /// Whether a still-pending `earlier` action becomes moot once `self` is
    /// scheduled. Transport changes replace transport changes, and a track or
    /// position jump replaces earlier jumps.
    pub fn supersedes(&self, earlier: &ControlAction) -> bool {
        use ControlAction::*;
        match self {
            Play | Pause => matches!(earlier, Play | Pause),
            Seek { .. } => matches!(earlier, Seek { .. }),
            SeekToTrack { .. } | ChangeTrack { .. } => {
                matches!(earlier, Seek { .. } | SeekToTrack { .. } | ChangeTrack { .. })
            }
        }
    }
}

fn check_position(position_ms: i64) -> Result<(), ActionParamError> {
    if position_ms < 0 {
        return Err(ActionParamError::NegativePosition);
    }
    Ok(())
}

fn check_track_id(track_id: &str) -> Result<(), ActionParamError> {
    if track_id.trim().is_empty() {
        return Err(ActionParamError::EmptyTrackId);
    }
    if track_id.len() > MAX_TRACK_ID_BYTES {
        return Err(ActionParamError::TrackIdTooLong);
    }
    Ok(())
}

/// A participant asks the host to apply an action.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    pub session_id: String,
    pub participant_id: String,
    pub action: ControlAction,
}

/// Host-sequenced action, to be applied by every receiver at
/// `effective_at_logical_ms` on the host's logical clock.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ControlBroadcast {
    pub session_id: String,
    pub origin_participant_id: String,
    pub action: ControlAction,
    pub effective_at_logical_ms: u64,
}
