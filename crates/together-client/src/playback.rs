//! The audio engine, as seen by the sync layer.

/// Playback collaborator driven by scheduled actions.
///
/// Times are on the caller's local elapsed clock. Implementations must not
/// block: calls arrive from the scheduler task at the scheduled instant.
pub trait PlaybackController: Send + Sync + 'static {
    /// Current playback position of the local engine.
    fn current_position(&self) -> u64;

    /// Start playing `track_id` from `position_ms` at local time `at_local_ms`.
    fn seek_and_play(&self, track_id: &str, position_ms: u64, at_local_ms: u64);

    /// Pause at local time `at_local_ms`.
    fn pause(&self, at_local_ms: u64);

    /// The session moved to another track.
    fn on_track_changed(&self, track_id: &str);
}
