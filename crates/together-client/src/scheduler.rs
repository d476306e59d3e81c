//! Deadline-ordered playback scheduling.
//!
//! Every accepted [`ControlAction`] is converted from the host's logical
//! clock to a local deadline and queued. A single worker task drains the
//! queue in `(deadline, arrival)` order. A new deadline is never earlier than
//! one already queued, so a shifting clock estimate cannot reorder actions
//! the host sequenced. Each entry carries a [`CancellationToken`] handed back
//! to the caller; newer actions cancel the pending ones they supersede.
//!
//! The worker keeps the session transport (track, position, playing) it last
//! applied, so `Play` resumes from the session's position rather than from
//! wherever the local engine happens to be.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use together_proto::messages::SessionState;
use together_proto::{ClockSnapshot, ControlAction, ElapsedClock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::playback::PlaybackController;

/// Handle to a queued action.
#[derive(Debug, Clone)]
pub struct Scheduled {
    /// Cancel to drop the action before it runs.
    pub token: CancellationToken,
    pub local_deadline_ms: u64,
    /// No usable clock estimate: the action runs as soon as possible.
    pub immediate: bool,
}

#[derive(Debug)]
enum Job {
    Action(ControlAction),
    /// Resynchronize to a host snapshot (late join).
    Sync {
        track_id: Option<String>,
        position_ms: u64,
        is_playing: bool,
    },
}

#[derive(Debug)]
struct Pending {
    job: Job,
    token: CancellationToken,
}

#[derive(Debug, Default)]
struct Queue {
    entries: BTreeMap<(u64, u64), Pending>,
    next_seq: u64,
    closed: bool,
}

impl Queue {
    /// Enqueue at `deadline`, held back behind anything already queued.
    fn push(&mut self, deadline: u64, pending: Pending) -> u64 {
        let floor = self
            .entries
            .last_key_value()
            .map_or(0, |((latest, _), _)| *latest);
        let deadline = deadline.max(floor);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((deadline, seq), pending);
        deadline
    }
}

/// Session transport as last applied locally.
#[derive(Debug, Default)]
struct Transport {
    track: Option<String>,
    position_ms: u64,
    anchor_local_ms: u64,
    playing: bool,
}

impl Transport {
    fn position_at(&self, at_local_ms: u64) -> u64 {
        if self.playing {
            self.position_ms + at_local_ms.saturating_sub(self.anchor_local_ms)
        } else {
            self.position_ms
        }
    }

    fn set(&mut self, position_ms: u64, at_local_ms: u64, playing: bool) {
        self.position_ms = position_ms;
        self.anchor_local_ms = at_local_ms;
        self.playing = playing;
    }
}

struct Shared {
    queue: Mutex<Queue>,
    wake: Notify,
}

/// Applies host-sequenced actions to the local [`PlaybackController`].
pub struct PlaybackScheduler {
    shared: Arc<Shared>,
    clock: ElapsedClock,
    shutdown: CancellationToken,
}

impl PlaybackScheduler {
    /// Spawn the worker. Must be called inside a tokio runtime.
    ///
    /// `clock` is the local elapsed clock that deadlines and the
    /// `at_local_ms` arguments passed to `controller` refer to.
    pub fn spawn(controller: Arc<dyn PlaybackController>, clock: ElapsedClock) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wake: Notify::new(),
        });
        let shutdown = CancellationToken::new();
        tokio::spawn(run_worker(
            shared.clone(),
            controller,
            clock,
            shutdown.clone(),
        ));
        Self {
            shared,
            clock,
            shutdown,
        }
    }

    pub fn clock(&self) -> ElapsedClock {
        self.clock
    }

    /// Queue `action` to run when the host's logical clock reads
    /// `effective_at_logical_ms`.
    ///
    /// `clock` is `None` when no fresh estimate exists; the action then runs
    /// immediately and [`Scheduled::immediate`] is set.
    pub fn schedule(
        &self,
        action: ControlAction,
        effective_at_logical_ms: u64,
        clock: Option<&ClockSnapshot>,
    ) -> Scheduled {
        let now = self.clock.now_ms();
        let (mut deadline, immediate) = match clock {
            Some(snapshot) => (snapshot.to_local_ms(effective_at_logical_ms), false),
            None => (now, true),
        };

        let token = CancellationToken::new();
        {
            let mut queue = self.shared.queue.lock();
            if queue.closed {
                token.cancel();
                return Scheduled {
                    token,
                    local_deadline_ms: deadline,
                    immediate,
                };
            }

            let superseded: Vec<(u64, u64)> = queue
                .entries
                .iter()
                .filter(|(_, pending)| match &pending.job {
                    Job::Action(earlier) => action.supersedes(earlier),
                    Job::Sync { .. } => false,
                })
                .map(|(key, _)| *key)
                .collect();
            for key in superseded {
                if let Some(pending) = queue.entries.remove(&key) {
                    trace!(deadline = key.0, "pending action superseded");
                    pending.token.cancel();
                }
            }

            let kind = action.kind();
            deadline = queue.push(
                deadline,
                Pending {
                    job: Job::Action(action),
                    token: token.clone(),
                },
            );
            debug!(
                kind,
                effective_at_logical_ms,
                local_deadline_ms = deadline,
                in_ms = deadline.saturating_sub(now),
                immediate,
                "action scheduled"
            );
        }
        self.shared.wake.notify_one();

        Scheduled {
            token,
            local_deadline_ms: deadline,
            immediate,
        }
    }

    /// Align local playback with a host snapshot.
    ///
    /// The snapshot's position holds at `host_logical_ms`. If that instant is
    /// already past, the position is advanced by the elapsed time while
    /// playing and the state is applied right away.
    pub fn sync_to_state(&self, state: &SessionState, clock: Option<&ClockSnapshot>) -> Scheduled {
        let now = self.clock.now_ms();
        let anchor = clock.map(|snapshot| snapshot.to_local_ms(state.host_logical_ms));
        let (mut deadline, position_ms) = match anchor {
            Some(anchor) if anchor > now => (anchor, state.current_position_ms),
            Some(anchor) if state.is_playing => {
                (now, state.current_position_ms + (now - anchor))
            }
            _ => (now, state.current_position_ms),
        };

        let token = CancellationToken::new();
        {
            let mut queue = self.shared.queue.lock();
            if queue.closed {
                token.cancel();
            } else {
                deadline = queue.push(
                    deadline,
                    Pending {
                        job: Job::Sync {
                            track_id: state.current_track_id.clone(),
                            position_ms,
                            is_playing: state.is_playing,
                        },
                        token: token.clone(),
                    },
                );
            }
        }
        self.shared.wake.notify_one();

        Scheduled {
            token,
            local_deadline_ms: deadline,
            immediate: clock.is_none(),
        }
    }

    /// Number of actions still waiting for their deadline.
    pub fn pending(&self) -> usize {
        self.shared
            .queue
            .lock()
            .entries
            .values()
            .filter(|p| !p.token.is_cancelled())
            .count()
    }

    /// Cancel everything pending and stop the worker. Later schedules are
    /// returned already cancelled.
    pub fn close(&self) {
        let drained = {
            let mut queue = self.shared.queue.lock();
            queue.closed = true;
            std::mem::take(&mut queue.entries)
        };
        for pending in drained.into_values() {
            pending.token.cancel();
        }
        self.shutdown.cancel();
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    controller: Arc<dyn PlaybackController>,
    clock: ElapsedClock,
    shutdown: CancellationToken,
) {
    let mut transport = Transport::default();

    loop {
        let next_deadline = shared
            .queue
            .lock()
            .entries
            .first_key_value()
            .map(|((deadline, _), _)| *deadline);

        match next_deadline {
            None => {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = shared.wake.notified() => continue,
                }
            }
            Some(deadline) => {
                let at = tokio::time::Instant::from_std(clock.instant_at(deadline));
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = shared.wake.notified() => continue,
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
        }

        let now = clock.now_ms();
        let due: Vec<((u64, u64), Pending)> = {
            let mut queue = shared.queue.lock();
            let mut due = Vec::new();
            while let Some(entry) = queue.entries.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                due.push(entry.remove_entry());
            }
            due
        };

        for ((deadline, _), pending) in due {
            if pending.token.is_cancelled() {
                continue;
            }
            perform(controller.as_ref(), &mut transport, pending.job, deadline);
        }
    }

    debug!("playback scheduler stopped");
}

fn perform(
    controller: &dyn PlaybackController,
    transport: &mut Transport,
    job: Job,
    at_local_ms: u64,
) {
    match job {
        Job::Action(action) => {
            trace!(kind = action.kind(), at_local_ms, "performing action");
            match action {
                ControlAction::Play => {
                    let Some(track) = transport.track.clone() else {
                        warn!("play without a current track ignored");
                        return;
                    };
                    let position = transport.position_at(at_local_ms);
                    trace!(
                        position,
                        engine_position = controller.current_position(),
                        "resuming"
                    );
                    transport.set(position, at_local_ms, true);
                    controller.seek_and_play(&track, position, at_local_ms);
                }
                ControlAction::Pause => {
                    let position = transport.position_at(at_local_ms);
                    transport.set(position, at_local_ms, false);
                    controller.pause(at_local_ms);
                }
                ControlAction::Seek { position_ms } => {
                    let Some(track) = transport.track.clone() else {
                        warn!("seek without a current track ignored");
                        return;
                    };
                    let position = position_ms.max(0) as u64;
                    let playing = transport.playing;
                    transport.set(position, at_local_ms, playing);
                    controller.seek_and_play(&track, position, at_local_ms);
                    // Seeking a paused session only moves the cue point.
                    if !playing {
                        controller.pause(at_local_ms);
                    }
                }
                ControlAction::SeekToTrack {
                    track_id,
                    position_ms,
                } => {
                    let position = position_ms.max(0) as u64;
                    switch_track(controller, transport, &track_id);
                    transport.set(position, at_local_ms, true);
                    controller.seek_and_play(&track_id, position, at_local_ms);
                }
                ControlAction::ChangeTrack { track_id } => {
                    switch_track(controller, transport, &track_id);
                    transport.set(0, at_local_ms, true);
                    controller.seek_and_play(&track_id, 0, at_local_ms);
                }
            }
        }
        Job::Sync {
            track_id,
            position_ms,
            is_playing,
        } => {
            transport.set(position_ms, at_local_ms, is_playing);
            let Some(track_id) = track_id else {
                trace!("host has no current track");
                return;
            };
            switch_track(controller, transport, &track_id);
            if is_playing {
                controller.seek_and_play(&track_id, position_ms, at_local_ms);
            } else {
                controller.pause(at_local_ms);
            }
        }
    }
}

fn switch_track(controller: &dyn PlaybackController, transport: &mut Transport, track_id: &str) {
    if transport.track.as_deref() != Some(track_id) {
        controller.on_track_changed(track_id);
        transport.track = Some(track_id.to_owned());
    }
}
