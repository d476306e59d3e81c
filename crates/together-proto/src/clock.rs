//! Clock synchronization engine.
//!
//! One-hop, two-timestamp offset estimation: the originator stamps a `Ping`
//! with its own elapsed clock, the responder answers with its clock, and the
//! originator stamps the arrival. Each accepted exchange yields
//!
//! ```text
//! rtt    = received - sent
//! offset = server - (sent + rtt / 2)
//! ```
//!
//! where `offset` is how far the responder's clock is ahead of ours. A small
//! rolling window is kept and the minimum-RTT sample wins, since it carries
//! the least queuing error.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Monotonic millisecond clock anchored at construction.
///
/// On the host this is the session's logical clock.
#[derive(Debug, Clone, Copy)]
pub struct ElapsedClock {
    origin: Instant,
}

impl ElapsedClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.ms_at(Instant::now())
    }

    /// Milliseconds between the anchor and `instant` (0 if earlier).
    pub fn ms_at(&self, instant: Instant) -> u64 {
        instant.saturating_duration_since(self.origin).as_millis() as u64
    }

    /// The instant corresponding to `ms` on this clock.
    pub fn instant_at(&self, ms: u64) -> Instant {
        self.origin + Duration::from_millis(ms)
    }
}

impl Default for ElapsedClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Estimated mapping from the local clock to the remote clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSnapshot {
    /// Remote clock minus local clock.
    pub estimated_offset_ms: i64,
    pub estimated_rtt_ms: u64,
    /// Local time of the newest accepted sample.
    pub sampled_at_elapsed_ms: u64,
}

impl ClockSnapshot {
    /// Identity mapping, for a party reading its own clock.
    pub const fn local() -> Self {
        Self {
            estimated_offset_ms: 0,
            estimated_rtt_ms: 0,
            sampled_at_elapsed_ms: 0,
        }
    }

    /// Local time at which the remote clock reads `logical_ms` (clamped at 0).
    pub fn to_local_ms(&self, logical_ms: u64) -> u64 {
        (logical_ms as i64)
            .saturating_sub(self.estimated_offset_ms)
            .max(0) as u64
    }

    /// Remote clock reading at local time `local_ms` (clamped at 0).
    pub fn to_logical_ms(&self, local_ms: u64) -> u64 {
        (local_ms as i64)
            .saturating_add(self.estimated_offset_ms)
            .max(0) as u64
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.sampled_at_elapsed_ms)
    }
}

/// Freshness of a connection's clock estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ClockHealth {
    Synced,
    /// No recent sample: scheduled actions may land off-beat.
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClockError {
    #[error("clock sample rejected: pong arrived {0} ms before the ping left")]
    SampleRejected(u64),
}

/// Tunables of the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockConfig {
    /// Number of accepted samples kept for min-RTT selection.
    pub window: usize,
    /// Age after which the estimate counts as degraded.
    pub degraded_after_ms: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            window: 5,
            degraded_after_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ClockSample {
    offset_ms: i64,
    rtt_ms: u64,
    received_at_ms: u64,
}

/// Per-connection offset/RTT estimator.
#[derive(Debug, Clone)]
pub struct ClockEstimator {
    config: ClockConfig,
    samples: VecDeque<ClockSample>,
    snapshot: Option<ClockSnapshot>,
}

impl ClockEstimator {
    pub fn new(config: ClockConfig) -> Self {
        Self {
            config: ClockConfig {
                window: config.window.max(1),
                ..config
            },
            samples: VecDeque::new(),
            snapshot: None,
        }
    }

    /// Feed one completed ping/pong exchange and publish a new snapshot.
    pub fn on_pong(
        &mut self,
        sent_at_elapsed_ms: u64,
        received_at_elapsed_ms: u64,
        server_elapsed_ms: u64,
    ) -> Result<ClockSnapshot, ClockError> {
        let Some(rtt_ms) = received_at_elapsed_ms.checked_sub(sent_at_elapsed_ms) else {
            return Err(ClockError::SampleRejected(
                sent_at_elapsed_ms - received_at_elapsed_ms,
            ));
        };
        let midpoint = sent_at_elapsed_ms as i64 + (rtt_ms / 2) as i64;
        let offset_ms = server_elapsed_ms as i64 - midpoint;

        if self.samples.len() == self.config.window {
            self.samples.pop_front();
        }
        self.samples.push_back(ClockSample {
            offset_ms,
            rtt_ms,
            received_at_ms: received_at_elapsed_ms,
        });

        // Ties go to the newer sample.
        let best = self
            .samples
            .iter()
            .rev()
            .min_by_key(|s| s.rtt_ms)
            .copied()
            .unwrap_or(ClockSample {
                offset_ms,
                rtt_ms,
                received_at_ms: received_at_elapsed_ms,
            });
        let newest = self
            .samples
            .iter()
            .map(|s| s.received_at_ms)
            .max()
            .unwrap_or(received_at_elapsed_ms);

        let snapshot = ClockSnapshot {
            estimated_offset_ms: best.offset_ms,
            estimated_rtt_ms: best.rtt_ms,
            sampled_at_elapsed_ms: newest,
        };
        self.snapshot = Some(snapshot);
        Ok(snapshot)
    }

    pub fn snapshot(&self) -> Option<ClockSnapshot> {
        self.snapshot
    }

    pub fn health(&self, now_ms: u64) -> ClockHealth {
        health_of(self.snapshot.as_ref(), now_ms, self.config.degraded_after_ms)
    }

    pub fn config(&self) -> ClockConfig {
        self.config
    }
}

impl Default for ClockEstimator {
    fn default() -> Self {
        Self::new(ClockConfig::default())
    }
}

/// Health of a (possibly missing) snapshot at local time `now_ms`.
pub fn health_of(
    snapshot: Option<&ClockSnapshot>,
    now_ms: u64,
    degraded_after_ms: u64,
) -> ClockHealth {
    match snapshot {
        Some(s) if s.age_ms(now_ms) <= degraded_after_ms => ClockHealth::Synced,
        _ => ClockHealth::Degraded,
    }
}
