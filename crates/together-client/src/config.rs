use std::time::Duration;

use clap::Args;
use together_proto::ClockConfig;

/// Timing and tolerance policy shared by hosts and participants.
///
/// Every value is a tunable; the defaults suit a shared LAN.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Period of clock pings on every established connection
    #[arg(long, default_value_t = 1_000)]
    pub ping_interval_ms: u64,

    /// Number of clock samples kept for min-RTT selection
    #[arg(long, default_value_t = 5)]
    pub clock_window: usize,

    /// Age of the newest clock sample after which a peer counts as degraded
    #[arg(long, default_value_t = 30_000)]
    pub degraded_after_ms: u64,

    /// Close connections that stay silent this long
    #[arg(long, default_value_t = 15_000)]
    pub heartbeat_timeout_ms: u64,

    /// Deadline for completing the handshake
    #[arg(long, default_value_t = 5_000)]
    pub handshake_timeout_ms: u64,

    /// Consecutive malformed frames tolerated before the connection is closed
    #[arg(long, default_value_t = 5)]
    pub max_malformed_streak: u32,

    /// How far ahead of "now" the host schedules accepted actions
    #[arg(long, default_value_t = 150)]
    pub schedule_lead_ms: u64,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            ping_interval_ms: 1_000,
            clock_window: 5,
            degraded_after_ms: 30_000,
            heartbeat_timeout_ms: 15_000,
            handshake_timeout_ms: 5_000,
            max_malformed_streak: 5,
            schedule_lead_ms: 150,
        }
    }
}

impl SyncPolicy {
    pub fn clock_config(&self) -> ClockConfig {
        ClockConfig {
            window: self.clock_window,
            degraded_after_ms: self.degraded_after_ms,
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Configuration for joining a session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name shown to the other participants.
    pub display_name: String,
    /// Stable device id; a random one is generated when empty.
    pub client_id: String,
    pub policy: SyncPolicy,
}

impl ClientConfig {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            client_id: String::new(),
            policy: SyncPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = policy;
        self
    }
}
