use together_proto::ClockHealth;

/// Per-connection state machine.
///
/// `Connecting -> Handshaking -> Synced <-> Degraded -> Closed`.
/// `Synced` and `Degraded` differ only in clock-sample freshness; both apply
/// control broadcasts. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Connecting,
    Handshaking,
    Synced,
    Degraded,
    Closed,
}

impl ConnectionState {
    /// Handshake done and not yet closed.
    pub fn is_established(self) -> bool {
        matches!(self, ConnectionState::Synced | ConnectionState::Degraded)
    }

    pub fn is_closed(self) -> bool {
        self == ConnectionState::Closed
    }

    /// Next state after a clock-health evaluation. Only established
    /// connections move; other states are kept as-is.
    pub fn with_health(self, health: ClockHealth) -> Self {
        match (self, health) {
            (s, _) if !s.is_established() => s,
            (_, ClockHealth::Synced) => ConnectionState::Synced,
            (_, ClockHealth::Degraded) => ConnectionState::Degraded,
        }
    }

    /// Apply `next` unless the machine already reached `Closed`.
    pub fn advance(&mut self, next: ConnectionState) -> bool {
        if self.is_closed() || *self == next {
            return false;
        }
        *self = next;
        true
    }
}
