use serde::{Deserialize, Serialize};

/// Clock probe. Either side may send it; the receiver answers with a [`Pong`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    /// Sender's elapsed clock when the ping left.
    pub sent_at_elapsed_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Pong {
    /// Echo of [`Ping::sent_at_elapsed_ms`].
    pub sent_at_elapsed_ms: u64,
    /// Responder's elapsed clock when the ping arrived.
    pub server_elapsed_ms: u64,
    /// Never sent by this crate. Receivers ignore it and stamp arrival with
    /// their own clock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at_elapsed_ms: Option<u64>,
}

impl Pong {
    /// Build the answer to `ping`, stamped with the responder's clock.
    pub fn answer(ping: Ping, server_elapsed_ms: u64) -> Self {
        Self {
            sent_at_elapsed_ms: ping.sent_at_elapsed_ms,
            server_elapsed_ms,
            received_at_elapsed_ms: None,
        }
    }
}
