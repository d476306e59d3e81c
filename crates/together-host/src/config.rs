use std::net::SocketAddr;

use together_client::SyncPolicy;
use together_proto::constants::DEFAULT_PORT;

use crate::net::rate_limit::RateLimitConfig;

/// Host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Listen address. Port 0 picks an ephemeral port.
    pub bind: SocketAddr,
    /// Host written into the join link. Defaults to the bound IP, or loopback
    /// when bound to an unspecified address.
    pub advertise_host: Option<String>,
    /// Fixed session id; random when `None`.
    pub session_id: Option<String>,
    /// Fixed session key; random when `None`.
    pub session_key: Option<String>,
    pub policy: SyncPolicy,
    /// `None` disables rate limiting.
    pub rate_limit: Option<RateLimitConfig>,
    /// Whether participants may submit control actions.
    pub allow_guest_control: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            advertise_host: None,
            session_id: None,
            session_key: None,
            policy: SyncPolicy::default(),
            rate_limit: Some(RateLimitConfig::default()),
            allow_guest_control: true,
        }
    }
}

impl HostConfig {
    /// Loopback on an ephemeral port.
    pub fn local() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Self::default()
        }
    }
}
