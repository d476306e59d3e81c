use std::sync::atomic::{AtomicU64, Ordering};

use std::net::SocketAddr;
use together_client::ConnectionState;
use together_proto::{ClockSnapshot, ProtocolMessage};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::outbound::OutboundTx;

/// Unique connection identifier assigned by the host.
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_conn_id() -> ConnId {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Events produced by connection tasks for the session actor.
///
/// - `Connected` is emitted once per accepted WebSocket, carrying the
///   handles the actor uses to talk to and close the connection.
/// - `Message` is emitted for every decoded frame the connection task does
///   not answer itself.
/// - `ClockSample` carries the connection's refreshed clock estimate.
/// - `Disconnected` is emitted when the connection task exits.
#[derive(Debug)]
pub enum InboundEvent {
    Connected {
        conn_id: ConnId,
        peer: SocketAddr,
        outbound: OutboundTx,
        cancel_token: CancellationToken,
        /// Written by the actor; read by the connection task.
        phase: watch::Sender<ConnectionState>,
    },

    Message {
        conn_id: ConnId,
        message: ProtocolMessage,
    },

    ClockSample {
        conn_id: ConnId,
        snapshot: ClockSnapshot,
    },

    Disconnected {
        conn_id: ConnId,
        peer: SocketAddr,
        /// Best-effort human-readable reason (logging/debug).
        reason: String,
    },
}
