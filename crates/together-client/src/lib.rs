//! Participant side of a listening session.
//!
//! Joins a host over WebSocket, keeps a clock estimate against the host's
//! logical clock and applies host-sequenced playback actions at the matching
//! local instant.
//!
//! # Architecture
//!
//! - [`client`]: connection setup, handshake and the [`TogetherClient`] handle
//! - [`handler`]: receive loop dispatching protocol messages
//! - [`scheduler`]: cancellable, deadline-ordered playback actions
//! - [`playback`]: the audio engine seen through [`PlaybackController`]
//! - [`session`]: connection state machine
//! - [`config`]: tunable sync policy
//! - [`error`]: error types

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod playback;
pub mod scheduler;
pub mod session;

pub use client::{TogetherClient, join_session};
pub use config::{ClientConfig, SyncPolicy};
pub use error::ClientError;
pub use handler::TogetherEvent;
pub use playback::PlaybackController;
pub use scheduler::{PlaybackScheduler, Scheduled};
pub use session::ConnectionState;
pub use together_proto::{ClockHealth, ClockSnapshot, ControlAction, JoinInfo};
