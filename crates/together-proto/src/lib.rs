//! Wire model for synchronized listening sessions.
//!
//! - [`link`]: join link codec (`ws://host:port/together?sid=..&key=..`)
//! - [`messages`]: tagged protocol messages exchanged as JSON frames
//! - [`codec`]: frame encoding/decoding with size limits
//! - [`clock`]: ping/pong based clock offset estimation

pub mod clock;
pub mod codec;
pub mod constants;
pub mod error;
pub mod limits;
pub mod link;
pub mod messages;

pub use clock::{ClockConfig, ClockEstimator, ClockHealth, ClockSnapshot, ElapsedClock};
pub use constants::TOGETHER_PROTOCOL_VERSION;
pub use error::ProtoError;
pub use link::JoinInfo;
pub use messages::{ControlAction, ErrorCode, ProtocolMessage};
