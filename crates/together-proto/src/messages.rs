use serde::{Deserialize, Serialize};

pub mod control;
pub mod session;
pub mod sync;

pub use control::{ControlAction, ControlBroadcast, ControlRequest};
pub use session::{
    ClientHello, ClientLeave, ErrorCode, ErrorMsg, Kicked, ParticipantJoined, ParticipantLeft,
    ServerWelcome, SessionState,
};
pub use sync::{Ping, Pong};

/// Declares the closed set of protocol messages.
///
/// Expands to the [`ProtocolMessage`] sum type (JSON-tagged by variant name,
/// or by the `= "Name"` override) and a `From` conversion for every payload
/// struct, so handlers can build a concrete payload and send it with `.into()`.
macro_rules! define_protocol {
    ($($variant:ident $(= $wire:literal)?),* $(,)?) => {
        /// Every frame on the wire is exactly one of these variants.
        ///
        /// Serialized as a JSON object whose `type` field names the variant.
        #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, strum::IntoStaticStr)]
        #[serde(tag = "type")]
        pub enum ProtocolMessage {
            $(
                $(#[serde(rename = $wire)] #[strum(serialize = $wire)])?
                $variant($variant),
            )*
        }

        $(
            impl From<$variant> for ProtocolMessage {
                fn from(msg: $variant) -> Self {
                    ProtocolMessage::$variant(msg)
                }
            }
        )*
    };
}

define_protocol! {
    ClientHello,
    ServerWelcome,
    SessionState,
    Ping,
    Pong,
    ControlRequest,
    ControlBroadcast,
    ParticipantJoined,
    ParticipantLeft,
    ClientLeave,
    Kicked,
    ErrorMsg = "Error",
}

impl ProtocolMessage {
    /// Variant name, used as a structured logging field.
    pub fn kind(&self) -> &'static str {
        self.into()
    }

    /// Session id the message refers to, if it carries one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ProtocolMessage::ClientHello(m) => Some(&m.session_id),
            ProtocolMessage::ServerWelcome(m) => Some(&m.session_id),
            ProtocolMessage::SessionState(m) => Some(&m.session_id),
            ProtocolMessage::ControlRequest(m) => Some(&m.session_id),
            ProtocolMessage::ControlBroadcast(m) => Some(&m.session_id),
            ProtocolMessage::ParticipantJoined(m) => Some(&m.session_id),
            ProtocolMessage::ParticipantLeft(m) => Some(&m.session_id),
            ProtocolMessage::ClientLeave(m) => Some(&m.session_id),
            ProtocolMessage::Kicked(m) => Some(&m.session_id),
            ProtocolMessage::Ping(_) | ProtocolMessage::Pong(_) | ProtocolMessage::ErrorMsg(_) => {
                None
            }
        }
    }
}
