//! Session state owned by the session actor.

pub mod state;

pub use state::{Participant, ParticipantInfo, Session};
