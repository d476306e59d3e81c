//! Routing of decoded participant messages to their handlers.

pub mod error;
pub mod handlers;
