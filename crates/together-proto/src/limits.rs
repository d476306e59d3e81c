//! Message size limits for the together protocol.
//!
//! Every frame is a single small JSON object; nothing in the protocol carries
//! bulk data, so one limit applies to all message kinds.

/// Maximum size of a single encoded frame (16 KiB).
pub const MAX_FRAME_BYTES: usize = 16 * 1024;

/// Maximum size of a session id or session key, in bytes.
pub const MAX_TOKEN_BYTES: usize = 256;

/// Maximum size of a track id, in bytes.
pub const MAX_TRACK_ID_BYTES: usize = 512;

/// Returns `true` if an encoded frame of `len` bytes may be sent or accepted.
#[inline]
pub const fn frame_fits(len: usize) -> bool {
    len <= MAX_FRAME_BYTES
}
