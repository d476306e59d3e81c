/// Wire protocol version.
/// Bump this only for breaking changes to message shapes or semantics.
pub const TOGETHER_PROTOCOL_VERSION: u32 = 1;

/// Scheme of join links. Links are dialable WebSocket URLs.
pub const LINK_SCHEME: &str = "ws";

/// Path component of join links and of the host's WebSocket endpoint.
pub const LINK_PATH: &str = "/together";

/// Query parameter carrying the session id.
pub const LINK_SESSION_ID_PARAM: &str = "sid";

/// Query parameter carrying the session key.
pub const LINK_SESSION_KEY_PARAM: &str = "key";

/// Default TCP port a host listens on.
pub const DEFAULT_PORT: u16 = 42117;

/// Maximum accepted length of a display name, in characters.
/// Longer names are truncated by the host.
pub const MAX_DISPLAY_NAME_CHARS: usize = 64;
