//! Join link codec.
//!
//! A join link is a dialable WebSocket URL:
//! `ws://<host>:<port>/together?sid=<session id>&key=<session key>`.
//! Encoding and decoding are pure; decoding never fails loudly, it returns
//! `None` and lets the caller decide how to report a bad link.

use std::fmt;
use std::net::IpAddr;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use thiserror::Error;
use url::{Host, Url};

use crate::constants::{LINK_PATH, LINK_SCHEME, LINK_SESSION_ID_PARAM, LINK_SESSION_KEY_PARAM};
use crate::limits::MAX_TOKEN_BYTES;

/// Everything kept verbatim in query values (RFC 3986 unreserved).
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("host is neither an IP literal nor a hostname")]
    InvalidHost,
    #[error("port must be in 1..=65535")]
    InvalidPort,
    #[error("session id must be non-empty and at most {MAX_TOKEN_BYTES} bytes")]
    InvalidSessionId,
    #[error("session key must be non-empty and at most {MAX_TOKEN_BYTES} bytes")]
    InvalidSessionKey,
}

/// Where and how to join a session.
///
/// Immutable once built. Hostnames are stored lower-cased and IP literals in
/// their canonical textual form, so two values describing the same endpoint
/// compare equal.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct JoinInfo {
    host: String,
    port: u16,
    session_id: String,
    session_key: String,
}

impl JoinInfo {
    pub fn new(
        host: impl AsRef<str>,
        port: u16,
        session_id: impl Into<String>,
        session_key: impl Into<String>,
    ) -> Result<Self, LinkError> {
        let host = normalize_host(host.as_ref()).ok_or(LinkError::InvalidHost)?;
        if port == 0 {
            return Err(LinkError::InvalidPort);
        }
        let session_id = session_id.into();
        if !token_ok(&session_id) {
            return Err(LinkError::InvalidSessionId);
        }
        let session_key = session_key.into();
        if !token_ok(&session_key) {
            return Err(LinkError::InvalidSessionKey);
        }
        Ok(Self {
            host,
            port,
            session_id,
            session_key,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// The join link.
    pub fn to_link(&self) -> String {
        encode(self)
    }

    /// URL to dial. The join link already is one.
    pub fn websocket_url(&self) -> String {
        encode(self)
    }
}

// The session key is a credential; keep it out of logs.
impl fmt::Debug for JoinInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("session_id", &self.session_id)
            .field("session_key", &"<redacted>")
            .finish()
    }
}

/// Encode `info` as a join link.
pub fn encode(info: &JoinInfo) -> String {
    let host = match info.host.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("[{v6}]"),
        _ => info.host.clone(),
    };
    format!(
        "{LINK_SCHEME}://{host}:{port}{LINK_PATH}?{LINK_SESSION_ID_PARAM}={sid}&{LINK_SESSION_KEY_PARAM}={key}",
        port = info.port,
        sid = utf8_percent_encode(&info.session_id, QUERY_VALUE),
        key = utf8_percent_encode(&info.session_key, QUERY_VALUE),
    )
}

/// Decode a join link. Returns `None` on any malformed input.
pub fn decode(link: &str) -> Option<JoinInfo> {
    let link = link.trim();
    if !link
        .strip_prefix(LINK_SCHEME)
        .is_some_and(|rest| rest.starts_with("://"))
    {
        return None;
    }

    let url = Url::parse(link).ok()?;
    if url.scheme() != LINK_SCHEME || url.path() != LINK_PATH {
        return None;
    }
    if !url.username().is_empty() || url.password().is_some() {
        return None;
    }

    let host = match url.host()? {
        Host::Domain(domain) => domain.to_string(),
        Host::Ipv4(v4) => v4.to_string(),
        Host::Ipv6(v6) => v6.to_string(),
    };
    let port = url.port_or_known_default()?;

    let mut session_id = None;
    let mut session_key = None;
    for (name, value) in url.query_pairs() {
        match name.as_ref() {
            LINK_SESSION_ID_PARAM => session_id = Some(value.into_owned()),
            LINK_SESSION_KEY_PARAM => session_key = Some(value.into_owned()),
            _ => {}
        }
    }

    JoinInfo::new(host, port, session_id?, session_key?).ok()
}

fn token_ok(token: &str) -> bool {
    !token.is_empty() && token.len() <= MAX_TOKEN_BYTES
}

fn normalize_host(host: &str) -> Option<String> {
    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Some(ip.to_string());
    }
    if bare.is_empty() || bare.len() > 253 {
        return None;
    }

    for label in bare.split('.') {
        let bytes = label.as_bytes();
        if bytes.is_empty() || bytes.len() > 63 {
            return None;
        }
        if !bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-') {
            return None;
        }
        if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
            return None;
        }
    }

    // The link must survive the URL parser unchanged: numeric last labels
    // read as IPv4 and IDNA rejects malformed `xn--` labels.
    let lower = bare.to_ascii_lowercase();
    match Host::parse(&lower) {
        Ok(Host::Domain(domain)) if domain == lower => Some(lower),
        _ => None,
    }
}
