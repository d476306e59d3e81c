#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use together_client::{
    ClientConfig, ClockHealth, JoinInfo, PlaybackController, SyncPolicy, TogetherClient,
    join_session,
};
use together_host::{HostConfig, HostHandle};
use together_proto::codec::{decode_message, encode_message};
use together_proto::messages::{ClientHello, ServerWelcome};
use together_proto::{ProtocolMessage, TOGETHER_PROTOCOL_VERSION};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

pub type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SeekAndPlay(String, u64),
    Pause,
    TrackChanged(String),
}

/// Playback controller that records every call.
#[derive(Default)]
pub struct Recorder {
    calls: Mutex<Vec<Call>>,
}

impl PlaybackController for Recorder {
    fn current_position(&self) -> u64 {
        0
    }

    fn seek_and_play(&self, track_id: &str, position_ms: u64, _at_local_ms: u64) {
        self.calls
            .lock()
            .push(Call::SeekAndPlay(track_id.to_owned(), position_ms));
    }

    fn pause(&self, _at_local_ms: u64) {
        self.calls.lock().push(Call::Pause);
    }

    fn on_track_changed(&self, track_id: &str) {
        self.calls.lock().push(Call::TrackChanged(track_id.to_owned()));
    }
}

impl Recorder {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Wait until at least `n` calls were recorded.
    pub async fn wait_for(&self, n: usize) -> Vec<Call> {
        tokio::time::timeout(WAIT, async {
            loop {
                if self.calls.lock().len() >= n {
                    return self.calls();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("controller calls")
    }
}

/// Fast pings so clock estimates exist within a few tens of milliseconds.
pub fn test_policy() -> SyncPolicy {
    SyncPolicy {
        ping_interval_ms: 50,
        handshake_timeout_ms: 1_000,
        ..SyncPolicy::default()
    }
}

pub fn test_config() -> HostConfig {
    HostConfig {
        policy: test_policy(),
        rate_limit: None,
        ..HostConfig::local()
    }
}

pub async fn start_host(config: HostConfig) -> HostHandle {
    let _ = tracing_subscriber::fmt::try_init();
    HostHandle::start(config, None).await.unwrap()
}

pub async fn join(info: &JoinInfo, name: &str) -> (TogetherClient, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let client = join_session(
        info,
        ClientConfig::new(name).with_policy(test_policy()),
        recorder.clone(),
    )
    .await
    .unwrap();
    (client, recorder)
}

/// Wait until the client has a fresh clock estimate against the host.
pub async fn wait_synced(client: &TogetherClient) {
    let mut health = client.observe_clock_health();
    tokio::time::timeout(WAIT, health.wait_for(|h| *h == ClockHealth::Synced))
        .await
        .expect("clock sync")
        .unwrap();
}

/// Poll the host until it reports `n` participants.
pub async fn wait_participants(host: &HostHandle, n: usize) {
    tokio::time::timeout(WAIT, async {
        loop {
            if host.participants().await.unwrap().len() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("participant count");
}

pub async fn connect_raw(info: &JoinInfo) -> RawWs {
    let (ws, _) = connect_async(info.websocket_url()).await.unwrap();
    ws
}

pub async fn send(ws: &mut RawWs, msg: impl Into<ProtocolMessage>) {
    let text = encode_message(&msg.into()).unwrap();
    ws.send(Message::text(text)).await.unwrap();
}

pub async fn send_text(ws: &mut RawWs, text: &str) {
    ws.send(Message::text(text.to_owned())).await.unwrap();
}

/// Next protocol message, skipping the host's clock pings. `None` once the
/// connection is closed.
pub async fn recv(ws: &mut RawWs) -> Option<ProtocolMessage> {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let msg = decode_message(text.as_str()).unwrap();
                    if matches!(msg, ProtocolMessage::Ping(_) | ProtocolMessage::Pong(_)) {
                        continue;
                    }
                    return Some(msg);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("frame from host")
}

pub fn hello(info: &JoinInfo, name: &str) -> ClientHello {
    ClientHello {
        protocol_version: TOGETHER_PROTOCOL_VERSION,
        session_id: info.session_id().to_owned(),
        session_key: info.session_key().to_owned(),
        client_id: format!("{name}-device"),
        display_name: name.to_owned(),
    }
}

/// Raw handshake. Consumes the welcome and the initial session state.
pub async fn raw_join(info: &JoinInfo, name: &str) -> (RawWs, ServerWelcome) {
    let mut ws = connect_raw(info).await;
    send(&mut ws, hello(info, name)).await;
    let Some(ProtocolMessage::ServerWelcome(welcome)) = recv(&mut ws).await else {
        panic!("expected ServerWelcome");
    };
    let Some(ProtocolMessage::SessionState(_)) = recv(&mut ws).await else {
        panic!("expected SessionState");
    };
    (ws, welcome)
}

/// Read until the host closes the connection.
pub async fn expect_closed(ws: &mut RawWs) {
    while recv(ws).await.is_some() {}
}
