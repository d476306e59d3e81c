#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use together_client::{
    ClientConfig, ClientError, ClockHealth, ConnectionState, ControlAction, JoinInfo,
    PlaybackController, SyncPolicy, TogetherClient, TogetherEvent, join_session,
};
use together_proto::codec::{decode_message, encode_message};
use together_proto::messages::{ControlBroadcast, ErrorMsg, Pong, ServerWelcome, SessionState};
use together_proto::{
    ElapsedClock, ErrorCode, ProtoError, ProtocolMessage, TOGETHER_PROTOCOL_VERSION,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

const SID: &str = "fake-session";
const WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    SeekAndPlay(String, u64),
    Pause,
    TrackChanged(String),
}

#[derive(Default)]
struct Recorder {
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
    async fn wait_for(&self, n: usize) -> Vec<Call> {
        tokio::time::timeout(WAIT, async {
            loop {
                if self.calls.lock().len() >= n {
                    return self.calls.lock().clone();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("controller calls")
    }
}

/// How the scripted host answers the handshake.
#[derive(Clone, Copy)]
enum Handshake {
    Welcome { version: u32 },
    Reject,
    Silent,
}

/// How the fake host treats the participant's pings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pongs {
    Ignore,
    Answer,
    /// Answer with a bogus arrival stamp the participant must not use.
    ForgedArrival,
}

const WELCOME: Handshake = Handshake::Welcome {
    version: TOGETHER_PROTOCOL_VERSION,
};

async fn send(ws: &mut WebSocketStream<TcpStream>, msg: ProtocolMessage) {
    let _ = ws.send(Message::text(encode_message(&msg).unwrap())).await;
}

/// Minimal scripted host: one connection, optional ping answers, and a
/// channel for pushing frames to the participant.
struct FakeHost {
    info: JoinInfo,
    clock: ElapsedClock,
    push: mpsc::Sender<ProtocolMessage>,
    received: mpsc::Receiver<ProtocolMessage>,
}

impl FakeHost {
    async fn start(handshake: Handshake, pongs: Pongs) -> Self {
        let _ = tracing_subscriber::fmt::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let clock = ElapsedClock::new();
        let (push, mut push_rx) = mpsc::channel::<ProtocolMessage>(16);
        let (seen_tx, received) = mpsc::channel(64);

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            loop {
                tokio::select! {
                    frame = ws.next() => {
                        let Some(Ok(Message::Text(text))) = frame else {
                            break;
                        };
                        let msg = decode_message(text.as_str()).unwrap();
                        match &msg {
                            ProtocolMessage::ClientHello(_) => match handshake {
                                Handshake::Welcome { version } => {
                                    let welcome = ServerWelcome {
                                        protocol_version: version,
                                        session_id: SID.into(),
                                        participant_id: "p1".into(),
                                        host_logical_ms: clock.now_ms(),
                                    };
                                    send(&mut ws, welcome.into()).await;
                                    let state = SessionState {
                                        session_id: SID.into(),
                                        current_track_id: None,
                                        current_position_ms: 0,
                                        is_playing: false,
                                        host_logical_ms: clock.now_ms(),
                                    };
                                    send(&mut ws, state.into()).await;
                                }
                                Handshake::Reject => {
                                    let err = ErrorMsg::new(
                                        ErrorCode::AuthenticationFailed,
                                        "authentication failed",
                                    );
                                    send(&mut ws, err.into()).await;
                                    let _ = ws.close(None).await;
                                }
                                Handshake::Silent => {}
                            },
                            ProtocolMessage::Ping(ping) if pongs != Pongs::Ignore => {
                                let mut pong = Pong::answer(*ping, clock.now_ms());
                                if pongs == Pongs::ForgedArrival {
                                    pong.received_at_elapsed_ms = Some(0);
                                }
                                send(&mut ws, pong.into()).await;
                            }
                            _ => {}
                        }
                        let _ = seen_tx.try_send(msg);
                    }
                    msg = push_rx.recv() => {
                        let Some(msg) = msg else {
                            let _ = ws.close(None).await;
                            break;
                        };
                        send(&mut ws, msg).await;
                    }
                }
            }
        });

        Self {
            info: JoinInfo::new("127.0.0.1", port, SID, "key").unwrap(),
            clock,
            push,
            received,
        }
    }

    async fn broadcast(&self, action: ControlAction, in_ms: u64) {
        let msg = ControlBroadcast {
            session_id: SID.into(),
            origin_participant_id: "host".into(),
            action,
            effective_at_logical_ms: self.clock.now_ms() + in_ms,
        };
        self.push.send(msg.into()).await.unwrap();
    }

    /// Next non-clock message received from the participant.
    async fn next_received(&mut self) -> ProtocolMessage {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.received.recv().await.unwrap() {
                    ProtocolMessage::Ping(_) | ProtocolMessage::Pong(_) => continue,
                    msg => return msg,
                }
            }
        })
        .await
        .expect("message from participant")
    }
}

fn policy() -> SyncPolicy {
    SyncPolicy {
        ping_interval_ms: 50,
        handshake_timeout_ms: 500,
        ..SyncPolicy::default()
    }
}

async fn join(host: &FakeHost) -> Result<(TogetherClient, Arc<Recorder>), ClientError> {
    let recorder = Arc::new(Recorder::default());
    let client = join_session(
        &host.info,
        ClientConfig::new("tester").with_policy(policy()),
        recorder.clone(),
    )
    .await?;
    Ok((client, recorder))
}

async fn next_event(
    events: &mut mpsc::Receiver<TogetherEvent>,
    pred: impl Fn(&TogetherEvent) -> bool,
) -> TogetherEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event")
}

#[tokio::test]
async fn missing_clock_applies_immediately_and_warns() {
    let host = FakeHost::start(WELCOME, Pongs::Ignore).await;
    let (client, recorder) = join(&host).await.unwrap();
    let mut events = client.events().unwrap();

    let welcome = next_event(&mut events, |e| matches!(e, TogetherEvent::Welcome { .. })).await;
    assert_eq!(
        welcome,
        TogetherEvent::Welcome {
            participant_id: "p1".into()
        }
    );
    assert_eq!(client.participant_id(), "p1");

    // Far in the future: only runs now because there is no clock estimate.
    host.broadcast(
        ControlAction::ChangeTrack {
            track_id: "t".into(),
        },
        60_000,
    )
    .await;

    let event = next_event(&mut events, |e| matches!(e, TogetherEvent::OutOfSync { .. })).await;
    assert!(matches!(
        event,
        TogetherEvent::OutOfSync {
            action: ControlAction::ChangeTrack { .. }
        }
    ));
    assert_eq!(
        recorder.wait_for(2).await,
        vec![Call::TrackChanged("t".into()), Call::SeekAndPlay("t".into(), 0)]
    );
    assert_eq!(*client.observe_clock_health().borrow(), ClockHealth::Degraded);
    assert_eq!(client.connection_state(), ConnectionState::Degraded);
}

#[tokio::test]
async fn synced_clock_schedules_at_deadline() {
    let host = FakeHost::start(WELCOME, Pongs::Answer).await;
    let (client, recorder) = join(&host).await.unwrap();
    let mut events = client.events().unwrap();

    let mut health = client.observe_clock_health();
    tokio::time::timeout(WAIT, health.wait_for(|h| *h == ClockHealth::Synced))
        .await
        .unwrap()
        .unwrap();
    assert!(client.clock_snapshot().is_some());
    assert_eq!(client.connection_state(), ConnectionState::Synced);

    host.broadcast(
        ControlAction::SeekToTrack {
            track_id: "t".into(),
            position_ms: 3_000,
        },
        300,
    )
    .await;

    let event = next_event(&mut events, |e| {
        matches!(
            e,
            TogetherEvent::ActionScheduled { .. } | TogetherEvent::OutOfSync { .. }
        )
    })
    .await;
    let TogetherEvent::ActionScheduled {
        local_deadline_ms, ..
    } = event
    else {
        panic!("expected ActionScheduled, got {event:?}");
    };
    assert!(local_deadline_ms > client.scheduler().clock().now_ms());
    assert_eq!(client.scheduler().pending(), 1);

    assert_eq!(
        recorder.wait_for(2).await,
        vec![
            Call::TrackChanged("t".into()),
            Call::SeekAndPlay("t".into(), 3_000)
        ]
    );
    assert!(client.scheduler().clock().now_ms() >= local_deadline_ms);
}

#[tokio::test]
async fn pong_arrival_is_stamped_locally() {
    let host = FakeHost::start(WELCOME, Pongs::ForgedArrival).await;
    let (client, _recorder) = join(&host).await.unwrap();

    let mut health = client.observe_clock_health();
    tokio::time::timeout(WAIT, health.wait_for(|h| *h == ClockHealth::Synced))
        .await
        .unwrap()
        .unwrap();
    let snapshot = client.clock_snapshot().unwrap();
    assert!(snapshot.estimated_rtt_ms < 1_000, "{snapshot:?}");
}

#[tokio::test]
async fn newer_broadcast_supersedes_pending_one() {
    let host = FakeHost::start(WELCOME, Pongs::Answer).await;
    let (client, recorder) = join(&host).await.unwrap();
    let mut health = client.observe_clock_health();
    tokio::time::timeout(WAIT, health.wait_for(|h| *h == ClockHealth::Synced))
        .await
        .unwrap()
        .unwrap();

    host.broadcast(
        ControlAction::ChangeTrack {
            track_id: "a".into(),
        },
        400,
    )
    .await;
    host.broadcast(
        ControlAction::ChangeTrack {
            track_id: "b".into(),
        },
        450,
    )
    .await;

    assert_eq!(
        recorder.wait_for(2).await,
        vec![Call::TrackChanged("b".into()), Call::SeekAndPlay("b".into(), 0)]
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(recorder.calls.lock().len(), 2);
}

#[tokio::test]
async fn rejection_is_reported() {
    let host = FakeHost::start(Handshake::Reject, Pongs::Ignore).await;
    let err = join(&host).await.err().expect("join must fail");
    assert!(matches!(
        err,
        ClientError::Rejected {
            code: ErrorCode::AuthenticationFailed,
            ..
        }
    ));
}

#[tokio::test]
async fn silent_host_times_out() {
    let host = FakeHost::start(Handshake::Silent, Pongs::Ignore).await;
    let err = join(&host).await.err().expect("join must fail");
    assert!(matches!(err, ClientError::HandshakeTimeout));
}

#[tokio::test]
async fn version_mismatch_is_refused() {
    let host = FakeHost::start(Handshake::Welcome { version: 99 }, Pongs::Ignore).await;
    let err = join(&host).await.err().expect("join must fail");
    assert!(matches!(
        err,
        ClientError::Protocol(ProtoError::UnsupportedVersion(99))
    ));
}

#[tokio::test]
async fn leave_says_goodbye_and_closes() {
    let mut host = FakeHost::start(WELCOME, Pongs::Answer).await;
    let (client, _recorder) = join(&host).await.unwrap();
    assert!(matches!(
        host.next_received().await,
        ProtocolMessage::ClientHello(_)
    ));

    client.submit_control_action(ControlAction::Pause).await.unwrap();
    let ProtocolMessage::ControlRequest(request) = host.next_received().await else {
        panic!("expected ControlRequest");
    };
    assert_eq!(request.participant_id, "p1");
    assert_eq!(request.session_id, SID);

    let err = client
        .submit_control_action(ControlAction::Seek { position_ms: -1 })
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidAction(_)));

    client.leave().await;
    let ProtocolMessage::ClientLeave(leave) = host.next_received().await else {
        panic!("expected ClientLeave");
    };
    assert_eq!(leave.participant_id, "p1");
    assert_eq!(client.connection_state(), ConnectionState::Closed);
    assert!(matches!(
        client.submit_control_action(ControlAction::Play).await,
        Err(ClientError::NotConnected)
    ));
}

#[tokio::test]
async fn host_going_away_disconnects() {
    let host = FakeHost::start(WELCOME, Pongs::Answer).await;
    let (client, _recorder) = join(&host).await.unwrap();
    let mut events = client.events().unwrap();
    let mut state = client.observe_connection_state();

    drop(host);

    next_event(&mut events, |e| matches!(e, TogetherEvent::Disconnected { .. })).await;
    tokio::time::timeout(WAIT, state.wait_for(|s| s.is_closed()))
        .await
        .unwrap()
        .unwrap();
}
