#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use together_client::{ConnectionState, ControlAction, TogetherEvent};
use together_host::{HostError, HostHandle};
use together_proto::{ErrorCode, ProtocolMessage};

#[tokio::test]
async fn participants_converge_on_host_action() {
    let _ = tracing_subscriber::fmt::try_init();
    let host_player = Arc::new(Recorder::default());
    let host = HostHandle::start(test_config(), Some(host_player.clone()))
        .await
        .unwrap();
    let info = host.join_info().clone();

    let (a, rec_a) = join(&info, "alice").await;
    let (b, rec_b) = join(&info, "bob").await;
    wait_synced(&a).await;
    wait_synced(&b).await;
    let mut events_a = a.events().unwrap();
    assert!(a.events().is_none(), "events can only be taken once");

    let effective_at = host
        .submit_control_action(ControlAction::SeekToTrack {
            track_id: "trackA".into(),
            position_ms: 10_000,
        })
        .await
        .unwrap();

    let expected = vec![
        Call::TrackChanged("trackA".into()),
        Call::SeekAndPlay("trackA".into(), 10_000),
    ];
    assert_eq!(rec_a.wait_for(2).await, expected);
    assert_eq!(rec_b.wait_for(2).await, expected);
    assert_eq!(host_player.wait_for(2).await, expected);

    // Exactly one seek_and_play per receiver.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rec_a.calls().len(), 2);
    assert_eq!(rec_b.calls().len(), 2);

    let scheduled = tokio::time::timeout(WAIT, async {
        loop {
            match events_a.recv().await.unwrap() {
                TogetherEvent::ActionScheduled { action, .. } => return action,
                TogetherEvent::OutOfSync { .. } => panic!("clock was synced"),
                _ => continue,
            }
        }
    })
    .await
    .unwrap();
    assert!(matches!(scheduled, ControlAction::SeekToTrack { .. }));

    let snapshot = host.session_snapshot().await.unwrap();
    assert_eq!(snapshot.current_track_id.as_deref(), Some("trackA"));
    assert!(snapshot.is_playing);
    assert!(snapshot.host_logical_ms >= effective_at);

    host.shutdown().await;
}

#[tokio::test]
async fn participant_request_reaches_everyone() {
    let host = start_host(test_config()).await;
    let info = host.join_info().clone();
    let (a, _rec_a) = join(&info, "alice").await;
    let (b, rec_b) = join(&info, "bob").await;
    wait_synced(&b).await;

    a.submit_control_action(ControlAction::ChangeTrack {
        track_id: "next".into(),
    })
    .await
    .unwrap();

    assert_eq!(
        rec_b.wait_for(2).await,
        vec![
            Call::TrackChanged("next".into()),
            Call::SeekAndPlay("next".into(), 0)
        ]
    );
    let snapshot = host.session_snapshot().await.unwrap();
    assert_eq!(snapshot.current_track_id.as_deref(), Some("next"));

    a.submit_control_action(ControlAction::Pause).await.unwrap();
    let calls = rec_b.wait_for(3).await;
    assert_eq!(calls[2], Call::Pause);
    assert!(!host.session_snapshot().await.unwrap().is_playing);
}

#[tokio::test]
async fn paused_joiner_resumes_at_session_position() {
    let host = start_host(test_config()).await;
    let info = host.join_info().clone();

    host.submit_control_action(ControlAction::SeekToTrack {
        track_id: "t".into(),
        position_ms: 5_000,
    })
    .await
    .unwrap();
    host.submit_control_action(ControlAction::Pause)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    let paused = host.session_snapshot().await.unwrap();
    assert!(!paused.is_playing);

    let (client, rec) = join(&info, "late").await;
    assert_eq!(
        rec.wait_for(2).await,
        vec![Call::TrackChanged("t".into()), Call::Pause]
    );
    wait_synced(&client).await;

    host.submit_control_action(ControlAction::Play)
        .await
        .unwrap();
    let calls = rec.wait_for(3).await;
    assert_eq!(
        calls[2],
        Call::SeekAndPlay("t".into(), paused.current_position_ms)
    );
}

#[tokio::test]
async fn late_joiner_receives_current_state() {
    let host = start_host(test_config()).await;
    let info = host.join_info().clone();

    host.submit_control_action(ControlAction::SeekToTrack {
        track_id: "t".into(),
        position_ms: 5_000,
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let mut ws = connect_raw(&info).await;
    send(&mut ws, hello(&info, "late")).await;
    assert!(matches!(
        recv(&mut ws).await,
        Some(ProtocolMessage::ServerWelcome(_))
    ));
    let Some(ProtocolMessage::SessionState(state)) = recv(&mut ws).await else {
        panic!("expected SessionState");
    };
    assert_eq!(state.session_id, info.session_id());
    assert_eq!(state.current_track_id.as_deref(), Some("t"));
    assert!(state.is_playing);
    // The track has been playing for roughly 250 ms.
    assert!(state.current_position_ms > 5_000);
    assert!(state.current_position_ms < 5_000 + 2_000);
}

#[tokio::test]
async fn late_joining_client_starts_playback() {
    let host = start_host(test_config()).await;
    let info = host.join_info().clone();
    host.submit_control_action(ControlAction::SeekToTrack {
        track_id: "t".into(),
        position_ms: 1_000,
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (_client, rec) = join(&info, "late").await;
    let calls = rec.wait_for(2).await;
    assert_eq!(calls[0], Call::TrackChanged("t".into()));
    let Call::SeekAndPlay(track, position) = &calls[1] else {
        panic!("expected SeekAndPlay, got {calls:?}");
    };
    assert_eq!(track, "t");
    assert!(*position >= 1_000);
}

#[tokio::test]
async fn membership_changes_are_announced() {
    let host = start_host(test_config()).await;
    let info = host.join_info().clone();

    let (mut observer, _) = raw_join(&info, "observer").await;
    let (client, _rec) = join(&info, "  Ada \n").await;

    let Some(ProtocolMessage::ParticipantJoined(joined)) = recv(&mut observer).await else {
        panic!("expected ParticipantJoined");
    };
    assert_eq!(joined.participant_id, client.participant_id());
    assert_eq!(joined.display_name, "Ada");

    wait_participants(&host, 2).await;
    let participants = host.participants().await.unwrap();
    assert_eq!(participants[0].display_name, "observer");
    assert_eq!(participants[1].display_name, "Ada");
    assert!(participants[1].state.is_established());

    client.leave().await;
    assert_eq!(client.connection_state(), ConnectionState::Closed);

    let Some(ProtocolMessage::ParticipantLeft(left)) = recv(&mut observer).await else {
        panic!("expected ParticipantLeft");
    };
    assert_eq!(left.participant_id, client.participant_id());
    wait_participants(&host, 1).await;
}

#[tokio::test]
async fn kick_disconnects_participant() {
    let host = start_host(test_config()).await;
    let info = host.join_info().clone();
    let (client, _rec) = join(&info, "mallory").await;
    let mut events = client.events().unwrap();

    host.kick(client.participant_id(), Some("bye".into()))
        .await
        .unwrap();

    let mut kicked = false;
    let disconnected = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(TogetherEvent::Kicked { reason, banned }) => {
                    assert_eq!(reason.as_deref(), Some("bye"));
                    assert!(!banned);
                    kicked = true;
                }
                Some(TogetherEvent::Disconnected { .. }) | None => return,
                Some(_) => {}
            }
        }
    })
    .await;
    assert!(disconnected.is_ok());
    assert!(kicked);
    assert!(client.connection_state().is_closed());
    wait_participants(&host, 0).await;

    let err = host.kick("p99", None).await.unwrap_err();
    assert!(matches!(err, HostError::UnknownParticipant(id) if id == "p99"));
}

#[tokio::test]
async fn shutdown_disconnects_everyone() {
    let host = start_host(test_config()).await;
    let info = host.join_info().clone();
    let (mut ws, _) = raw_join(&info, "solo").await;

    host.shutdown().await;
    expect_closed(&mut ws).await;
    assert!(matches!(
        host.participants().await,
        Err(HostError::Closed)
    ));
}

#[tokio::test]
async fn banned_client_cannot_rejoin() {
    let host = start_host(test_config()).await;
    let info = host.join_info().clone();
    let (mut ws, welcome) = raw_join(&info, "eve").await;

    host.ban(welcome.participant_id.as_str(), None).await.unwrap();
    let kicked = loop {
        match recv(&mut ws).await {
            Some(ProtocolMessage::Kicked(kicked)) => break kicked,
            Some(_) => continue,
            None => panic!("closed without Kicked"),
        }
    };
    assert!(kicked.banned);
    expect_closed(&mut ws).await;
    wait_participants(&host, 0).await;

    let mut again = connect_raw(&info).await;
    send(&mut again, hello(&info, "eve")).await;
    let Some(ProtocolMessage::ErrorMsg(err)) = recv(&mut again).await else {
        panic!("expected an error");
    };
    assert_eq!(err.code, ErrorCode::AuthenticationFailed);
    expect_closed(&mut again).await;

    // Other devices are unaffected.
    raw_join(&info, "frank").await;
    wait_participants(&host, 1).await;

    let err = host.ban("p99", None).await.unwrap_err();
    assert!(matches!(err, HostError::UnknownParticipant(id) if id == "p99"));
}
