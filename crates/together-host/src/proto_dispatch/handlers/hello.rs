use ring::digest;
use together_client::ConnectionState;
use together_proto::constants::MAX_DISPLAY_NAME_CHARS;
use together_proto::messages::{ClientHello, ParticipantJoined, ServerWelcome};
use together_proto::{ProtocolMessage, TOGETHER_PROTOCOL_VERSION};
use tracing::{info, warn};

use crate::SessionActor;
use crate::net::inbound::ConnId;
use crate::net::outbound::broadcast;
use crate::proto_dispatch::error::{HandlerError, HandlerResult};
use crate::session::Participant;

pub(crate) fn handle(
    actor: &mut SessionActor,
    conn_id: ConnId,
    hello: ClientHello,
) -> HandlerResult {
    if hello.protocol_version != TOGETHER_PROTOCOL_VERSION {
        warn!(
            conn_id,
            version = hello.protocol_version,
            expected = TOGETHER_PROTOCOL_VERSION,
            "handshake with unsupported protocol version"
        );
        return Err(HandlerError::authentication_failed());
    }
    if hello.session_id != actor.session.session_id {
        warn!(conn_id, session_id = %hello.session_id, "handshake for unknown session");
        return Err(HandlerError::authentication_failed());
    }
    if !key_matches(&actor.session.session_key, &hello.session_key) {
        warn!(conn_id, "handshake with wrong session key");
        return Err(HandlerError::authentication_failed());
    }
    if actor.session.banned_clients.contains(&hello.client_id) {
        warn!(conn_id, client_id = %hello.client_id, "handshake from banned client");
        return Err(HandlerError::authentication_failed());
    }

    let participant_id = actor.next_participant_id();
    let display_name = clean_display_name(&hello.display_name, &participant_id);
    let now = actor.clock.now_ms();

    // Established before the welcome leaves, so the connection task already
    // answers the participant's first ping itself.
    let Some(ctx) = actor.conns.get_mut(&conn_id) else {
        return Ok(());
    };
    ctx.participant_id = Some(participant_id.clone());
    ctx.phase
        .send_if_modified(|phase| phase.advance(ConnectionState::Synced));
    let peer = ctx.peer;

    let welcome = ProtocolMessage::from(ServerWelcome {
        protocol_version: TOGETHER_PROTOCOL_VERSION,
        session_id: actor.session.session_id.clone(),
        participant_id: participant_id.clone(),
        host_logical_ms: now,
    });
    let state = ProtocolMessage::from(actor.session.snapshot(now));
    actor.send_to(conn_id, &welcome);
    actor.send_to(conn_id, &state);

    actor.session.participants.insert(
        participant_id.clone(),
        Participant {
            participant_id: participant_id.clone(),
            display_name: display_name.clone(),
            client_id: hello.client_id.clone(),
            conn_id,
            last_clock_snapshot: None,
            joined_at_elapsed_ms: now,
        },
    );
    info!(
        conn_id,
        %peer,
        %participant_id,
        %display_name,
        client_id = %hello.client_id,
        "participant joined"
    );

    let joined = ProtocolMessage::from(ParticipantJoined {
        session_id: actor.session.session_id.clone(),
        participant_id,
        display_name,
    });
    broadcast(actor.participant_outbounds(Some(conn_id)), &joined);
    actor.refresh_health();
    Ok(())
}

/// Compare fixed-size digests rather than the raw keys.
fn key_matches(expected: &str, given: &str) -> bool {
    let expected = digest::digest(&digest::SHA256, expected.as_bytes());
    let given = digest::digest(&digest::SHA256, given.as_bytes());
    expected.as_ref() == given.as_ref()
}

/// Trim, drop control characters and cap the length. Empty names fall back
/// to the participant id.
fn clean_display_name(raw: &str, fallback: &str) -> String {
    let name: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_DISPLAY_NAME_CHARS)
        .collect();
    let name = name.trim_end();
    if name.is_empty() {
        fallback.to_owned()
    } else {
        name.to_owned()
    }
}
