use together_proto::ProtocolMessage;
use together_proto::messages::Pong;
use tracing::{trace, warn};

use crate::SessionActor;
use crate::net::inbound::ConnId;

use super::error::{HandlerError, HandlerResult};

mod client_leave;
mod control_request;
mod hello;

/// Route one message from `conn_id`.
///
/// Until the handshake succeeds only `ClientHello` is accepted; anything
/// else fails authentication.
pub(crate) fn dispatch_message(
    actor: &mut SessionActor,
    conn_id: ConnId,
    message: ProtocolMessage,
) -> HandlerResult {
    let kind = message.kind();
    let authenticated = actor
        .conns
        .get(&conn_id)
        .is_some_and(|ctx| ctx.participant_id.is_some());

    if !authenticated {
        return match message {
            ProtocolMessage::ClientHello(hello) => hello::handle(actor, conn_id, hello),
            _ => {
                warn!(conn_id, kind, "message before handshake");
                Err(HandlerError::authentication_failed())
            }
        };
    }

    match message {
        ProtocolMessage::ControlRequest(req) => control_request::handle(actor, conn_id, req),
        ProtocolMessage::ClientLeave(leave) => client_leave::handle(actor, conn_id, leave),
        ProtocolMessage::ClientHello(_) => Err(HandlerError::unauthorized("already joined")),
        // Raced with the handshake; the connection task answers later pings.
        ProtocolMessage::Ping(ping) => {
            let pong = Pong::answer(ping, actor.clock.now_ms());
            actor.send_to(conn_id, &ProtocolMessage::from(pong));
            Ok(())
        }
        ProtocolMessage::Pong(_) => {
            trace!(conn_id, "early pong ignored");
            Ok(())
        }
        ProtocolMessage::ErrorMsg(err) => {
            warn!(conn_id, code = %err.code, message = %err.message, "participant reported an error");
            Ok(())
        }
        ProtocolMessage::ServerWelcome(_)
        | ProtocolMessage::SessionState(_)
        | ProtocolMessage::ControlBroadcast(_)
        | ProtocolMessage::ParticipantJoined(_)
        | ProtocolMessage::ParticipantLeft(_)
        | ProtocolMessage::Kicked(_) => {
            warn!(conn_id, kind, "host-only message from participant ignored");
            Ok(())
        }
    }
}
