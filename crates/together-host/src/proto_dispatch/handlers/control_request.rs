use together_proto::messages::ControlRequest;
use tracing::{debug, warn};

use crate::SessionActor;
use crate::net::inbound::ConnId;
use crate::proto_dispatch::error::{HandlerError, HandlerResult};

pub(crate) fn handle(
    actor: &mut SessionActor,
    conn_id: ConnId,
    req: ControlRequest,
) -> HandlerResult {
    if req.session_id != actor.session.session_id {
        warn!(conn_id, session_id = %req.session_id, "control request for another session");
        return Err(HandlerError::unauthorized("unknown session"));
    }
    let Some(own_id) = actor
        .conns
        .get(&conn_id)
        .and_then(|ctx| ctx.participant_id.as_deref())
    else {
        return Err(HandlerError::unauthorized("not a participant"));
    };
    if own_id != req.participant_id {
        warn!(
            conn_id,
            own_id,
            claimed = %req.participant_id,
            "control request on behalf of another participant"
        );
        return Err(HandlerError::unauthorized(
            "participant id does not match connection",
        ));
    }

    if !actor.session.allow_guest_control {
        debug!(conn_id, participant_id = %req.participant_id, "guest control disabled");
        return Err(HandlerError::unauthorized("only the host controls playback"));
    }

    actor.check_action(&req.action)?;
    debug!(
        conn_id,
        participant_id = %req.participant_id,
        kind = req.action.kind(),
        "control request accepted"
    );
    actor.dispatch_action(&req.participant_id, req.action);
    Ok(())
}
