use together_proto::messages::ClientLeave;
use tracing::debug;

use crate::SessionActor;
use crate::net::inbound::ConnId;
use crate::proto_dispatch::error::HandlerResult;

/// Goodbye from a participant. A mismatched id still ends this connection;
/// nobody else can be removed through it.
pub(crate) fn handle(
    actor: &mut SessionActor,
    conn_id: ConnId,
    leave: ClientLeave,
) -> HandlerResult {
    debug!(conn_id, participant_id = %leave.participant_id, "client leaving");
    actor.close_conn(conn_id, "left");
    Ok(())
}
