use futures_util::{Sink, SinkExt};
use together_proto::ProtocolMessage;
use together_proto::codec::encode_message;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error};

/// Sender used by the actor to write frames to a connection.
pub type OutboundTx = mpsc::Sender<Message>;

/// Spawn a writer task draining `rx` into the WebSocket sink.
///
/// Exits after writing a `Close` frame, when the channel closes, or when a
/// write fails.
pub fn spawn_writer<S>(
    mut write: S,
    mut rx: mpsc::Receiver<Message>,
) -> tokio::task::JoinHandle<anyhow::Result<()>>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let is_close = matches!(frame, Message::Close(_));
            write.send(frame).await?;
            if is_close {
                break;
            }
        }
        let _ = write.close().await;
        Ok(())
    })
}

/// Encode `msg` into a text frame.
pub fn encode_frame(msg: &ProtocolMessage) -> Option<Message> {
    match encode_message(msg) {
        Ok(text) => Some(Message::text(text)),
        Err(e) => {
            error!(kind = msg.kind(), error = %e, "failed to encode message");
            None
        }
    }
}

/// Queue `msg` without waiting. Returns false if it was dropped.
///
/// A peer with a full queue loses the frame rather than stalling the caller.
pub fn send_msg(tx: &OutboundTx, msg: &ProtocolMessage) -> bool {
    let Some(frame) = encode_frame(msg) else {
        return false;
    };
    match tx.try_send(frame) {
        Ok(()) => true,
        Err(e) => {
            debug!(kind = msg.kind(), error = %e, "outbound frame dropped");
            false
        }
    }
}

/// Encode once and queue to every recipient. Returns the number of drops.
pub fn broadcast<'a>(
    recipients: impl IntoIterator<Item = &'a OutboundTx>,
    msg: &ProtocolMessage,
) -> usize {
    let Some(frame) = encode_frame(msg) else {
        return 0;
    };
    let mut dropped = 0;
    for tx in recipients {
        if tx.try_send(frame.clone()).is_err() {
            dropped += 1;
        }
    }
    if dropped > 0 {
        debug!(kind = msg.kind(), dropped, "broadcast frames dropped");
    }
    dropped
}
