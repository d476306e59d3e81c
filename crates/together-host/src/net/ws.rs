use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use together_client::{ConnectionState, SyncPolicy};
use together_proto::codec::decode_message;
use together_proto::constants::LINK_PATH;
use together_proto::messages::{ErrorMsg, Ping, Pong};
use together_proto::{ClockEstimator, ElapsedClock, ErrorCode, ProtocolMessage};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::net::rate_limit::{ConnRateLimiter, IpRateLimiter, RateLimitConfig};
use crate::proto_dispatch::error::HandlerError;

use super::inbound::{ConnId, InboundEvent, next_conn_id};
use super::outbound::{send_msg, spawn_writer};

const OUTBOUND_QUEUE: usize = 256;

/// Settings every connection task needs.
#[derive(Debug, Clone)]
pub struct ConnParams {
    /// The session's logical clock.
    pub clock: ElapsedClock,
    pub policy: SyncPolicy,
    /// Per-connection frame limit; `None` disables it.
    pub rate_limit: Option<RateLimitConfig>,
}

/// Accept loop. Every connection gets its own task; all of them report to
/// the session actor through `tx`.
pub async fn run_ws_listener(
    listener: TcpListener,
    tx: mpsc::Sender<InboundEvent>,
    params: ConnParams,
    ip_rate_limiter: Option<Arc<IpRateLimiter>>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            res = listener.accept() => res?,
        };

        if let Some(ref limiter) = ip_rate_limiter
            && !limiter.check(peer.ip())
        {
            warn!(%peer, "connection rejected: IP rate limit exceeded");
            tokio::spawn(reject_with_rate_limit(stream));
            continue;
        }

        let conn_id = next_conn_id();
        let tx = tx.clone();
        let params = params.clone();
        tokio::spawn(async move {
            handle_ws_connection(stream, peer, conn_id, tx, params).await;
        });
    }
}

async fn reject_with_rate_limit(mut stream: TcpStream) {
    let _ = stream
        .write_all(b"HTTP/1.1 429 Too Many Requests\r\nConnection: close\r\n\r\n")
        .await;
    let _ = stream.shutdown().await;
}

#[allow(clippy::result_large_err)]
fn check_path(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if request.uri().path() == LINK_PATH {
        return Ok(response);
    }
    let mut error = ErrorResponse::new(Some("not found".to_owned()));
    *error.status_mut() = StatusCode::NOT_FOUND;
    Err(error)
}

/// Run one connection: WebSocket upgrade, writer and pinger tasks, and the
/// read loop.
///
/// The read loop polices every data frame before anything else: the frame
/// rate limit and the malformed-frame streak both apply to clock traffic
/// too. Once the actor marked the connection established it answers clock
/// pings itself and folds pongs into a per-connection [`ClockEstimator`].
/// Everything else is forwarded.
pub async fn handle_ws_connection(
    stream: TcpStream,
    peer: SocketAddr,
    conn_id: ConnId,
    tx: mpsc::Sender<InboundEvent>,
    params: ConnParams,
) {
    let _ = stream.set_nodelay(true);
    let ws = match accept_hdr_async(stream, check_path).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(conn_id, %peer, error = %e, "websocket upgrade failed");
            return;
        }
    };
    let (write, mut read) = ws.split();

    let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let writer = spawn_writer(write, out_rx);
    let cancel_token = CancellationToken::new();
    let (phase_tx, mut phase_rx) = watch::channel(ConnectionState::Handshaking);

    if tx
        .send(InboundEvent::Connected {
            conn_id,
            peer,
            outbound: out_tx.clone(),
            cancel_token: cancel_token.clone(),
            phase: phase_tx,
        })
        .await
        .is_err()
    {
        return;
    }

    let pinger = tokio::spawn(run_pinger(
        out_tx.clone(),
        phase_rx.clone(),
        cancel_token.clone(),
        params.clone(),
    ));

    let ConnParams {
        clock,
        policy,
        rate_limit,
    } = params;
    let mut estimator = ClockEstimator::new(policy.clock_config());
    let rate_limiter = rate_limit.as_ref().and_then(ConnRateLimiter::new);
    let mut malformed_streak = 0u32;
    let handshake_deadline = Instant::now() + policy.handshake_timeout();

    let reason = loop {
        let established = phase_rx.borrow().is_established();
        let deadline = if established {
            Instant::now() + policy.heartbeat_timeout()
        } else {
            handshake_deadline
        };

        let frame = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break "closed by host".to_owned(),
            // Re-arm the deadline once the handshake completes.
            changed = phase_rx.changed(), if !established => {
                if changed.is_err() {
                    break "host stopped".to_owned();
                }
                continue;
            }
            frame = tokio::time::timeout_at(deadline, read.next()) => frame,
        };

        let frame = match frame {
            Err(_) => {
                let (message, reason) = if established {
                    ("no traffic received", "heartbeat timeout")
                } else {
                    ("handshake not completed in time", "handshake timeout")
                };
                let error = ErrorMsg::new(ErrorCode::ConnectionTimeout, message);
                send_msg(&out_tx, &ProtocolMessage::from(error));
                break reason.to_owned();
            }
            Ok(None) => break "eof".to_owned(),
            Ok(Some(Err(e))) => break format!("read error: {e}"),
            Ok(Some(Ok(frame))) => frame,
        };

        let text = match frame {
            Message::Text(text) => Some(text),
            Message::Binary(_) => None,
            Message::Close(_) => break "closed by peer".to_owned(),
            _ => continue,
        };

        if let Some(limiter) = &rate_limiter
            && !limiter.check()
        {
            warn!(conn_id, %peer, "message rate limit exceeded");
            reject(&out_tx, HandlerError::rate_limited());
            break "rate limited".to_owned();
        }

        // The phase may have advanced while this frame was in flight.
        let established = phase_rx.borrow().is_established();
        let decoded = match &text {
            Some(text) => decode_message(text.as_str()).map_err(|e| e.to_string()),
            None => Err("binary frame".to_owned()),
        };
        let message = match decoded {
            Ok(message) => {
                malformed_streak = 0;
                message
            }
            Err(detail) => {
                if !established {
                    warn!(conn_id, %peer, %detail, "malformed frame before handshake");
                    reject(&out_tx, HandlerError::malformed("malformed handshake"));
                    break "malformed handshake".to_owned();
                }
                malformed_streak += 1;
                warn!(conn_id, streak = malformed_streak, %detail, "dropping malformed frame");
                if malformed_streak >= policy.max_malformed_streak {
                    reject(&out_tx, HandlerError::malformed("too many malformed frames"));
                    break "too many malformed frames".to_owned();
                }
                continue;
            }
        };

        let event = match message {
            ProtocolMessage::Ping(ping) if established => {
                let pong = Pong::answer(ping, clock.now_ms());
                send_msg(&out_tx, &ProtocolMessage::from(pong));
                continue;
            }
            ProtocolMessage::Pong(pong) if established => {
                let received = clock.now_ms();
                match estimator.on_pong(pong.sent_at_elapsed_ms, received, pong.server_elapsed_ms)
                {
                    Ok(snapshot) => InboundEvent::ClockSample { conn_id, snapshot },
                    Err(e) => {
                        debug!(conn_id, error = %e, "clock sample dropped");
                        continue;
                    }
                }
            }
            message => InboundEvent::Message { conn_id, message },
        };

        if tx.send(event).await.is_err() {
            break "host stopped".to_owned();
        }
    };

    trace!(conn_id, %peer, %reason, "connection task exiting");
    cancel_token.cancel();
    let _ = out_tx.try_send(Message::Close(None));
    let _ = tx
        .send(InboundEvent::Disconnected {
            conn_id,
            peer,
            reason,
        })
        .await;

    drop(out_tx);
    let _ = pinger.await;
    let _ = writer.await;
}

fn reject(out_tx: &mpsc::Sender<Message>, err: HandlerError) {
    send_msg(out_tx, &ProtocolMessage::from(ErrorMsg::from(err)));
}

/// Ping the participant on a fixed period once the handshake is done.
async fn run_pinger(
    out_tx: mpsc::Sender<Message>,
    mut phase_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    params: ConnParams,
) {
    loop {
        if phase_rx.borrow_and_update().is_established() {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            res = phase_rx.changed() => {
                if res.is_err() {
                    return;
                }
            }
        }
    }

    let mut ticker = tokio::time::interval(params.policy.ping_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if phase_rx.borrow().is_closed() {
            break;
        }
        let ping = ProtocolMessage::from(Ping {
            sent_at_elapsed_ms: params.clock.now_ms(),
        });
        if out_tx.is_closed() {
            break;
        }
        send_msg(&out_tx, &ping);
    }
}
