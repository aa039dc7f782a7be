//! Per-connection driver
//!
//! Each connection runs three pieces:
//! - the reader loop (this task), which forwards frames in arrival order
//! - a dispatcher task serving those frames one at a time
//! - a writer task draining the outbound channel into the socket
//!
//! Group membership is held by a guard, so the connection leaves its group
//! exactly once however the reader loop ends.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{Rejection, Result};
use crate::identity::token_fingerprint;
use crate::router::{ConnectionId, GroupRouter};

use super::admission::{admit, ConnectTarget};
use super::dispatch::Session;
use super::state::SessionState;
use super::SessionContext;

/// How long a refused peer gets to acknowledge the close frame
const REJECT_LINGER: Duration = Duration::from_secs(1);

enum Inbound {
    Text(String),
    Binary,
}

/// Leaves the group when dropped
struct Membership {
    router: Arc<GroupRouter>,
    group: String,
    connection: ConnectionId,
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.router.leave(&self.group, self.connection);
    }
}

/// Upgrade a TCP connection and serve it until the peer goes away
pub async fn serve_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<SessionContext>) -> Result<()> {
    let connection = ConnectionId::new();
    let mut state = SessionState::Pending;

    let mut target = ConnectTarget::default();
    let ws = accept_hdr_async(stream, |request: &Request, response: Response| {
        target = ConnectTarget::from_request(request);
        Ok(response)
    })
    .await?;

    debug!(connection_id = %connection, peer = %peer, path = %target.path, "WebSocket upgraded");

    let admission = match admit(&ctx, &target).await {
        Ok(admission) => admission,
        Err(e) => {
            state.advance(SessionState::Closed)?;
            let rejection = e.rejection();
            warn!(
                connection_id = %connection,
                peer = %peer,
                rejection = %rejection,
                token = %target.token().map(|t| token_fingerprint(&t)).unwrap_or_else(|| "none".into()),
                error = %e.format_for_log(),
                "Connection refused"
            );
            reject(ws, rejection).await;
            return Ok(());
        }
    };
    state.advance(SessionState::Admitted)?;

    let (out_tx, mut out_rx) = mpsc::channel::<String>(ctx.outbound_queue.max(1));
    ctx.router.join(&admission.group, connection, out_tx.clone());
    let membership = Membership {
        router: ctx.router.clone(),
        group: admission.group.clone(),
        connection,
    };
    state.advance(SessionState::Active)?;

    let user_id = admission.user.id;
    let session = Arc::new(Session::new(ctx.clone(), connection, admission));

    info!(
        connection_id = %connection,
        user_id,
        group = %session.group(),
        members = ctx.router.member_count(session.group()),
        "Session active"
    );

    let (mut sink, mut stream) = ws.split();

    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text)).await {
                debug!(connection_id = %connection, error = %e, "Outbound send failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let closed = Arc::new(AtomicBool::new(false));
    let (in_tx, mut in_rx) = mpsc::channel::<Inbound>(ctx.outbound_queue.max(1));

    let dispatcher = {
        let session = session.clone();
        let closed = closed.clone();
        let router = ctx.router.clone();
        tokio::spawn(async move {
            while let Some(frame) = in_rx.recv().await {
                // Frames queued behind a disconnect are not served
                if closed.load(Ordering::Acquire) {
                    break;
                }
                let reply = match frame {
                    Inbound::Text(text) => session.handle_text(&text).await,
                    Inbound::Binary => session.handle_binary(),
                };
                let payload = reply.to_json();

                if session.should_fan_out(&reply) {
                    let delivered =
                        router.broadcast_except(session.group(), &payload, session.connection());
                    debug!(connection_id = %session.connection(), delivered, "Fan-out");
                }
                if out_tx.send(payload).await.is_err() {
                    debug!(connection_id = %session.connection(), "Reply dropped, connection closed");
                }
            }
        })
    };

    while let Some(frame) = stream.next().await {
        let inbound = match frame {
            Ok(Message::Text(text)) => Inbound::Text(text),
            Ok(Message::Binary(_)) => Inbound::Binary,
            Ok(Message::Close(frame)) => {
                debug!(connection_id = %connection, ?frame, "Peer closed");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!(connection_id = %connection, error = %e, "Transport error");
                break;
            }
        };
        if in_tx.send(inbound).await.is_err() {
            break;
        }
    }

    // Teardown
    closed.store(true, Ordering::Release);
    drop(in_tx);
    drop(membership);
    state.advance(SessionState::Closed)?;

    info!(
        connection_id = %connection,
        user_id,
        group = %session.group(),
        "Session closed"
    );

    // Detached: an in-flight request finishes in the background and its
    // reply has nowhere to go
    drop(dispatcher);
    drop(writer);

    Ok(())
}

/// Send the rejection close frame and wait briefly for the peer to answer
async fn reject(mut ws: WebSocketStream<TcpStream>, rejection: Rejection) {
    let frame = CloseFrame {
        code: CloseCode::from(rejection.close_code()),
        reason: rejection.as_str().into(),
    };

    if let Err(e) = ws.close(Some(frame)).await {
        debug!(error = %e, "Failed to send close frame");
        return;
    }

    let _ = tokio::time::timeout(REJECT_LINGER, async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
}

