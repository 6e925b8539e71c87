//! Per-connection task: framed I/O, handshake, request/reply plumbing.
//!
//! Each shim connection spawns a tokio task that:
//! 1. Wraps the socket in the length-prefixed MessagePack codec.
//! 2. Reads the first message, which must be `Hello` with a matching
//!    protocol version and arrive within the hello timeout, and answers
//!    with `HelloAck`. A silent peer is dropped so it cannot hold the
//!    session slot.
//! 3. Enters a select loop: browser events go to the daemon loop,
//!    replies go to the [`ReplyRouter`], and queued requests from the
//!    engine's [`RemoteBrowser`](crate::browser::remote::RemoteBrowser)
//!    are written to the socket.
//! 4. On exit, closes the router so in-flight requests fail instead of
//!    hanging, and drops the event sender, which the daemon loop reads
//!    as the disconnect.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::browser::BrowserEvent;
use crate::browser::remote::ReplyRouter;
use crate::ipc::codec::{CodecError, Frame, FrameCodec};
use crate::ipc::protocol::{Message, PROTOCOL_VERSION, Status};

/// How long a rejected shim gets to send its hello.
const HELLO_GRACE: Duration = Duration::from_secs(1);

/// Identifies one accepted shim connection in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Connection-level errors.
#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error("unexpected EOF during handshake")]
    HandshakeEof,
    #[error("no hello within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("first message must be Hello")]
    NotHello,
    #[error("protocol version mismatch: shim {0}, daemon {PROTOCOL_VERSION}")]
    VersionMismatch(u32),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Spawn a connection handler task.
pub fn spawn_connection(
    stream: UnixStream,
    conn_id: ConnectionId,
    hello_timeout: Duration,
    router: ReplyRouter,
    outgoing_rx: mpsc::UnboundedReceiver<Message>,
    events_tx: mpsc::UnboundedSender<BrowserEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match handle_connection(stream, hello_timeout, &router, outgoing_rx, events_tx).await {
            Ok(()) => tracing::debug!(?conn_id, "shim disconnected"),
            Err(e) => tracing::info!(?conn_id, error = %e, "shim connection closed"),
        }
        let failed = router.fail_all();
        if failed > 0 {
            tracing::debug!(?conn_id, failed, "pending requests failed on disconnect");
        }
    })
}

/// Tell a second shim that the daemon is already serving one, then
/// close the socket.
pub fn reject_busy(stream: UnixStream, conn_id: ConnectionId, active: ConnectionId) {
    tracing::warn!(?conn_id, ?active, "rejecting second shim connection");
    tokio::spawn(async move {
        let mut framed = Framed::new(stream, FrameCodec::new());
        // Consume the hello so closing the socket reads as a clean EOF.
        let _ = tokio::time::timeout(HELLO_GRACE, framed.next()).await;
        let ack = Message::HelloAck {
            id: 0,
            status: Status::Error,
            error: Some("busy".into()),
        };
        if let Err(e) = framed.send(ack).await {
            tracing::debug!(?conn_id, error = %e, "busy notice not delivered");
        }
    });
}

async fn handle_connection(
    stream: UnixStream,
    hello_timeout: Duration,
    router: &ReplyRouter,
    mut outgoing_rx: mpsc::UnboundedReceiver<Message>,
    events_tx: mpsc::UnboundedSender<BrowserEvent>,
) -> Result<(), ConnectionError> {
    let mut framed = Framed::new(stream, FrameCodec::new());

    // -- Handshake: first message must be Hello, and soon --
    let first_frame = tokio::time::timeout(hello_timeout, framed.next())
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout(hello_timeout))?
        .ok_or(ConnectionError::HandshakeEof)??;

    let Frame::Message(Message::Hello { version, .. }) = first_frame else {
        return Err(ConnectionError::NotHello);
    };

    if version != PROTOCOL_VERSION {
        framed
            .send(Message::HelloAck {
                id: 0,
                status: Status::Error,
                error: Some("version_mismatch".into()),
            })
            .await?;
        return Err(ConnectionError::VersionMismatch(version));
    }
    framed
        .send(Message::HelloAck {
            id: 0,
            status: Status::Ok,
            error: None,
        })
        .await?;
    tracing::info!(version, "shim connected");

    // -- Main loop: events and replies in, requests out --
    loop {
        tokio::select! {
            frame = framed.next() => {
                let frame = match frame {
                    Some(frame) => frame?,
                    None => return Ok(()),
                };
                match frame {
                    Frame::Message(Message::Event { event, .. }) => {
                        if events_tx.send(event).is_err() {
                            // Daemon loop dropped this session.
                            return Ok(());
                        }
                    }
                    Frame::Message(Message::Reply(reply)) => {
                        let id = reply.id;
                        if !router.complete(reply) {
                            tracing::debug!(id, "reply matches no pending request");
                        }
                    }
                    Frame::Message(other) => {
                        tracing::debug!(id = other.id(), "ignoring unexpected message from shim");
                    }
                    Frame::Unknown(envelope) => {
                        tracing::debug!(
                            msg_type = %envelope.msg_type,
                            id = envelope.id,
                            "ignoring unknown message type"
                        );
                    }
                }
            }
            request = outgoing_rx.recv() => {
                match request {
                    Some(msg) => framed.send(msg).await?,
                    // The session's browser handle is gone.
                    None => return Ok(()),
                }
            }
        }
    }
}
