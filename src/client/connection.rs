//! Client connection driver.
//!
//! Runs one TCP connection for a [`ClientSession`]: sends the handshake,
//! writes whatever the session queues and feeds server frames back into it.
//! When the connection ends the session is paused and the outbound receiver
//! is handed back so the caller can reconnect with it.

use super::session::ClientSession;
use crate::core::error::CoherenceResult;
use crate::protocol::codec::{read_frame, write_frame, ClientCodec};
use crate::protocol::messages::ClientMessage;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Open a TCP connection to `addr` and drive it until it closes.
pub async fn connect(
    addr: SocketAddr,
    session: Arc<ClientSession>,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
) -> CoherenceResult<mpsc::UnboundedReceiver<ClientMessage>> {
    let stream = TcpStream::connect(addr).await?;
    let _ = stream.set_nodelay(true);
    Ok(run_connection(stream, session, outbound).await)
}

/// Drive an established stream until it closes. Returns the outbound
/// receiver for the next connection.
pub async fn run_connection(
    stream: TcpStream,
    session: Arc<ClientSession>,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
) -> mpsc::UnboundedReceiver<ClientMessage> {
    let node = session.node();
    // Anything queued for the old connection is covered by the handshake.
    let mut stale = 0usize;
    while outbound.try_recv().is_ok() {
        stale += 1;
    }
    if stale > 0 {
        tracing::debug!(
            node = %node,
            stale,
            "discarded messages queued for the previous connection"
        );
    }

    if let Err(e) = session.connect() {
        tracing::warn!(node = %node, error = %e, "cannot start handshake");
        return outbound;
    }

    let (mut reader, mut writer) = stream.into_split();
    let codec = ClientCodec::new();
    let mut buffer = BytesMut::with_capacity(64 * 1024);
    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else { break };
                let goodbye = matches!(message, ClientMessage::Goodbye);
                if let Err(e) = write_frame(&codec, &mut writer, &message).await {
                    tracing::debug!(node = %node, error = %e, "write failed");
                    break;
                }
                if goodbye {
                    break;
                }
            }
            frame = read_frame(&codec, &mut reader, &mut buffer) => {
                match frame {
                    Ok(Some(message)) => {
                        if let Err(e) = session.handle(message) {
                            tracing::warn!(node = %node, error = %e, "closing connection");
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(node = %node, error = %e, "read failed");
                        break;
                    }
                }
            }
        }
    }
    session.connection_lost();
    outbound
}
