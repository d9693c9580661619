// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Framed TCP attach point.
//!
//! Each accepted connection is one producer. Its [`ClientId`] is derived from the peer address,
//! which is unique per live connection. Producers send frames without an id; the listener
//! prepends the id before handing messages to the endpoint and strips it from replies.

use std::net::SocketAddr;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{read_frames, write_frames, Attachment, ClientId, WireMessage};
use crate::errors::TransportError;

/// Binds the listener and spawns its accept loop.
///
/// Binding failures are returned to the caller: a server that can't bind must not start.
pub async fn bind(
    addr: &str,
    attachment: Attachment,
    cancel_token: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>), TransportError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| TransportError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    let local_addr = listener.local_addr()?;
    debug!("Listening for log clients on tcp://{}", local_addr);

    let handle = tokio::spawn(accept_loop(listener, attachment, cancel_token));
    Ok((local_addr, handle))
}

async fn accept_loop(
    listener: TcpListener,
    attachment: Attachment,
    cancel_token: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = cancel_token.cancelled() => break,
        };

        match accepted {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                tokio::spawn(serve_connection(
                    stream,
                    peer,
                    attachment.clone(),
                    cancel_token.child_token(),
                ));
            }
            Err(e) => error!("Failed to accept log client connection: {}", e),
        }
    }
    debug!("Stopped accepting log clients");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    attachment: Attachment,
    cancel_token: CancellationToken,
) {
    let id = ClientId::new(peer.to_string().into_bytes());
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    attachment.router.register(id.clone(), reply_tx);
    debug!("Log client {} connected from {}", id, peer);

    let writer_task = tokio::spawn(async move {
        while let Some(payload) = reply_rx.recv().await {
            if let Err(e) = write_frames(&mut writer, &[payload]).await {
                debug!("Failed to write to log client {}: {}", peer, e);
                break;
            }
        }
    });

    loop {
        let read = tokio::select! {
            read = read_frames(&mut reader) => read,
            _ = cancel_token.cancelled() => break,
        };

        match read {
            Ok(Some(frames)) => {
                let mut all = Vec::with_capacity(frames.len() + 1);
                all.push(id.as_bytes().to_vec());
                all.extend(frames);
                let Some(msg) = WireMessage::from_frames(all) else {
                    continue;
                };
                if attachment.inbound.send(msg).is_err() {
                    // Endpoint dropped: the server is shutting down.
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Dropping log client {}: {}", id, e);
                break;
            }
        }
    }

    attachment.router.unregister(&id);
    writer_task.abort();
    debug!("Log client {} disconnected", id);
}
