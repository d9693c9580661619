// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Router-style message transport.
//!
//! Every producer is identified by an opaque [`ClientId`] assigned by the transport. Inbound
//! messages carry that id as frame 0 and the payload as frame 1; an empty payload is a
//! heartbeat. Outbound messages are routed back to a producer by id.
//!
//! Two attach points feed one [`Endpoint`]:
//! - a framed TCP listener ([`tcp`]) for producers in other processes,
//! - in-process producers ([`inproc::LocalProducer`]).

use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::constants::{MAX_FRAMES, MAX_FRAME_SIZE};
use crate::errors::TransportError;
use crate::util::{lock, to_hex};

pub mod inproc;
pub mod tcp;

/// Opaque producer identity assigned by the transport.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Vec<u8>);

impl ClientId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&to_hex(&self.0))
    }
}

impl std::fmt::Debug for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClientId({self})")
    }
}

/// A two-frame message: producer id and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub client_id: ClientId,
    pub payload: Vec<u8>,
}

impl WireMessage {
    pub fn new(client_id: ClientId, payload: Vec<u8>) -> Self {
        Self { client_id, payload }
    }

    /// A heartbeat (ping from the server, pong from a producer).
    pub fn heartbeat(client_id: ClientId) -> Self {
        Self::new(client_id, Vec::new())
    }

    pub fn is_heartbeat(&self) -> bool {
        self.payload.is_empty()
    }

    /// Builds a message from raw frames. Frame 0 is the id, frame 1 the payload; any further
    /// frames are ignored. Returns `None` when there is no id frame.
    pub fn from_frames(mut frames: Vec<Vec<u8>>) -> Option<Self> {
        if frames.is_empty() {
            return None;
        }
        frames.truncate(2);
        let payload = if frames.len() == 2 {
            frames.pop().unwrap_or_default()
        } else {
            Vec::new()
        };
        let id = frames.pop()?;
        Some(Self::new(ClientId(id), payload))
    }

    pub fn into_frames(self) -> Vec<Vec<u8>> {
        vec![self.client_id.0, self.payload]
    }
}

/// Reads one framed message: a u32 BE frame count, then each frame as u32 BE length + bytes.
///
/// Returns `Ok(None)` on a clean end of stream before the first byte of a message.
pub async fn read_frames<R>(reader: &mut R) -> Result<Option<Vec<Vec<u8>>>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let count = match reader.read_u32().await {
        Ok(count) => count as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if count > MAX_FRAMES {
        return Err(TransportError::TooManyFrames(count));
    }

    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let len = reader.read_u32().await? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(len));
        }
        let mut frame = vec![0; len];
        reader.read_exact(&mut frame).await?;
        frames.push(frame);
    }
    Ok(Some(frames))
}

/// Writes one framed message, see [`read_frames`].
pub async fn write_frames<W>(writer: &mut W, frames: &[Vec<u8>]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if frames.len() > MAX_FRAMES {
        return Err(TransportError::TooManyFrames(frames.len()));
    }

    let mut buf = Vec::with_capacity(4 + frames.iter().map(|f| 4 + f.len()).sum::<usize>());
    buf.extend_from_slice(&(frames.len() as u32).to_be_bytes());
    for frame in frames {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(frame.len()));
        }
        buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buf.extend_from_slice(frame);
    }
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Routes outbound payloads to connected producers by id.
#[derive(Clone, Default)]
pub struct ReplyRouter {
    routes: Arc<Mutex<HashMap<ClientId, mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl ReplyRouter {
    pub(crate) fn register(&self, id: ClientId, tx: mpsc::UnboundedSender<Vec<u8>>) {
        lock(&self.routes).insert(id, tx);
    }

    pub(crate) fn unregister(&self, id: &ClientId) {
        lock(&self.routes).remove(id);
    }

    /// Sends a payload to one producer. Returns false if the producer is not connected.
    pub fn send(&self, msg: WireMessage) -> bool {
        let routes = lock(&self.routes);
        match routes.get(&msg.client_id) {
            Some(tx) => tx.send(msg.payload).is_ok(),
            None => {
                debug!("No route to client {}", msg.client_id);
                false
            }
        }
    }

    pub fn connected(&self) -> usize {
        lock(&self.routes).len()
    }
}

/// Server side of the transport: one inbound stream fed by every attach point, plus the router
/// for replies.
pub struct Endpoint {
    inbound_tx: mpsc::UnboundedSender<WireMessage>,
    inbound_rx: mpsc::UnboundedReceiver<WireMessage>,
    router: ReplyRouter,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Endpoint {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx,
            inbound_rx,
            router: ReplyRouter::default(),
        }
    }

    /// Handle used by attach points to inject messages and register routes.
    pub fn attach(&self) -> Attachment {
        Attachment {
            inbound: self.inbound_tx.clone(),
            router: self.router.clone(),
        }
    }

    pub fn router(&self) -> ReplyRouter {
        self.router.clone()
    }

    pub(crate) fn into_parts(self) -> (mpsc::UnboundedReceiver<WireMessage>, ReplyRouter) {
        (self.inbound_rx, self.router)
    }
}

/// Cloneable write side of an [`Endpoint`].
#[derive(Clone)]
pub struct Attachment {
    pub(crate) inbound: mpsc::UnboundedSender<WireMessage>,
    pub(crate) router: ReplyRouter,
}
