// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process attach point for producers living inside the server process.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Attachment, ClientId, WireMessage};
use crate::errors::TransportError;
use crate::item::LoggingItem;

static NEXT_LOCAL_ID: AtomicU32 = AtomicU32::new(1);

/// A producer attached directly to an [`super::Endpoint`].
///
/// Once the producer has sent a record, pings from the server are answered automatically, so it
/// stays alive for as long as it exists.
pub struct LocalProducer {
    id: ClientId,
    attachment: Attachment,
    sent_record: Arc<AtomicBool>,
    pong_task: JoinHandle<()>,
}

impl LocalProducer {
    pub fn connect(attachment: Attachment, name: &str) -> Self {
        let serial = NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed);
        let id = ClientId::new(format!("inproc://{name}#{serial}").into_bytes());

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        attachment.router.register(id.clone(), reply_tx);

        let sent_record = Arc::new(AtomicBool::new(false));
        let pong_enabled = Arc::clone(&sent_record);
        let inbound = attachment.inbound.clone();
        let pong_id = id.clone();
        let pong_task = tokio::spawn(async move {
            while let Some(payload) = reply_rx.recv().await {
                if payload.is_empty()
                    && pong_enabled.load(Ordering::Relaxed)
                    && inbound.send(WireMessage::heartbeat(pong_id.clone())).is_err()
                {
                    break;
                }
            }
        });
        debug!("Local producer {} attached", id);

        Self {
            id,
            attachment,
            sent_record,
            pong_task,
        }
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn send(&self, item: &LoggingItem) -> Result<(), TransportError> {
        self.send_raw(item.to_wire())?;
        self.sent_record.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Announces the producer without sending a record.
    pub fn heartbeat(&self) -> Result<(), TransportError> {
        self.send_raw(Vec::new())
    }

    fn send_raw(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.attachment
            .inbound
            .send(WireMessage::new(self.id.clone(), payload))
            .map_err(|_| TransportError::Closed)
    }
}

impl Drop for LocalProducer {
    fn drop(&mut self) {
        self.attachment.router.unregister(&self.id);
        self.pong_task.abort();
    }
}
