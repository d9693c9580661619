// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! TCP producer client.
//!
//! Connects to a running server, announces itself with a heartbeat and sends records. Once it
//! has sent a record it answers the server's pings so it isn't expired while idle; before that a
//! ping only acknowledges the announcement.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::errors::TransportError;
use crate::item::LoggingItem;
use crate::transport::{read_frames, write_frames};

pub struct LogClient {
    writer: Arc<TokioMutex<OwnedWriteHalf>>,
    pings: Arc<AtomicUsize>,
    sent_record: Arc<AtomicBool>,
    local_addr: SocketAddr,
    pong_task: JoinHandle<()>,
}

impl LogClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Connect { addr, source })?;
        let _ = stream.set_nodelay(true);
        let local_addr = stream.local_addr()?;
        let (reader, writer) = stream.into_split();
        let writer = Arc::new(TokioMutex::new(writer));
        let pings = Arc::new(AtomicUsize::new(0));
        let sent_record = Arc::new(AtomicBool::new(false));

        let pong_writer = Arc::clone(&writer);
        let pong_pings = Arc::clone(&pings);
        let pong_enabled = Arc::clone(&sent_record);
        let pong_task = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            loop {
                match read_frames(&mut reader).await {
                    Ok(Some(frames)) => {
                        if frames.first().map_or(true, Vec::is_empty) {
                            pong_pings.fetch_add(1, Ordering::Relaxed);
                            if !pong_enabled.load(Ordering::Relaxed) {
                                continue;
                            }
                            let mut writer = pong_writer.lock().await;
                            if write_frames(&mut *writer, &[Vec::new()]).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Log server connection error: {}", e);
                        break;
                    }
                }
            }
        });

        let client = Self {
            writer,
            pings,
            sent_record,
            local_addr,
            pong_task,
        };
        client.heartbeat().await?;
        Ok(client)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of pings the server has sent this client.
    pub fn pings_received(&self) -> usize {
        self.pings.load(Ordering::Relaxed)
    }

    pub async fn send(&self, item: &LoggingItem) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        write_frames(&mut *writer, &[item.to_wire()]).await?;
        self.sent_record.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub async fn heartbeat(&self) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        write_frames(&mut *writer, &[Vec::new()]).await
    }
}

impl Drop for LogClient {
    fn drop(&mut self) {
        self.pong_task.abort();
    }
}
