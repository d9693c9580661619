// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Intake side of the server.
//!
//! Moves every inbound message onto the forward FIFO and keeps clients alive with heartbeat
//! pings. Stale clients found by the liveness sweep are left on the deletion list for the
//! forwarder to remove.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::queue::MessageQueue;
use crate::registry::ClientRegistry;
use crate::transport::{ClientId, Endpoint, ReplyRouter, WireMessage};

/// Lets other services ask the ingest side to ping a client.
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::UnboundedSender<ClientId>,
}

impl IngestHandle {
    /// Requests a heartbeat ping to `id`. Returns false once ingest has stopped.
    pub fn ping_client(&self, id: ClientId) -> bool {
        self.tx.send(id).is_ok()
    }
}

pub struct IngestService {
    inbound: mpsc::UnboundedReceiver<WireMessage>,
    router: ReplyRouter,
    ping_rx: mpsc::UnboundedReceiver<ClientId>,
    queue: Arc<MessageQueue>,
    clients: Arc<ClientRegistry>,
    sweep_interval: Duration,
    cancel_token: CancellationToken,
    ready: Option<oneshot::Sender<()>>,
}

impl IngestService {
    pub fn new(
        endpoint: Endpoint,
        queue: Arc<MessageQueue>,
        clients: Arc<ClientRegistry>,
        sweep_interval: Duration,
        cancel_token: CancellationToken,
    ) -> (Self, IngestHandle) {
        let (inbound, router) = endpoint.into_parts();
        let (tx, ping_rx) = mpsc::unbounded_channel();
        let service = Self {
            inbound,
            router,
            ping_rx,
            queue,
            clients,
            sweep_interval,
            cancel_token,
            ready: None,
        };
        (service, IngestHandle { tx })
    }

    /// Signals `ready` once the service loop is running.
    pub fn notify_ready(&mut self, ready: oneshot::Sender<()>) {
        self.ready = Some(ready);
    }

    fn ping_client(&self, id: ClientId) {
        trace!("Pinging client {}", id);
        if !self.router.send(WireMessage::heartbeat(id)) {
            // Disconnected; the sweep will expire it.
            trace!("Ping not delivered");
        }
    }

    fn check_heartbeats(&self) {
        for id in self.clients.check_heartbeats() {
            self.ping_client(id);
        }
    }

    pub async fn spin(mut self) {
        let mut sweep = interval_at(Instant::now() + self.sweep_interval, self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if let Some(ready) = self.ready.take() {
            let _ = ready.send(());
        }
        debug!("Ingest service started");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => break,
                Some(msg) = self.inbound.recv() => self.queue.push(msg),
                Some(id) = self.ping_rx.recv() => self.ping_client(id),
                _ = sweep.tick() => self.check_heartbeats(),
            }
        }

        // Whatever was already received still gets forwarded.
        let mut drained = 0;
        while let Ok(msg) = self.inbound.try_recv() {
            self.queue.push(msg);
            drained += 1;
        }
        debug!("Ingest service stopped, {} late messages queued", drained);
    }
}
