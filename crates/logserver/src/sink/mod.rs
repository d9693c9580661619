// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log sinks and their lifecycle.
//!
//! A sink is created lazily the first time a client asks for it and lives until the last client
//! routed to it expires. Every live sink holds a subscription on the fan-out bus and keeps only
//! the messages of the clients registered against it.
//!
//! A subscription that falls more than [`BUS_CAPACITY`] messages behind skips the oldest ones it
//! hasn't read and logs how many were lost. Delivery from the bus to a sink is therefore best
//! effort under sustained overload; only the database sink's own queue retries failed inserts.
//!
//! [`BUS_CAPACITY`]: crate::constants::BUS_CAPACITY

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use derive_more::Display;
use hashbrown::HashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument};

use crate::bus::FanoutBus;
use crate::item::LoggingItem;
use crate::registry::ClientRegistry;
use crate::store::LogStore;
use crate::transport::WireMessage;
use crate::util::lock;

pub mod database;
pub mod file;
pub mod syslog;

pub use database::{DatabaseSink, DatabaseSinkConfig};
pub use file::FileSink;
pub use syslog::SyslogSink;

/// Identity of a sink. At most one sink per identity is alive at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
pub enum SinkId {
    #[display("{}", _0.display())]
    File(PathBuf),
    /// There is a single syslog sink.
    #[display("")]
    Syslog,
    #[display("{_0}")]
    Database(String),
}

impl SinkId {
    /// The sinks a new client asks for in its first record.
    pub fn requested_by(item: &LoggingItem) -> Vec<SinkId> {
        let mut sinks = Vec::with_capacity(3);
        if !item.log_file().is_empty() {
            sinks.push(SinkId::File(PathBuf::from(item.log_file())));
        }
        if item.facility() > 0 {
            sinks.push(SinkId::Syslog);
        }
        if !item.table().is_empty() {
            sinks.push(SinkId::Database(item.table().to_string()));
        }
        sinks
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SinkId::File(_) => "file",
            SinkId::Syslog => "syslog",
            SinkId::Database(_) => "database",
        }
    }
}

pub enum Sink {
    File(FileSink),
    Syslog(SyslogSink),
    Database(DatabaseSink),
}

impl Sink {
    /// Writes (file, syslog) or enqueues (database) one record. Returns false if the record was
    /// not accepted.
    pub async fn logmsg(&self, item: &Arc<LoggingItem>) -> bool {
        match self {
            Sink::File(sink) => sink.logmsg(item),
            Sink::Syslog(sink) => sink.logmsg(item),
            Sink::Database(sink) => sink.logmsg(item).await,
        }
    }

    /// Reopens the underlying file. Other sinks ignore it.
    pub fn reopen(&self) {
        if let Sink::File(sink) = self {
            sink.reopen();
        }
    }

    pub async fn close(&self) {
        match self {
            Sink::File(sink) => sink.close(),
            Sink::Syslog(sink) => sink.close(),
            Sink::Database(sink) => sink.close().await,
        }
    }

    /// Releases a sink that never went live, without waiting on it.
    fn discard(&self) {
        match self {
            Sink::File(sink) => sink.close(),
            Sink::Syslog(sink) => sink.close(),
            Sink::Database(sink) => sink.abort(),
        }
    }
}

struct SinkEntry {
    sink: Arc<Sink>,
    cancel_token: CancellationToken,
    subscription: JoinHandle<()>,
}

/// Identity map of live sinks.
pub struct SinkRegistry {
    sinks: Mutex<HashMap<SinkId, SinkEntry>>,
    bus: Arc<FanoutBus>,
    clients: Arc<ClientRegistry>,
    store: Arc<dyn LogStore>,
    database: DatabaseSinkConfig,
}

impl SinkRegistry {
    pub fn new(
        bus: Arc<FanoutBus>,
        clients: Arc<ClientRegistry>,
        store: Arc<dyn LogStore>,
        database: DatabaseSinkConfig,
    ) -> Self {
        Self {
            sinks: Mutex::new(HashMap::new()),
            bus,
            clients,
            store,
            database,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.sinks).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.sinks).is_empty()
    }

    pub fn get(&self, id: &SinkId) -> Option<Arc<Sink>> {
        lock(&self.sinks).get(id).map(|entry| Arc::clone(&entry.sink))
    }

    fn open(&self, id: &SinkId) -> Sink {
        match id {
            SinkId::File(path) => Sink::File(FileSink::open(path.clone())),
            SinkId::Syslog => Sink::Syslog(SyslogSink::open()),
            SinkId::Database(table) => Sink::Database(DatabaseSink::open(
                table.clone(),
                Arc::clone(&self.store),
                self.database.clone(),
            )),
        }
    }

    /// Returns the live sink for `id`, creating it if needed.
    ///
    /// The resource is opened without holding the map lock. If another caller registered the
    /// same identity meanwhile, the new sink is discarded and the registered one returned.
    pub fn find_or_create(&self, id: &SinkId) -> Arc<Sink> {
        if let Some(existing) = self.get(id) {
            return existing;
        }

        let sink = Arc::new(self.open(id));

        let mut sinks = lock(&self.sinks);
        if let Some(existing) = sinks.get(id) {
            sink.discard();
            return Arc::clone(&existing.sink);
        }

        let Some(rx) = self.bus.subscribe() else {
            warn!("Not subscribing {} sink {}: bus closed", id.kind(), id);
            return sink;
        };
        let cancel_token = CancellationToken::new();
        let subscription = tokio::spawn(
            deliver(
                id.clone(),
                Arc::clone(&sink),
                rx,
                Arc::clone(&self.clients),
                cancel_token.clone(),
            )
            .in_current_span(),
        );
        sinks.insert(
            id.clone(),
            SinkEntry {
                sink: Arc::clone(&sink),
                cancel_token,
                subscription,
            },
        );
        debug!("Created {} sink {}", id.kind(), id);
        sink
    }

    /// Unsubscribes and closes one sink.
    pub async fn destroy(&self, id: &SinkId) {
        let entry = lock(&self.sinks).remove(id);
        let Some(entry) = entry else {
            return;
        };
        entry.cancel_token.cancel();
        if let Err(e) = entry.subscription.await {
            error!("Subscription for sink {} failed: {}", id, e);
        }
        entry.sink.close().await;
        debug!("Destroyed {} sink {}", id.kind(), id);
    }

    /// Reopens every file sink, e.g. after log rotation.
    pub fn reopen_all(&self) {
        let sinks = lock(&self.sinks);
        for entry in sinks.values() {
            entry.sink.reopen();
        }
        debug!("Reopened {} sinks", sinks.len());
    }

    /// Closes the bus, lets every subscription drain what it already received, then closes all
    /// sinks.
    pub async fn shutdown_all(&self) {
        self.bus.close();
        let entries: Vec<_> = lock(&self.sinks).drain().collect();
        for (id, entry) in entries {
            if let Err(e) = entry.subscription.await {
                error!("Subscription for sink {} failed: {}", id, e);
            }
            entry.sink.close().await;
        }
    }
}

/// Subscription task of one sink.
async fn deliver(
    id: SinkId,
    sink: Arc<Sink>,
    mut rx: broadcast::Receiver<Arc<WireMessage>>,
    clients: Arc<ClientRegistry>,
    cancel_token: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            received = rx.recv() => received,
        };

        let msg = match received {
            Ok(msg) => msg,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Sink {} fell behind, {} messages dropped", id, skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if msg.is_heartbeat() || !clients.serves(&id, &msg.client_id) {
            continue;
        }
        match LoggingItem::from_wire(&msg.payload) {
            Ok(item) => {
                sink.logmsg(&Arc::new(item)).await;
            }
            Err(e) => warn!("Sink {} dropping message from {}: {}", id, msg.client_id, e),
        }
    }
}
