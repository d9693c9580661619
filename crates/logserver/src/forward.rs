// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Forwarding side of the server.
//!
//! Takes messages off the FIFO, registers first-time clients with the sinks they ask for and
//! republishes every record on the fan-out bus. It also removes expired clients, runs the idle
//! shutdown timer and serves reload requests.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::FanoutBus;
use crate::constants::{FORWARD_BATCH, QUEUE_WAIT};
use crate::ingest::IngestHandle;
use crate::item::LoggingItem;
use crate::queue::MessageQueue;
use crate::registry::ClientRegistry;
use crate::server::ServerStatus;
use crate::sink::{SinkId, SinkRegistry};
use crate::transport::WireMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Stopped,
    Pending(Instant),
    Fired,
}

/// Single-shot idle shutdown timer. Once fired it never restarts.
#[derive(Debug)]
struct IdleTimer {
    timeout: Option<Duration>,
    state: TimerState,
}

impl IdleTimer {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            state: TimerState::Stopped,
        }
    }

    fn start(&mut self) {
        let Some(timeout) = self.timeout else {
            return;
        };
        if self.state == TimerState::Stopped {
            debug!("Starting idle shutdown timer ({:?})", timeout);
            self.state = TimerState::Pending(Instant::now() + timeout);
        }
    }

    fn cancel(&mut self) {
        if let TimerState::Pending(_) = self.state {
            info!("Aborting shutdown timer");
            self.state = TimerState::Stopped;
        }
    }

    fn is_pending(&self) -> bool {
        matches!(self.state, TimerState::Pending(_))
    }

    async fn expired(&self) {
        match self.state {
            TimerState::Pending(deadline) => sleep_until(deadline).await,
            _ => pending().await,
        }
    }
}

/// Requests served by a running [`ForwardService`].
#[derive(Clone)]
pub struct ForwardHandle {
    reload_tx: mpsc::UnboundedSender<()>,
}

impl ForwardHandle {
    /// Asks the forwarder to reopen every file sink. Returns false once it has stopped.
    pub fn reload(&self) -> bool {
        self.reload_tx.send(()).is_ok()
    }
}

pub struct ForwardConfig {
    pub idle_timeout: Option<Duration>,
    pub idle_grace: Duration,
}

pub struct ForwardService {
    queue: Arc<MessageQueue>,
    bus: Arc<FanoutBus>,
    clients: Arc<ClientRegistry>,
    sinks: Arc<SinkRegistry>,
    ingest: IngestHandle,
    reload_rx: mpsc::UnboundedReceiver<()>,
    status: Arc<watch::Sender<ServerStatus>>,
    config: ForwardConfig,
    /// Cancelled when the server goes idle, to stop intake.
    intake_token: CancellationToken,
    cancel_token: CancellationToken,
    ready: Option<oneshot::Sender<()>>,
}

impl ForwardService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<MessageQueue>,
        bus: Arc<FanoutBus>,
        clients: Arc<ClientRegistry>,
        sinks: Arc<SinkRegistry>,
        ingest: IngestHandle,
        status: Arc<watch::Sender<ServerStatus>>,
        config: ForwardConfig,
        intake_token: CancellationToken,
        cancel_token: CancellationToken,
    ) -> (Self, ForwardHandle) {
        let (reload_tx, reload_rx) = mpsc::unbounded_channel();
        let service = Self {
            queue,
            bus,
            clients,
            sinks,
            ingest,
            reload_rx,
            status,
            config,
            intake_token,
            cancel_token,
            ready: None,
        };
        (service, ForwardHandle { reload_tx })
    }

    /// Signals `ready` once the service loop is running.
    pub fn notify_ready(&mut self, ready: oneshot::Sender<()>) {
        self.ready = Some(ready);
    }

    pub async fn spin(mut self) {
        let mut idle = IdleTimer::new(self.config.idle_timeout);
        idle.start();

        if let Some(ready) = self.ready.take() {
            let _ = ready.send(());
        }
        debug!("Forward service started");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => break,
                _ = idle.expired() => {
                    idle.state = TimerState::Fired;
                    self.idle_shutdown().await;
                }
                Some(()) = self.reload_rx.recv() => {
                    info!("Reopening log files");
                    self.sinks.reopen_all();
                }
                _ = self.queue.wait(QUEUE_WAIT) => {}
            }

            for msg in self.queue.take_batch(FORWARD_BATCH) {
                self.forward(msg, &mut idle);
            }

            let expired = self.expire_clients().await;
            if expired && self.clients.count() == 1 && !idle.is_pending() {
                idle.start();
            }
        }

        self.shutdown().await;
    }

    async fn idle_shutdown(&self) {
        info!("Shutting down because of idleness");
        tokio::time::sleep(self.config.idle_grace).await;
        self.status.send_replace(ServerStatus::Idle);
        self.intake_token.cancel();
    }

    fn forward(&self, msg: WireMessage, idle: &mut IdleTimer) {
        let known = self.clients.touch(&msg.client_id);

        if msg.is_heartbeat() {
            if !known {
                debug!("Heartbeat from unknown client {}, pinging", msg.client_id);
                self.ingest.ping_client(msg.client_id);
            }
            return;
        }

        if !known && !self.register(&msg, idle) {
            return;
        }

        self.bus.publish(msg);
    }

    /// Registers a first-time client with the sinks its record asks for. Returns false if the
    /// record is malformed; nothing is registered then.
    fn register(&self, msg: &WireMessage, idle: &mut IdleTimer) -> bool {
        let item = match LoggingItem::from_wire(&msg.payload) {
            Ok(item) => item,
            Err(e) => {
                warn!("Dropping message from client {}: {}", msg.client_id, e);
                return false;
            }
        };

        let sinks = SinkId::requested_by(&item);
        for id in &sinks {
            self.sinks.find_or_create(id);
        }

        let count = self.clients.register(msg.client_id.clone(), sinks);
        info!("Client {} connected, {} clients", msg.client_id, count);
        if count > 1 {
            idle.cancel();
        }
        true
    }

    /// Removes clients queued for deletion and destroys the sinks they leave unused. Returns
    /// whether any client was removed.
    async fn expire_clients(&self) -> bool {
        let expired = self.clients.expire();
        for id in &expired.clients {
            info!("Client {} expired", id);
        }
        for sink in &expired.sinks {
            self.sinks.destroy(sink).await;
        }
        !expired.clients.is_empty()
    }

    async fn shutdown(self) {
        debug!("Forward service draining {} messages", self.queue.len());
        // Nothing new arrives once intake stopped, so the idle timer no longer matters.
        let mut idle = IdleTimer::new(None);
        loop {
            let batch = self.queue.take_batch(FORWARD_BATCH);
            if batch.is_empty() {
                break;
            }
            for msg in batch {
                self.forward(msg, &mut idle);
            }
        }

        self.sinks.shutdown_all().await;
        debug!("Forward service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CLIENT_TIMEOUT;
    use crate::ingest::IngestService;
    use crate::item::LogLevel;
    use crate::sink::{DatabaseSinkConfig, Sink};
    use crate::store::NullStore;
    use crate::transport::{ClientId, Endpoint};
    use tokio::task::JoinHandle;
    use tracing_test::traced_test;

    struct Fixture {
        queue: Arc<MessageQueue>,
        clients: Arc<ClientRegistry>,
        sinks: Arc<SinkRegistry>,
        status: watch::Receiver<ServerStatus>,
        reload: ForwardHandle,
        intake_token: CancellationToken,
        cancel_token: CancellationToken,
        task: JoinHandle<()>,
        _ingest: IngestService,
    }

    fn start(idle_timeout: Option<Duration>) -> Fixture {
        let queue = Arc::new(MessageQueue::new());
        let bus = Arc::new(FanoutBus::new(256));
        let clients = Arc::new(ClientRegistry::new(CLIENT_TIMEOUT));
        let sinks = Arc::new(SinkRegistry::new(
            Arc::clone(&bus),
            Arc::clone(&clients),
            Arc::new(NullStore),
            DatabaseSinkConfig::default(),
        ));
        let intake_token = CancellationToken::new();
        let (ingest, ingest_handle) = IngestService::new(
            Endpoint::new(),
            Arc::clone(&queue),
            Arc::clone(&clients),
            Duration::from_secs(1),
            intake_token.clone(),
        );
        let (status_tx, status) = watch::channel(ServerStatus::Running);
        let cancel_token = CancellationToken::new();
        let (service, reload) = ForwardService::new(
            Arc::clone(&queue),
            bus,
            Arc::clone(&clients),
            Arc::clone(&sinks),
            ingest_handle,
            Arc::new(status_tx),
            ForwardConfig {
                idle_timeout,
                idle_grace: Duration::from_millis(500),
            },
            intake_token.clone(),
            cancel_token.clone(),
        );
        let task = tokio::spawn(service.spin());
        Fixture {
            queue,
            clients,
            sinks,
            status,
            reload,
            intake_token,
            cancel_token,
            task,
            _ingest: ingest,
        }
    }

    fn record(client: &str, item: LoggingItem) -> WireMessage {
        WireMessage::new(ClientId::new(client.as_bytes().to_vec()), item.to_wire())
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(QUEUE_WAIT * 2).await;
    }

    #[tokio::test]
    async fn test_first_record_creates_sinks_and_is_forwarded() {
        let fixture = start(None);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");

        let item = LoggingItem::new(LogLevel::Info, "first").with_log_file(path.to_str().unwrap());
        fixture.queue.push(record("a", item));
        fixture
            .queue
            .push(record("a", LoggingItem::new(LogLevel::Info, "second")));
        settle().await;

        assert_eq!(fixture.clients.count(), 1);
        assert!(fixture.sinks.get(&SinkId::File(path.clone())).is_some());

        fixture.cancel_token.cancel();
        fixture.task.await.unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("- first"));
        assert!(contents.contains("- second"));
        assert!(fixture.sinks.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_malformed_first_record_registers_nothing() {
        let fixture = start(None);
        fixture.queue.push(WireMessage::new(
            ClientId::new(b"bad".to_vec()),
            b"{not json".to_vec(),
        ));
        settle().await;

        assert_eq!(fixture.clients.count(), 0);
        assert!(fixture.sinks.is_empty());
        assert!(logs_contain("Dropping message from client"));

        fixture.cancel_token.cancel();
        fixture.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_without_registering() {
        let fixture = start(None);
        fixture
            .queue
            .push(WireMessage::heartbeat(ClientId::new(b"ghost".to_vec())));
        settle().await;
        assert_eq!(fixture.clients.count(), 0);

        fixture.cancel_token.cancel();
        fixture.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_reopens_file_sinks() {
        let fixture = start(None);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");

        let item = LoggingItem::new(LogLevel::Info, "before").with_log_file(path.to_str().unwrap());
        fixture.queue.push(record("a", item));
        settle().await;

        std::fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        assert!(fixture.reload.reload());
        settle().await;
        fixture
            .queue
            .push(record("a", LoggingItem::new(LogLevel::Info, "after")));
        settle().await;

        fixture.cancel_token.cancel();
        fixture.task.await.unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("- after"));
        assert!(!contents.contains("- before"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_idle_timer_fires_with_one_client() {
        let mut fixture = start(Some(Duration::from_secs(300)));
        fixture
            .queue
            .push(record("local", LoggingItem::new(LogLevel::Info, "up")));

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(*fixture.status.borrow(), ServerStatus::Running);

        fixture.status.changed().await.unwrap();
        assert_eq!(*fixture.status.borrow(), ServerStatus::Idle);
        assert!(fixture.intake_token.is_cancelled());
        assert!(logs_contain("Shutting down because of idleness"));

        fixture.cancel_token.cancel();
        fixture.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_second_client_cancels_idle_timer() {
        let fixture = start(Some(Duration::from_secs(300)));
        fixture
            .queue
            .push(record("local", LoggingItem::new(LogLevel::Info, "up")));
        tokio::time::sleep(Duration::from_secs(10)).await;
        fixture
            .queue
            .push(record("remote", LoggingItem::new(LogLevel::Info, "hello")));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fixture.clients.count(), 2);
        assert!(logs_contain("Aborting shutdown timer"));

        // Keep both clients alive well past the original deadline.
        for _ in 0..600 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            fixture.clients.touch(&ClientId::new(b"local".to_vec()));
            fixture.clients.touch(&ClientId::new(b"remote".to_vec()));
        }
        assert_eq!(*fixture.status.borrow(), ServerStatus::Running);
        assert!(!fixture.intake_token.is_cancelled());

        fixture.cancel_token.cancel();
        fixture.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_stays_off_when_every_client_expires() {
        let fixture = start(Some(Duration::from_secs(300)));
        fixture
            .queue
            .push(record("a", LoggingItem::new(LogLevel::Info, "a")));
        fixture
            .queue
            .push(record("b", LoggingItem::new(LogLevel::Info, "b")));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fixture.clients.count(), 2);

        // Both go silent and expire in the same sweep: 2 -> 0.
        tokio::time::sleep(Duration::from_secs(6)).await;
        fixture.clients.check_heartbeats();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fixture.clients.count(), 0);

        tokio::time::sleep(Duration::from_secs(400)).await;
        assert_eq!(*fixture.status.borrow(), ServerStatus::Running);
        assert!(!fixture.intake_token.is_cancelled());

        fixture.cancel_token.cancel();
        fixture.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_restarts_when_back_to_one_client() {
        let mut fixture = start(Some(Duration::from_secs(300)));
        let local = ClientId::new(b"local".to_vec());
        fixture
            .queue
            .push(record("local", LoggingItem::new(LogLevel::Info, "up")));
        fixture
            .queue
            .push(record("remote", LoggingItem::new(LogLevel::Info, "hello")));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fixture.clients.count(), 2);

        // Only the remote client goes silent.
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            fixture.clients.touch(&local);
        }
        fixture.clients.check_heartbeats();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fixture.clients.count(), 1);
        let restarted_at = Instant::now();

        fixture.status.changed().await.unwrap();
        assert_eq!(*fixture.status.borrow(), ServerStatus::Idle);
        assert!(restarted_at.elapsed() >= Duration::from_secs(299));

        fixture.cancel_token.cancel();
        fixture.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_clients_release_exclusive_sinks() {
        let fixture = start(None);
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("shared.log");
        let own = dir.path().join("own.log");
        let shared_str = shared.to_str().unwrap();

        fixture.queue.push(record(
            "a",
            LoggingItem::new(LogLevel::Info, "a").with_log_file(shared_str),
        ));
        fixture.queue.push(record(
            "b",
            LoggingItem::new(LogLevel::Info, "b").with_log_file(shared_str),
        ));
        fixture.queue.push(record(
            "c",
            LoggingItem::new(LogLevel::Info, "c").with_log_file(own.to_str().unwrap()),
        ));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fixture.sinks.len(), 2);
        let own_sink = fixture.sinks.get(&SinkId::File(own.clone())).unwrap();

        // b stays alive; a and c go silent.
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            fixture.clients.touch(&ClientId::new(b"b".to_vec()));
        }
        fixture.clients.check_heartbeats();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(fixture.clients.count(), 1);
        assert!(fixture.sinks.get(&SinkId::File(shared.clone())).is_some());
        assert!(fixture.sinks.get(&SinkId::File(own)).is_none());
        assert!(matches!(&*own_sink, Sink::File(f) if !f.is_open()));

        fixture.cancel_token.cancel();
        fixture.task.await.unwrap();
    }
}
