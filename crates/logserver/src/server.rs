// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Server lifecycle.
//!
//! [`LogServer::start`] binds the listener, wires the shared state together and spawns the
//! ingest and forward services. The returned [`LogServerHandle`] controls the running server.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{oneshot, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

use crate::bus::FanoutBus;
use crate::config::LogServerConfig;
use crate::constants::BUS_CAPACITY;
use crate::errors::ServerError;
use crate::forward::{ForwardConfig, ForwardHandle, ForwardService};
use crate::ingest::IngestService;
use crate::queue::MessageQueue;
use crate::registry::ClientRegistry;
use crate::sink::SinkRegistry;
use crate::store::{LogStore, NullStore};
use crate::transport::inproc::LocalProducer;
use crate::transport::{tcp, Attachment, Endpoint};

/// Status of the log server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// Services are starting up.
    Starting,
    /// Accepting and forwarding records.
    Running,
    /// Shutting down.
    Stopping,
    /// Fully stopped.
    Stopped,
    /// Intake stopped after the idle timeout; the owner should call [`LogServerHandle::stop`].
    Idle,
}

struct ServerTasks {
    listener: JoinHandle<()>,
    ingest: JoinHandle<()>,
    forward: JoinHandle<()>,
}

/// Handle to a running log server.
pub struct LogServerHandle {
    local_addr: SocketAddr,
    attachment: Attachment,
    status_tx: Arc<watch::Sender<ServerStatus>>,
    forward: ForwardHandle,
    clients: Arc<ClientRegistry>,
    sinks: Arc<SinkRegistry>,
    ingest_token: CancellationToken,
    forward_token: CancellationToken,
    tasks: TokioMutex<Option<ServerTasks>>,
}

impl LogServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn status(&self) -> ServerStatus {
        *self.status_tx.borrow()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ServerStatus> {
        self.status_tx.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.clients.count()
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Waits until startup finished. Returns true if the server is running.
    pub async fn wait_until_started(&self) -> bool {
        let mut rx = self.status_receiver();
        let started = match rx.wait_for(|status| *status != ServerStatus::Starting).await {
            Ok(status) => *status == ServerStatus::Running,
            Err(_) => false,
        };
        started
    }

    /// Waits until the server went idle or was stopped, and returns that status.
    pub async fn wait_for_exit(&self) -> ServerStatus {
        let mut rx = self.status_receiver();
        let exited = rx
            .wait_for(|status| matches!(status, ServerStatus::Idle | ServerStatus::Stopped))
            .await
            .map(|status| *status);
        exited.unwrap_or(ServerStatus::Stopped)
    }

    /// Reopens every file sink. Returns false if the server is no longer forwarding.
    pub fn reload(&self) -> bool {
        self.forward.reload()
    }

    /// Attaches an in-process producer.
    pub fn connect_local(&self, name: &str) -> LocalProducer {
        LocalProducer::connect(self.attachment.clone(), name)
    }

    /// Stops intake, drains what was received to the sinks and closes them. Safe to call more
    /// than once.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return Ok(());
        };
        self.status_tx.send_replace(ServerStatus::Stopping);
        info!("Stopping log server");

        self.ingest_token.cancel();
        let ingest = tasks.ingest.await;
        let listener = tasks.listener.await;

        self.forward_token.cancel();
        let forward = tasks.forward.await;

        self.status_tx.send_replace(ServerStatus::Stopped);
        debug!("Log server stopped");

        for result in [ingest, listener, forward] {
            result.map_err(|e| ServerError::Join(e.to_string()))?;
        }
        Ok(())
    }
}

/// Log server builder.
pub struct LogServer {
    config: LogServerConfig,
    store: Arc<dyn LogStore>,
}

impl LogServer {
    pub fn new(config: LogServerConfig) -> Self {
        Self {
            config,
            store: Arc::new(NullStore),
        }
    }

    /// Database capability used by table sinks.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn LogStore>) -> Self {
        self.store = store;
        self
    }

    /// Starts the server. Fails if the configuration is invalid or the listener can't bind.
    pub async fn start(self) -> Result<LogServerHandle, ServerError> {
        let config = self.config;
        config.validate()?;

        let (status_tx, _) = watch::channel(ServerStatus::Starting);
        let status_tx = Arc::new(status_tx);

        let endpoint = Endpoint::new();
        let attachment = endpoint.attach();
        let ingest_token = CancellationToken::new();
        let (local_addr, listener) = tcp::bind(
            &config.bind_addr(),
            endpoint.attach(),
            ingest_token.child_token(),
        )
        .await?;

        let queue = Arc::new(MessageQueue::new());
        let bus = Arc::new(FanoutBus::new(BUS_CAPACITY));
        let clients = Arc::new(ClientRegistry::new(config.client_timeout));
        let sinks = Arc::new(SinkRegistry::new(
            Arc::clone(&bus),
            Arc::clone(&clients),
            self.store,
            config.database_sink(),
        ));

        let (mut ingest, ingest_handle) = IngestService::new(
            endpoint,
            Arc::clone(&queue),
            Arc::clone(&clients),
            config.heartbeat_interval,
            ingest_token.clone(),
        );
        let (ingest_ready_tx, ingest_ready) = oneshot::channel();
        ingest.notify_ready(ingest_ready_tx);

        let forward_token = CancellationToken::new();
        let (mut forward, forward_handle) = ForwardService::new(
            queue,
            bus,
            Arc::clone(&clients),
            Arc::clone(&sinks),
            ingest_handle,
            Arc::clone(&status_tx),
            ForwardConfig {
                idle_timeout: config.idle_timeout,
                idle_grace: config.idle_grace,
            },
            ingest_token.clone(),
            forward_token.clone(),
        );
        let (forward_ready_tx, forward_ready) = oneshot::channel();
        forward.notify_ready(forward_ready_tx);

        let ingest = tokio::spawn(ingest.spin().in_current_span());
        let forward = tokio::spawn(forward.spin().in_current_span());

        if ingest_ready.await.is_err() || forward_ready.await.is_err() {
            error!("Log server services exited during startup");
            status_tx.send_replace(ServerStatus::Stopped);
        } else {
            status_tx.send_replace(ServerStatus::Running);
            info!("Log server listening on tcp://{}", local_addr);
        }

        Ok(LogServerHandle {
            local_addr,
            attachment,
            status_tx,
            forward: forward_handle,
            clients,
            sinks,
            ingest_token,
            forward_token,
            tasks: TokioMutex::new(Some(ServerTasks {
                listener,
                ingest,
                forward,
            })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;
    use crate::item::{LogLevel, LoggingItem};
    use std::time::Duration;

    fn test_config() -> LogServerConfig {
        LogServerConfig {
            port: 0,
            idle_timeout: None,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let handle = LogServer::new(test_config()).start().await.unwrap();
        assert!(handle.wait_until_started().await);
        assert_eq!(handle.status(), ServerStatus::Running);
        assert_ne!(handle.local_addr().port(), 0);

        handle.stop().await.unwrap();
        assert_eq!(handle.status(), ServerStatus::Stopped);
        assert_eq!(handle.wait_for_exit().await, ServerStatus::Stopped);
        assert!(!handle.reload());

        // A second stop is a no-op.
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let first = LogServer::new(test_config()).start().await.unwrap();
        let config = LogServerConfig {
            port: first.local_addr().port(),
            ..test_config()
        };

        let result = LogServer::new(config).start().await;
        assert!(matches!(
            result,
            Err(ServerError::Transport(TransportError::Bind { .. }))
        ));
        first.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = LogServerConfig {
            log_level: "chatty".to_string(),
            ..test_config()
        };
        assert!(matches!(
            LogServer::new(config).start().await,
            Err(ServerError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_drains_local_records_to_file() {
        let handle = LogServer::new(test_config()).start().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.log");

        let producer = handle.connect_local("test");
        producer
            .send(
                &LoggingItem::new(LogLevel::Notice, "hello")
                    .with_log_file(path.to_str().unwrap()),
            )
            .unwrap();
        for n in 0..50 {
            producer
                .send(&LoggingItem::new(LogLevel::Info, format!("line {n}")))
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 51);
        assert!(contents.lines().last().unwrap().ends_with("- line 49"));
        assert_eq!(handle.sink_count(), 0);
    }
}
