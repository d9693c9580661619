// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Database table sink.
//!
//! Delivery only enqueues. A per-sink worker task waits for the database to become ready, then
//! inserts queued records one at a time. When the queue overflows, or the worker is gone, the
//! sink rejects records for a minimum disabled window and re-enables once the database is ready
//! and the queue has room again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::constants::{
    DB_ERROR_LOG_INTERVAL, DB_MIN_DISABLED, DB_POLL_INTERVAL, DB_QUEUE_CAPACITY,
};
use crate::item::LoggingItem;
use crate::store::{InsertStatement, LogStore};
use crate::util::{get_hostname, lock};

#[derive(Debug, Clone)]
pub struct DatabaseSinkConfig {
    pub queue_capacity: usize,
    /// Minimum time the sink stays disabled before it probes the database again.
    pub min_disabled: Duration,
    pub poll_interval: Duration,
    /// Value bound to the host column of every row.
    pub hostname: String,
}

impl Default for DatabaseSinkConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DB_QUEUE_CAPACITY,
            min_disabled: DB_MIN_DISABLED,
            poll_interval: DB_POLL_INTERVAL,
            hostname: get_hostname(),
        }
    }
}

/// State shared between the sink and its worker.
struct WorkQueue {
    items: Mutex<VecDeque<Arc<LoggingItem>>>,
    capacity: usize,
    notify: Notify,
    abort: CancellationToken,
    running: AtomicBool,
}

impl WorkQueue {
    fn is_full(&self) -> bool {
        lock(&self.items).len() >= self.capacity
    }

    fn len(&self) -> usize {
        lock(&self.items).len()
    }
}

pub struct DatabaseSink {
    table: String,
    store: Arc<dyn LogStore>,
    config: DatabaseSinkConfig,
    queue: Arc<WorkQueue>,
    disabled_since: Mutex<Option<Instant>>,
    table_exists: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DatabaseSink {
    /// Creates the sink and spawns its worker. Must be called within a tokio runtime.
    pub fn open(
        table: impl Into<String>,
        store: Arc<dyn LogStore>,
        config: DatabaseSinkConfig,
    ) -> Self {
        let table = table.into();
        let queue = Arc::new(WorkQueue {
            items: Mutex::new(VecDeque::with_capacity(config.queue_capacity.min(1_024))),
            capacity: config.queue_capacity,
            notify: Notify::new(),
            abort: CancellationToken::new(),
            running: AtomicBool::new(true),
        });

        let worker = tokio::spawn(
            run_worker(
                table.clone(),
                Arc::clone(&store),
                config.clone(),
                Arc::clone(&queue),
            )
            .in_current_span(),
        );
        debug!("Started database logger for table {}", table);

        Self {
            table,
            store,
            config,
            queue,
            disabled_since: Mutex::new(None),
            table_exists: AtomicBool::new(false),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn is_disabled(&self) -> bool {
        lock(&self.disabled_since).is_some()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn disable(&self) {
        *lock(&self.disabled_since) = Some(Instant::now());
    }

    /// The database is connected and the target table exists. A positive table probe is cached.
    async fn is_ready(&self) -> bool {
        if !self.store.is_ready().await {
            return false;
        }
        if !self.table_exists.load(Ordering::Relaxed)
            && self.store.table_exists(&self.table).await
        {
            self.table_exists.store(true, Ordering::Relaxed);
        }
        self.table_exists.load(Ordering::Relaxed)
    }

    pub async fn logmsg(&self, item: &Arc<LoggingItem>) -> bool {
        if !self.queue.running.load(Ordering::SeqCst) {
            self.disable();
        }

        if !self.is_disabled() && self.queue.is_full() {
            self.disable();
            error!("Disabling DB logging: too many messages queued");
            return false;
        }

        let disabled_for = lock(&self.disabled_since).map(|since| since.elapsed());
        if let Some(elapsed) = disabled_for {
            if elapsed > self.config.min_disabled
                && self.is_ready().await
                && !self.queue.is_full()
            {
                lock(&self.disabled_since).take();
                info!("Reenabling DB logging");
            }
        }

        if self.is_disabled() {
            return false;
        }

        lock(&self.queue.items).push_back(Arc::clone(item));
        self.queue.notify.notify_one();
        true
    }

    /// Signals the worker to stop without waiting for it.
    pub fn abort(&self) {
        self.queue.abort.cancel();
        self.queue.notify.notify_one();
    }

    /// Stops the worker and waits for it to exit.
    pub async fn close(&self) {
        self.abort();
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("Database logger for table {} failed: {}", self.table, e);
            }
        }
    }
}

impl Drop for DatabaseSink {
    fn drop(&mut self) {
        self.queue.abort.cancel();
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Waits up to one poll interval for new work or an abort.
async fn wait_for_work(queue: &WorkQueue, poll_interval: Duration) {
    tokio::select! {
        _ = queue.notify.notified() => {}
        _ = queue.abort.cancelled() => {}
        _ = tokio::time::sleep(poll_interval) => {}
    }
}

/// Limits repeated database errors to one log line per interval.
struct ErrorThrottle {
    last: Option<Instant>,
}

impl ErrorThrottle {
    fn should_log(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(at) if now.duration_since(at) < DB_ERROR_LOG_INTERVAL => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

async fn run_worker(
    table: String,
    store: Arc<dyn LogStore>,
    config: DatabaseSinkConfig,
    queue: Arc<WorkQueue>,
) {
    let _running = RunningGuard(&queue.running);

    // Poll until the database is usable or the sink is closed.
    while !queue.abort.is_cancelled() {
        if store.is_ready().await && store.table_exists(&table).await {
            break;
        }
        wait_for_work(&queue, config.poll_interval).await;
    }

    let mut statement: Option<Box<dyn InsertStatement>> = None;
    let mut throttle = ErrorThrottle { last: None };
    while !queue.abort.is_cancelled() {
        if statement.is_none() {
            match store.prepare_insert(&table, &config.hostname).await {
                Ok(prepared) => statement = Some(prepared),
                Err(e) => {
                    if throttle.should_log() {
                        warn!("Failed to prepare insert into {}: {}", table, e);
                    }
                    wait_for_work(&queue, config.poll_interval).await;
                    continue;
                }
            }
        }
        let Some(insert) = statement.as_mut() else {
            continue;
        };

        let next = lock(&queue.items).pop_front();
        let Some(item) = next else {
            wait_for_work(&queue, config.poll_interval).await;
            continue;
        };

        if item.message().is_empty() {
            continue;
        }

        if let Err(e) = insert.execute(&item).await {
            if throttle.should_log() {
                error!("Failed to insert log message into {}: {}", table, e);
            }
            // Retried first, ahead of anything queued meanwhile.
            lock(&queue.items).push_front(item);
            statement = None;
            wait_for_work(&queue, config.poll_interval).await;
        }
    }

    let discarded = {
        let mut items = lock(&queue.items);
        let n = items.len();
        items.clear();
        n
    };
    if discarded > 0 {
        warn!(
            "Database logger for {} discarded {} queued messages on shutdown",
            table, discarded
        );
    }
    info!("Database logger for table {} stopped", table);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::LogLevel;
    use crate::store::{MemoryStore, NullStore};
    use tracing_test::traced_test;

    fn config(queue_capacity: usize) -> DatabaseSinkConfig {
        DatabaseSinkConfig {
            queue_capacity,
            min_disabled: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            hostname: "testhost".to_string(),
        }
    }

    fn item(message: &str) -> Arc<LoggingItem> {
        Arc::new(LoggingItem::new(LogLevel::Info, message))
    }

    async fn wait_for_rows(store: &MemoryStore, table: &str, n: usize) {
        for _ in 0..500 {
            if store.rows(table).len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {} rows in {}", n, table);
    }

    #[tokio::test]
    async fn test_inserts_queued_items_in_order() {
        let store = MemoryStore::with_tables(["logging"]);
        let sink = DatabaseSink::open("logging", Arc::new(store.clone()), config(100));

        for n in 0..5 {
            assert!(sink.logmsg(&item(&format!("message {n}"))).await);
        }
        wait_for_rows(&store, "logging", 5).await;

        let rows = store.rows("logging");
        let messages: Vec<_> = rows.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(
            messages,
            ["message 0", "message 1", "message 2", "message 3", "message 4"]
        );
        assert!(rows.iter().all(|r| r.host == "testhost"));
        sink.close().await;
    }

    #[tokio::test]
    async fn test_empty_messages_are_discarded() {
        let store = MemoryStore::with_tables(["logging"]);
        let sink = DatabaseSink::open("logging", Arc::new(store.clone()), config(100));

        assert!(sink.logmsg(&item("")).await);
        assert!(sink.logmsg(&item("kept")).await);
        wait_for_rows(&store, "logging", 1).await;
        sink.close().await;

        let rows = store.rows("logging");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message, "kept");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_full_queue_disables_then_reenables() {
        let store = MemoryStore::new();
        store.create_table("logging");
        let sink = DatabaseSink::open("logging", Arc::new(store.clone()), config(2));

        // Not ready: the worker holds everything back.
        assert!(sink.logmsg(&item("a")).await);
        assert!(sink.logmsg(&item("b")).await);
        assert!(!sink.logmsg(&item("c")).await);
        assert!(sink.is_disabled());
        assert!(logs_contain("Disabling DB logging: too many messages queued"));

        // Still within the disabled window.
        assert!(!sink.logmsg(&item("d")).await);

        store.set_ready(true);
        wait_for_rows(&store, "logging", 2).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(sink.logmsg(&item("e")).await);
        assert!(!sink.is_disabled());
        assert!(logs_contain("Reenabling DB logging"));
        wait_for_rows(&store, "logging", 3).await;
        sink.close().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_insert_is_retried_at_front() {
        let store = MemoryStore::with_tables(["logging"]);
        store.fail_next(2);
        let sink = DatabaseSink::open("logging", Arc::new(store.clone()), config(100));

        assert!(sink.logmsg(&item("first")).await);
        assert!(sink.logmsg(&item("second")).await);
        wait_for_rows(&store, "logging", 2).await;
        sink.close().await;

        let rows = store.rows("logging");
        assert_eq!(rows[0].message, "first");
        assert_eq!(rows[1].message, "second");
        assert!(logs_contain("Failed to insert log message into logging"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_close_discards_pending_items() {
        let sink = DatabaseSink::open("logging", Arc::new(NullStore), config(100));
        let pending = item("never written");
        assert!(sink.logmsg(&pending).await);
        assert!(sink.logmsg(&item("nor this")).await);
        assert_eq!(Arc::strong_count(&pending), 2);

        sink.close().await;
        assert_eq!(sink.queued(), 0);
        assert_eq!(Arc::strong_count(&pending), 1);
        assert!(logs_contain("discarded 2 queued messages"));
    }

    #[tokio::test]
    async fn test_stopped_worker_keeps_sink_disabled() {
        let store = MemoryStore::with_tables(["logging"]);
        let sink = DatabaseSink::open("logging", Arc::new(store), config(100));
        sink.close().await;

        assert!(!sink.logmsg(&item("late")).await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!sink.logmsg(&item("later")).await);
        assert!(sink.is_disabled());
    }
}
