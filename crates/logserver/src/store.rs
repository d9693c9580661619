// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Database capability consumed by the database sink.
//!
//! The server never talks to a database driver directly. A driver implements [`LogStore`] and
//! hands out prepared [`InsertStatement`]s; the crate ships [`MemoryStore`] for tests and
//! embedding, and [`NullStore`] for deployments without a database.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};

use crate::errors::StoreError;
use crate::item::LoggingItem;
use crate::util::lock;

/// One row of the logging table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRow {
    pub host: String,
    pub application: String,
    pub pid: i32,
    pub tid: i64,
    pub thread: String,
    pub filename: String,
    pub line: i32,
    pub function: String,
    /// `YYYY-MM-DD HH:MM:SS`, local time.
    pub msgtime: String,
    pub level: i32,
    pub message: String,
}

impl LogRow {
    pub fn from_item(host: &str, item: &LoggingItem) -> Self {
        Self {
            host: host.to_string(),
            application: item.app_name().to_string(),
            pid: item.pid(),
            tid: item.tid(),
            thread: item.thread_name().to_string(),
            filename: item.file().to_string(),
            line: item.line(),
            function: item.function().to_string(),
            msgtime: item.msgtime(),
            level: item.level(),
            message: item.message().to_string(),
        }
    }
}

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Whether a usable connection to the database exists.
    async fn is_ready(&self) -> bool;

    async fn table_exists(&self, table: &str) -> bool;

    /// Prepares an insert into `table` with the host column bound to `host`.
    async fn prepare_insert(
        &self,
        table: &str,
        host: &str,
    ) -> Result<Box<dyn InsertStatement>, StoreError>;
}

#[async_trait]
pub trait InsertStatement: Send {
    async fn execute(&mut self, item: &LoggingItem) -> Result<(), StoreError>;
}

/// A store that is never ready. Database sinks backed by it stay disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

#[async_trait]
impl LogStore for NullStore {
    async fn is_ready(&self) -> bool {
        false
    }

    async fn table_exists(&self, _table: &str) -> bool {
        false
    }

    async fn prepare_insert(
        &self,
        _table: &str,
        _host: &str,
    ) -> Result<Box<dyn InsertStatement>, StoreError> {
        Err(StoreError::Unavailable)
    }
}

#[derive(Default)]
struct MemoryState {
    tables: HashSet<String>,
    rows: HashMap<String, Vec<LogRow>>,
}

/// In-memory store with scriptable readiness and insert failures.
#[derive(Clone, Default)]
pub struct MemoryStore {
    ready: Arc<AtomicBool>,
    fail_next: Arc<AtomicUsize>,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A ready store with the given tables created.
    pub fn with_tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        for table in tables {
            store.create_table(table);
        }
        store.set_ready(true);
        store
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn create_table(&self, table: impl Into<String>) {
        lock(&self.state).tables.insert(table.into());
    }

    /// Makes the next `n` inserts fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn rows(&self, table: &str) -> Vec<LogRow> {
        lock(&self.state).rows.get(table).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn table_exists(&self, table: &str) -> bool {
        lock(&self.state).tables.contains(table)
    }

    async fn prepare_insert(
        &self,
        table: &str,
        host: &str,
    ) -> Result<Box<dyn InsertStatement>, StoreError> {
        if !self.is_ready().await {
            return Err(StoreError::Unavailable);
        }
        if !self.table_exists(table).await {
            return Err(StoreError::MissingTable(table.to_string()));
        }
        Ok(Box::new(MemoryInsert {
            store: self.clone(),
            table: table.to_string(),
            host: host.to_string(),
        }))
    }
}

struct MemoryInsert {
    store: MemoryStore,
    table: String,
    host: String,
}

#[async_trait]
impl InsertStatement for MemoryInsert {
    async fn execute(&mut self, item: &LoggingItem) -> Result<(), StoreError> {
        let failing = self
            .store
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Insert("injected failure".to_string()));
        }
        if !self.store.ready.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }

        let row = LogRow::from_item(&self.host, item);
        lock(&self.store.state)
            .rows
            .entry(self.table.clone())
            .or_default()
            .push(row);
        Ok(())
    }
}
