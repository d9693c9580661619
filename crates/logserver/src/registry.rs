// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Connected producers, the sinks they feed, and heartbeat expiry.
//!
//! A client moves through `unknown -> active -> expiring -> removed`:
//! - its first non-empty message registers it with the sinks it asked for;
//! - any message or heartbeat reply refreshes it;
//! - the liveness sweep queues it for deletion once it's silent for longer than the timeout;
//! - the forwarder then removes it and destroys every sink no other client uses.
//!
//! A removed client that shows up again is treated as new.
//!
//! Locks are always taken in the order clients, reverse map, deletion list.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use hashbrown::HashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::sink::SinkId;
use crate::transport::ClientId;
use crate::util::lock;

struct ClientEntry {
    last_seen: Instant,
    sinks: Vec<SinkId>,
}

/// Result of draining the deletion list.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Expired {
    pub clients: Vec<ClientId>,
    /// Sinks left without any client.
    pub sinks: Vec<SinkId>,
}

pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, ClientEntry>>,
    reverse: Mutex<HashMap<SinkId, Vec<ClientId>>>,
    to_delete: Mutex<Vec<ClientId>>,
    count: AtomicUsize,
    timeout: Duration,
}

impl ClientRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            reverse: Mutex::new(HashMap::new()),
            to_delete: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
            timeout,
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        lock(&self.clients).contains_key(id)
    }

    /// Refreshes a known client. Returns false if the client isn't registered.
    pub fn touch(&self, id: &ClientId) -> bool {
        match lock(&self.clients).get_mut(id) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Registers a new client routed to `sinks`. Returns the client count afterwards.
    pub fn register(&self, id: ClientId, mut sinks: Vec<SinkId>) -> usize {
        sinks.dedup();
        let mut clients = lock(&self.clients);
        if let Some(entry) = clients.get_mut(&id) {
            entry.last_seen = Instant::now();
            return self.count();
        }

        {
            let mut reverse = lock(&self.reverse);
            for sink in &sinks {
                let users = reverse.entry(sink.clone()).or_default();
                if !users.contains(&id) {
                    users.push(id.clone());
                }
            }
        }

        debug!("New client {} with {} sinks", id, sinks.len());
        clients.insert(
            id,
            ClientEntry {
                last_seen: Instant::now(),
                sinks,
            },
        );
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Whether messages from `client` belong on `sink`.
    pub fn serves(&self, sink: &SinkId, client: &ClientId) -> bool {
        lock(&self.reverse)
            .get(sink)
            .is_some_and(|users| users.contains(client))
    }

    pub fn clients_of(&self, sink: &SinkId) -> Vec<ClientId> {
        lock(&self.reverse).get(sink).cloned().unwrap_or_default()
    }

    /// Liveness sweep. Clients silent for longer than the timeout are queued for deletion (once);
    /// every other client is returned so it can be pinged.
    pub fn check_heartbeats(&self) -> Vec<ClientId> {
        let now = Instant::now();
        let clients = lock(&self.clients);
        let mut to_delete = lock(&self.to_delete);

        let mut ping = Vec::with_capacity(clients.len());
        for (id, entry) in clients.iter() {
            if now.duration_since(entry.last_seen) > self.timeout {
                if !to_delete.contains(id) {
                    debug!("Client {} timed out", id);
                    to_delete.push(id.clone());
                }
            } else {
                ping.push(id.clone());
            }
        }
        ping
    }

    pub fn pending_deletion(&self) -> usize {
        lock(&self.to_delete).len()
    }

    /// Removes every client queued for deletion and unlinks it from its sinks.
    pub fn expire(&self) -> Expired {
        let queued = std::mem::take(&mut *lock(&self.to_delete));
        if queued.is_empty() {
            return Expired::default();
        }

        let mut expired = Expired::default();
        let mut clients = lock(&self.clients);
        let mut reverse = lock(&self.reverse);
        for id in queued {
            let Some(entry) = clients.remove(&id) else {
                continue;
            };
            self.count.fetch_sub(1, Ordering::SeqCst);
            debug!("Expiring client {}", id);

            for sink in entry.sinks {
                let now_unused = match reverse.get_mut(&sink) {
                    Some(users) => {
                        users.retain(|user| user != &id);
                        users.is_empty()
                    }
                    None => true,
                };
                if now_unused {
                    reverse.remove(&sink);
                    if !expired.sinks.contains(&sink) {
                        expired.sinks.push(sink);
                    }
                }
            }
            expired.clients.push(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn id(name: &str) -> ClientId {
        ClientId::new(name.as_bytes().to_vec())
    }

    fn file(path: &str) -> SinkId {
        SinkId::File(PathBuf::from(path))
    }

    #[test]
    fn test_register_counts_clients_once() {
        let registry = ClientRegistry::new(TIMEOUT);
        assert_eq!(registry.register(id("a"), vec![file("/tmp/a.log")]), 1);
        assert_eq!(registry.register(id("a"), vec![file("/tmp/a.log")]), 1);
        assert_eq!(registry.register(id("b"), vec![]), 2);
        assert!(registry.contains(&id("a")));
        assert!(registry.serves(&file("/tmp/a.log"), &id("a")));
        assert!(!registry.serves(&file("/tmp/a.log"), &id("b")));
        assert!(!registry.touch(&id("c")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_answering_pings_stays_active() {
        let registry = ClientRegistry::new(TIMEOUT);
        registry.register(id("a"), vec![file("/tmp/a.log")]);

        for _ in 0..10 {
            tokio::time::advance(Duration::from_millis(4_900)).await;
            assert_eq!(registry.check_heartbeats(), vec![id("a")]);
            assert!(registry.touch(&id("a")));
        }
        assert_eq!(registry.expire(), Expired::default());
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_client_is_expired_with_its_sinks() {
        let registry = ClientRegistry::new(TIMEOUT);
        registry.register(id("a"), vec![file("/tmp/a.log"), SinkId::Syslog]);

        tokio::time::advance(Duration::from_millis(4_900)).await;
        assert_eq!(registry.check_heartbeats(), vec![id("a")]);

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(registry.check_heartbeats().is_empty());
        assert!(registry.check_heartbeats().is_empty());
        assert_eq!(registry.pending_deletion(), 1);

        let expired = registry.expire();
        assert_eq!(expired.clients, vec![id("a")]);
        assert_eq!(expired.sinks, vec![file("/tmp/a.log"), SinkId::Syslog]);
        assert_eq!(registry.count(), 0);
        assert!(!registry.contains(&id("a")));

        // Back again: a brand-new client.
        assert_eq!(registry.register(id("a"), vec![]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_sink_survives_until_last_client_expires() {
        let registry = ClientRegistry::new(TIMEOUT);
        let shared = file("/tmp/shared.log");
        registry.register(id("a"), vec![shared.clone()]);
        registry.register(id("b"), vec![shared.clone()]);

        tokio::time::advance(Duration::from_secs(3)).await;
        registry.touch(&id("b"));
        tokio::time::advance(Duration::from_secs(3)).await;
        registry.check_heartbeats();

        let expired = registry.expire();
        assert_eq!(expired.clients, vec![id("a")]);
        assert!(expired.sinks.is_empty());
        assert_eq!(registry.clients_of(&shared), vec![id("b")]);

        tokio::time::advance(Duration::from_secs(6)).await;
        registry.check_heartbeats();
        let expired = registry.expire();
        assert_eq!(expired.clients, vec![id("b")]);
        assert_eq!(expired.sinks, vec![shared]);
    }
}
