// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Internal fan-out bus from the forwarder to sink subscriptions.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::transport::WireMessage;
use crate::util::lock;

/// Every subscriber sees every published message. Closing the bus lets subscribers drain what is
/// already buffered before they observe the end of the stream.
pub struct FanoutBus {
    tx: Mutex<Option<broadcast::Sender<Arc<WireMessage>>>>,
}

impl FanoutBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Publishes a message. Returns the number of subscribers it was delivered to.
    pub fn publish(&self, msg: WireMessage) -> usize {
        match lock(&self.tx).as_ref() {
            Some(tx) => tx.send(Arc::new(msg)).unwrap_or(0),
            None => 0,
        }
    }

    /// Returns `None` once the bus is closed.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<Arc<WireMessage>>> {
        lock(&self.tx).as_ref().map(broadcast::Sender::subscribe)
    }

    pub fn close(&self) {
        lock(&self.tx).take();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.tx).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ClientId;

    #[tokio::test]
    async fn test_subscribers_drain_then_see_close() {
        let bus = FanoutBus::new(16);
        let mut a = bus.subscribe().unwrap();
        let mut b = bus.subscribe().unwrap();

        let msg = WireMessage::new(ClientId::new(b"c".to_vec()), b"{}".to_vec());
        assert_eq!(bus.publish(msg.clone()), 2);
        bus.close();

        assert_eq!(*a.recv().await.unwrap(), msg);
        assert_eq!(*b.recv().await.unwrap(), msg);
        assert!(matches!(
            a.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert!(bus.subscribe().is_none());
        assert_eq!(bus.publish(msg), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_oldest_and_keeps_going() {
        let bus = FanoutBus::new(2);
        let mut rx = bus.subscribe().unwrap();
        let msg = |n: u8| WireMessage::new(ClientId::new(vec![n]), vec![n]);
        for n in 0..4 {
            bus.publish(msg(n));
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        assert_eq!(*rx.recv().await.unwrap(), msg(2));
        assert_eq!(*rx.recv().await.unwrap(), msg(3));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = FanoutBus::new(4);
        assert_eq!(
            bus.publish(WireMessage::heartbeat(ClientId::new(vec![1]))),
            0
        );
        assert!(!bus.is_closed());
    }
}
