// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! FIFO shared between the ingest and forward services.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::transport::WireMessage;
use crate::util::lock;

/// Unbounded message FIFO with a wakeup on the empty to non-empty transition.
#[derive(Default)]
pub struct MessageQueue {
    messages: Mutex<VecDeque<WireMessage>>,
    notify: Notify,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, msg: WireMessage) {
        let was_empty = {
            let mut messages = lock(&self.messages);
            let was_empty = messages.is_empty();
            messages.push_back(msg);
            was_empty
        };
        if was_empty {
            self.notify.notify_one();
        }
    }

    /// Waits until the queue is non-empty or `timeout` elapses. Returns whether messages are
    /// available.
    pub async fn wait(&self, timeout: Duration) -> bool {
        if !self.is_empty() {
            return true;
        }
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        !self.is_empty()
    }

    /// Removes up to `max` messages from the front.
    pub fn take_batch(&self, max: usize) -> Vec<WireMessage> {
        let mut messages = lock(&self.messages);
        let n = max.min(messages.len());
        messages.drain(..n).collect()
    }

    pub fn pop(&self) -> Option<WireMessage> {
        lock(&self.messages).pop_front()
    }

    pub fn len(&self) -> usize {
        lock(&self.messages).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.messages).is_empty()
    }
}
