// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Loopback port producers connect to.
pub const DEFAULT_PORT: u16 = 35327;
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// How often the ingest side sweeps client liveness.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
/// A client not heard from for longer than this is expired.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle-shutdown delay once only the local producer remains.
pub const IDLE_SHUTDOWN: Duration = Duration::from_secs(5 * 60);
pub const IDLE_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Upper bound on a single wait for the forward FIFO or a database queue, so loops stay
/// responsive to cancellation.
pub const QUEUE_WAIT: Duration = Duration::from_millis(100);
/// Messages forwarded per loop iteration before client expiry runs again.
pub const FORWARD_BATCH: usize = 100;

pub const DB_QUEUE_CAPACITY: usize = 1_000;
pub const DB_MIN_DISABLED: Duration = Duration::from_millis(1_000);
pub const DB_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DB_ERROR_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the internal fan-out bus. A subscription that falls further behind than this
/// loses the oldest messages it hasn't read yet; delivery to sinks is best effort past this
/// point.
pub const BUS_CAPACITY: usize = 4_096;

/// Longest a syslog send may block when the syslog socket's buffer is full.
pub const SYSLOG_SEND_TIMEOUT: Duration = Duration::from_secs(1);

pub const MAX_FRAME_SIZE: usize = 1_024 * 1_024;
pub const MAX_FRAMES: usize = 16;
