// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Centralized log forwarding server.
//!
//! Producer processes send structured [`item::LoggingItem`] records over a framed transport. The
//! server tracks every producer with heartbeats, resolves the sinks each producer asks for
//! (file, syslog, database table) and fans every record out to those sinks:
//!
//! ```text
//!  producers ──> ingest ──> FIFO ──> forward ──> fan-out bus ──> sink subscriptions
//!      ^           │                    │                           │
//!      └── ping ───┘<── ping request ───┘                    file / syslog / db worker
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod bus;
pub mod client;
pub mod config;
pub mod constants;
pub mod errors;
pub mod forward;
pub mod ingest;
pub mod item;
pub mod queue;
pub mod registry;
pub mod server;
pub mod sink;
pub mod store;
pub mod transport;
pub mod util;
