// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

/// Errors raised by the framed transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("couldn't bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("couldn't connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("message with {0} frames exceeds the maximum frame count")]
    TooManyFrames(usize),

    #[error("transport endpoint closed")]
    Closed,
}

/// A wire payload that couldn't be turned into a log record.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("malformed log record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors reported by a [`crate::store::LogStore`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("database not available")]
    Unavailable,

    #[error("table {0} does not exist")]
    MissingTable(String),

    #[error("insert failed: {0}")]
    Insert(String),
}

/// Errors returned by the server lifecycle API.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to start transport: {0}")]
    Transport(#[from] TransportError),

    #[error("Server task failed: {0}")]
    Join(String),
}
