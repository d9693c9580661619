// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Small helpers shared by the server components.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the guard if a previous holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves the host name recorded in database rows.
///
/// Tries, in order:
/// 1. `LOGSERVER_HOSTNAME`
/// 2. `HOSTNAME`
/// 3. the system host name
/// 4. `"unknown"`
#[must_use]
pub fn get_hostname() -> String {
    for var in ["LOGSERVER_HOSTNAME", "HOSTNAME"] {
        if let Ok(hostname) = std::env::var(var) {
            if !hostname.is_empty() {
                return hostname;
            }
        }
    }

    #[cfg(unix)]
    {
        match nix::unistd::gethostname() {
            Ok(hostname) => {
                if let Some(hostname) = hostname.to_str() {
                    if !hostname.is_empty() {
                        return hostname.to_string();
                    }
                }
            }
            Err(e) => tracing::warn!("Failed to get system hostname: {}", e),
        }
    }

    "unknown".to_string()
}

/// Lowercase hex rendering used for client identifiers in logs.
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
