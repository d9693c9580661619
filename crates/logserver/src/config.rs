// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    CLIENT_TIMEOUT, DB_MIN_DISABLED, DB_POLL_INTERVAL, DB_QUEUE_CAPACITY, DEFAULT_HOST,
    DEFAULT_PORT, HEARTBEAT_INTERVAL, IDLE_SHUTDOWN, IDLE_SHUTDOWN_GRACE,
};
use crate::errors::ServerError;
use crate::sink::DatabaseSinkConfig;
use crate::util::get_hostname;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration for the log server.
#[derive(Debug, Clone)]
pub struct LogServerConfig {
    /// Address the TCP listener binds to (e.g. "127.0.0.1")
    pub host: String,
    /// TCP port, 0 picks a free port
    pub port: u16,
    /// Delay before shutting down once only one client is left, `None` disables it
    pub idle_timeout: Option<Duration>,
    pub idle_grace: Duration,
    /// How often clients are pinged
    pub heartbeat_interval: Duration,
    /// Clients silent for longer than this are expired
    pub client_timeout: Duration,
    pub db_queue_capacity: usize,
    pub db_min_disabled: Duration,
    pub db_poll_interval: Duration,
    /// Host name written to database rows
    pub hostname: String,
    /// Log level of the server's own diagnostics (trace, debug, info, warn, error)
    pub log_level: String,
    /// File the daemon's own records go to
    pub log_file: Option<PathBuf>,
}

impl Default for LogServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            idle_timeout: Some(IDLE_SHUTDOWN),
            idle_grace: IDLE_SHUTDOWN_GRACE,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            client_timeout: CLIENT_TIMEOUT,
            db_queue_capacity: DB_QUEUE_CAPACITY,
            db_min_disabled: DB_MIN_DISABLED,
            db_poll_interval: DB_POLL_INTERVAL,
            hostname: get_hostname(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|val| val.trim().parse::<T>().ok())
}

impl LogServerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ServerError> {
        let defaults = Self::default();

        let host = env::var("LOGSERVER_HOST").unwrap_or(defaults.host);
        let port = parse_env::<u16>("LOGSERVER_PORT").unwrap_or(defaults.port);
        let idle_timeout = match parse_env::<u64>("LOGSERVER_IDLE_TIMEOUT_SECS") {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.idle_timeout,
        };
        let client_timeout = parse_env::<u64>("LOGSERVER_CLIENT_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.client_timeout);
        let db_queue_capacity =
            parse_env::<usize>("LOGSERVER_DB_QUEUE_SIZE").unwrap_or(defaults.db_queue_capacity);
        let hostname = env::var("LOGSERVER_HOSTNAME")
            .ok()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(defaults.hostname);
        let log_level = env::var("LOGSERVER_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or(defaults.log_level);
        let log_file = env::var("LOGSERVER_LOG_FILE")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        let config = Self {
            host,
            port,
            idle_timeout,
            client_timeout,
            db_queue_capacity,
            hostname,
            log_level,
            log_file,
            ..defaults
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.host.trim().is_empty() {
            return Err(ServerError::InvalidConfig(
                "LOGSERVER_HOST cannot be empty".to_string(),
            ));
        }

        if self.client_timeout.is_zero() {
            return Err(ServerError::InvalidConfig(
                "Client timeout must be greater than 0".to_string(),
            ));
        }

        if self.heartbeat_interval.is_zero() {
            return Err(ServerError::InvalidConfig(
                "Heartbeat interval must be greater than 0".to_string(),
            ));
        }

        if self.db_queue_capacity == 0 {
            return Err(ServerError::InvalidConfig(
                "Database queue size must be greater than 0".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ServerError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn database_sink(&self) -> DatabaseSinkConfig {
        DatabaseSinkConfig {
            queue_capacity: self.db_queue_capacity,
            min_disabled: self.db_min_disabled,
            poll_interval: self.db_poll_interval,
            hostname: self.hostname.clone(),
        }
    }
}
