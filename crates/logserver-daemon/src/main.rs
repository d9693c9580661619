// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process::ExitCode;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use logserver::config::LogServerConfig;
use logserver::errors::ServerError;
use logserver::item::{LogLevel, LoggingItem};
use logserver::server::{LogServer, LogServerHandle, ServerStatus};

const APP_NAME: &str = "logserver";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Level for the daemon's own diagnostics. An invalid configuration is still reported, at the
/// default level.
fn tracing_level(config: &Result<LogServerConfig, ServerError>) -> &str {
    config
        .as_ref()
        .map_or(DEFAULT_LOG_LEVEL, |config| config.log_level.as_str())
}

fn init_tracing(log_level: &str) {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL)),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let config = LogServerConfig::from_env();
    init_tracing(tracing_level(&config));

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let handle = match LogServer::new(config.clone()).start().await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start log server: {e}");
            return ExitCode::FAILURE;
        }
    };
    if !handle.wait_until_started().await {
        error!("Log server failed to start");
        return ExitCode::FAILURE;
    }

    // The daemon is itself the first client, so the idle timer counts it.
    let local = handle.connect_local(APP_NAME);
    let mut startup = LoggingItem::new(
        LogLevel::Info,
        format!("Log server started on {}", handle.local_addr()),
    )
    .with_app_name(APP_NAME)
    .with_pid(i32::try_from(std::process::id()).unwrap_or_default())
    .with_thread(0, "main");
    if let Some(path) = &config.log_file {
        startup = startup.with_log_file(path.to_string_lossy());
    }
    if let Err(e) = local.send(&startup) {
        warn!("Failed to log startup message: {e}");
    }

    if let Err(e) = wait_for_shutdown(&handle).await {
        error!("Failed to install signal handlers: {e}");
    }

    match handle.stop().await {
        Ok(()) => {
            info!("Log server exited");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error stopping log server: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown(handle: &LogServerHandle) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("Received SIGHUP, reopening log files");
                if !handle.reload() {
                    warn!("Log server is no longer forwarding");
                }
            }
            _ = interrupt.recv() => {
                info!("Received SIGINT, shutting down");
                return Ok(());
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, shutting down");
                return Ok(());
            }
            status = handle.wait_for_exit() => {
                if status == ServerStatus::Idle {
                    info!("Log server went idle, exiting");
                }
                return Ok(());
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(handle: &LogServerHandle) -> std::io::Result<()> {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received Ctrl-C, shutting down");
        }
        status = handle.wait_for_exit() => {
            if status == ServerStatus::Idle {
                info!("Log server went idle, exiting");
            }
        }
    }
    Ok(())
}
