// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Local syslog sink.
//!
//! Records are only written when they carry a syslog facility. Each record becomes one RFC 3164
//! datagram on the local syslog socket:
//!
//! ```text
//! <PRI>Mmm dd hh:mm:ss app[pid]: C thread file:line (function) message
//! ```
//!
//! Sends block while the socket buffer is full, for at most [`SYSLOG_SEND_TIMEOUT`]; a send that
//! times out drops the record and the sink reports `false` for it.
//!
//! [`SYSLOG_SEND_TIMEOUT`]: crate::constants::SYSLOG_SEND_TIMEOUT

use chrono::{DateTime, Local};

use crate::item::LoggingItem;

/// RFC 3164 header timestamp of the record, in local time.
fn header_time(item: &LoggingItem) -> String {
    DateTime::from_timestamp(item.epoch(), 0)
        .map(|utc| utc.with_timezone(&Local).format("%b %e %H:%M:%S").to_string())
        .unwrap_or_default()
}

/// Formats the datagram for one record. `PRI` is the level combined with the record's facility.
pub fn format_datagram(item: &LoggingItem) -> String {
    let priority = (item.level() & 0x07) | item.facility();
    let app = if item.app_name().is_empty() {
        "logserver"
    } else {
        item.app_name()
    };
    format!(
        "<{}>{} {}[{}]: {} {} {}:{} ({}) {}",
        priority,
        header_time(item),
        app,
        item.pid(),
        item.shortname(),
        item.thread_name(),
        item.file(),
        item.line(),
        item.function(),
        item.message()
    )
}

#[cfg(unix)]
pub use unix::SyslogSink;

#[cfg(not(unix))]
pub use fallback::SyslogSink;

#[cfg(unix)]
mod unix {
    use std::os::unix::net::UnixDatagram;
    use std::path::Path;
    use std::sync::Mutex;

    use tracing::{debug, error, warn};

    use super::format_datagram;
    use crate::constants::SYSLOG_SEND_TIMEOUT;
    use crate::item::LoggingItem;
    use crate::util::lock;

    const SOCKET_PATHS: [&str; 2] = ["/dev/log", "/var/run/syslog"];

    pub struct SyslogSink {
        socket: Mutex<Option<UnixDatagram>>,
    }

    fn connect(path: &Path) -> std::io::Result<UnixDatagram> {
        let socket = UnixDatagram::unbound()?;
        socket.connect(path)?;
        socket.set_write_timeout(Some(SYSLOG_SEND_TIMEOUT))?;
        Ok(socket)
    }

    impl SyslogSink {
        /// Connects to the first available system syslog socket.
        pub fn open() -> Self {
            for path in SOCKET_PATHS {
                match connect(Path::new(path)) {
                    Ok(socket) => {
                        debug!("Connected to syslog at {}", path);
                        return Self {
                            socket: Mutex::new(Some(socket)),
                        };
                    }
                    Err(e) => debug!("Syslog socket {} unavailable: {}", path, e),
                }
            }
            error!("No syslog socket available, syslog logging disabled");
            Self {
                socket: Mutex::new(None),
            }
        }

        pub fn connect_to(path: impl AsRef<Path>) -> Self {
            let path = path.as_ref();
            let socket = match connect(path) {
                Ok(socket) => Some(socket),
                Err(e) => {
                    error!("Failed to connect to syslog at {}: {}", path.display(), e);
                    None
                }
            };
            Self {
                socket: Mutex::new(socket),
            }
        }

        pub fn is_open(&self) -> bool {
            lock(&self.socket).is_some()
        }

        pub fn logmsg(&self, item: &LoggingItem) -> bool {
            if item.facility() <= 0 {
                return false;
            }

            let guard = lock(&self.socket);
            let Some(socket) = guard.as_ref() else {
                return false;
            };
            match socket.send(format_datagram(item).as_bytes()) {
                Ok(_) => true,
                Err(e) => {
                    warn!("Failed to send to syslog: {}", e);
                    false
                }
            }
        }

        pub fn close(&self) {
            lock(&self.socket).take();
        }
    }
}

#[cfg(not(unix))]
mod fallback {
    use crate::item::LoggingItem;

    /// Syslog is not available on this platform; every write reports failure.
    pub struct SyslogSink;

    impl SyslogSink {
        pub fn open() -> Self {
            tracing::warn!("Syslog logging is not supported on this platform");
            Self
        }

        pub fn is_open(&self) -> bool {
            false
        }

        pub fn logmsg(&self, _item: &LoggingItem) -> bool {
            false
        }

        pub fn close(&self) {}
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::item::LogLevel;
    use std::os::unix::net::UnixDatagram;

    const LOG_LOCAL0: i32 = 16 << 3;

    fn item() -> LoggingItem {
        LoggingItem::new(LogLevel::Err, "disk failure")
            .with_pid(321)
            .with_app_name("recorder")
            .with_thread(0, "scheduler")
            .with_location("scheduler.rs", 88, "tick")
    }

    #[test]
    fn test_datagram_format() {
        let datagram = format_datagram(
            &item()
                .with_facility(LOG_LOCAL0)
                .with_timestamp(1_656_581_409, 0),
        );
        assert!(datagram.starts_with("<131>"));
        // "Mmm dd hh:mm:ss" header timestamp, then the tag.
        let header = &datagram[5..20];
        assert_eq!(header.len(), 15);
        assert_eq!(&header[3..4], " ");
        assert_eq!(&header[9..10], ":");
        assert_eq!(
            &datagram[20..],
            " recorder[321]: E scheduler scheduler.rs:88 (tick) disk failure"
        );
    }

    #[test]
    fn test_burst_is_not_dropped() {
        const BURST: usize = 2_000;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("burst.sock");
        let server = UnixDatagram::bind(&path).unwrap();
        let sink = SyslogSink::connect_to(&path);

        let reader = std::thread::spawn(move || {
            let mut buf = [0u8; 512];
            for _ in 0..BURST {
                server.recv(&mut buf).unwrap();
            }
        });

        let record = item().with_facility(LOG_LOCAL0);
        let sent = (0..BURST).filter(|_| sink.logmsg(&record)).count();
        assert_eq!(sent, BURST);
        reader.join().unwrap();
    }

    #[test]
    fn test_sends_only_with_facility() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.sock");
        let server = UnixDatagram::bind(&path).unwrap();

        let sink = SyslogSink::connect_to(&path);
        assert!(sink.is_open());
        assert!(!sink.logmsg(&item()));
        assert!(sink.logmsg(&item().with_facility(LOG_LOCAL0)));

        let mut buf = [0u8; 512];
        let n = server.recv(&mut buf).unwrap();
        let received = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(received.starts_with("<131>"));
        assert!(received.contains(" recorder[321]: E "));

        sink.close();
        assert!(!sink.logmsg(&item().with_facility(LOG_LOCAL0)));
    }

    #[test]
    fn test_unconnected_sink_rejects_everything() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SyslogSink::connect_to(dir.path().join("nobody-home.sock"));
        assert!(!sink.is_open());
        assert!(!sink.logmsg(&item().with_facility(LOG_LOCAL0)));
    }
}
