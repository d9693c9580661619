// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log records exchanged between producers and the server.
//!
//! A [`LoggingItem`] is built once (by a producer, or by decoding a wire payload) and is never
//! mutated afterwards. Concurrent deliveries share it as `Arc<LoggingItem>`; the record is freed
//! when the last delivery drops its reference.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::errors::DecodeError;

/// Syslog-style severities, most severe first.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Emerg = 0,
    Alert = 1,
    Crit = 2,
    Err = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

impl LogLevel {
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(LogLevel::Emerg),
            1 => Some(LogLevel::Alert),
            2 => Some(LogLevel::Crit),
            3 => Some(LogLevel::Err),
            4 => Some(LogLevel::Warning),
            5 => Some(LogLevel::Notice),
            6 => Some(LogLevel::Info),
            7 => Some(LogLevel::Debug),
            _ => None,
        }
    }

    /// Single character used in file and syslog lines.
    pub const fn shortname(self) -> char {
        match self {
            LogLevel::Emerg => '!',
            LogLevel::Alert => 'A',
            LogLevel::Crit => 'C',
            LogLevel::Err => 'E',
            LogLevel::Warning => 'W',
            LogLevel::Notice => 'N',
            LogLevel::Info => 'I',
            LogLevel::Debug => 'D',
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::Emerg => "emerg",
            LogLevel::Alert => "alert",
            LogLevel::Crit => "crit",
            LogLevel::Err => "err",
            LogLevel::Warning => "warning",
            LogLevel::Notice => "notice",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shortname for a raw level code; unknown codes render as `-`.
pub fn shortname_for(level: i32) -> char {
    LogLevel::from_code(level).map_or('-', LogLevel::shortname)
}

/// One structured log record.
///
/// The wire form is a JSON object with camelCase keys. Unknown keys are ignored and missing keys
/// take their default, so producers and server can evolve independently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingItem {
    pid: i32,
    tid: i64,
    thread_name: String,
    app_name: String,
    file: String,
    line: i32,
    function: String,
    epoch: i64,
    usec: u32,
    level: i32,
    facility: i32,
    log_file: String,
    table: String,
    message: String,
}

impl LoggingItem {
    /// Creates a record stamped with the current wall time and process id.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            pid: i32::try_from(std::process::id()).unwrap_or_default(),
            epoch: i64::try_from(now.as_secs()).unwrap_or_default(),
            usec: now.subsec_micros(),
            level: level.code(),
            message: message.into(),
            ..Default::default()
        }
    }

    /// Decodes a wire payload.
    pub fn from_wire(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn to_wire(&self) -> Vec<u8> {
        // Serializing a struct of plain strings and integers can't fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    #[must_use]
    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = pid;
        self
    }

    #[must_use]
    pub fn with_thread(mut self, tid: i64, name: impl Into<String>) -> Self {
        self.tid = tid;
        self.thread_name = name.into();
        self
    }

    #[must_use]
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    #[must_use]
    pub fn with_location(
        mut self,
        file: impl Into<String>,
        line: i32,
        function: impl Into<String>,
    ) -> Self {
        self.file = file.into();
        self.line = line;
        self.function = function.into();
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, epoch: i64, usec: u32) -> Self {
        self.epoch = epoch;
        self.usec = usec;
        self
    }

    #[must_use]
    pub fn with_raw_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    /// Routes the record to a log file.
    #[must_use]
    pub fn with_log_file(mut self, path: impl Into<String>) -> Self {
        self.log_file = path.into();
        self
    }

    /// Routes the record to syslog. `facility` is the already-shifted syslog facility code.
    #[must_use]
    pub fn with_facility(mut self, facility: i32) -> Self {
        self.facility = facility;
        self
    }

    /// Routes the record to a database table.
    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn tid(&self) -> i64 {
        self.tid
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn line(&self) -> i32 {
        self.line
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn epoch(&self) -> i64 {
        self.epoch
    }

    pub fn usec(&self) -> u32 {
        self.usec
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn facility(&self) -> i32 {
        self.facility
    }

    pub fn log_file(&self) -> &str {
        &self.log_file
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn shortname(&self) -> char {
        shortname_for(self.level)
    }

    fn local_time(&self) -> Option<DateTime<Local>> {
        DateTime::from_timestamp(self.epoch, 0).map(|utc| utc.with_timezone(&Local))
    }

    /// `YYYY-MM-DD HH:MM:SS` in local time.
    pub fn msgtime(&self) -> String {
        self.local_time()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default()
    }

    /// `YYYY-MM-DD HH:MM:SS.uuuuuu` in local time.
    pub fn timestamp(&self) -> String {
        format!("{}.{:06}", self.msgtime(), self.usec)
    }
}
