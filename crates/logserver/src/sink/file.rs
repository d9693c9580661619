// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, error};

use crate::item::LoggingItem;
use crate::util::lock;

/// Appends formatted lines to a log file.
///
/// A failed write closes the file; every later write reports failure until [`FileSink::reopen`]
/// succeeds.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

fn open_append(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.append(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o664);
    }
    options.open(path)
}

/// `YYYY-MM-DD HH:MM:SS.uuuuuu C [pid/tid] thread file:line (function) - message`
pub fn format_line(item: &LoggingItem) -> String {
    let ids = if item.tid() == 0 {
        format!("[{}]", item.pid())
    } else {
        format!("[{}/{}]", item.pid(), item.tid())
    };
    format!(
        "{} {} {} {} {}:{} ({}) - {}\n",
        item.timestamp(),
        item.shortname(),
        ids,
        item.thread_name(),
        item.file(),
        item.line(),
        item.function(),
        item.message()
    )
}

impl FileSink {
    /// Opens `path` for appending. A failure is logged and leaves the sink closed.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file = match open_append(&path) {
            Ok(file) => {
                debug!("Opened log file {}", path.display());
                Some(file)
            }
            Err(e) => {
                error!("Failed to open log file {}: {}", path.display(), e);
                None
            }
        };
        Self {
            path,
            file: Mutex::new(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        lock(&self.file).is_some()
    }

    pub fn logmsg(&self, item: &LoggingItem) -> bool {
        let mut guard = lock(&self.file);
        let Some(file) = guard.as_mut() else {
            return false;
        };

        if let Err(e) = file.write_all(format_line(item).as_bytes()) {
            error!(
                "Closing file logger {}: failed to write: {}",
                self.path.display(),
                e
            );
            *guard = None;
            return false;
        }
        true
    }

    /// Closes and reopens the file, e.g. after log rotation. Returns whether the file is open.
    pub fn reopen(&self) -> bool {
        let mut guard = lock(&self.file);
        guard.take();
        match open_append(&self.path) {
            Ok(file) => {
                debug!("Reopened log file {}", self.path.display());
                *guard = Some(file);
                true
            }
            Err(e) => {
                error!("Failed to reopen log file {}: {}", self.path.display(), e);
                false
            }
        }
    }

    pub fn close(&self) {
        if lock(&self.file).take().is_some() {
            debug!("Closed log file {}", self.path.display());
        }
    }

    #[cfg(test)]
    fn replace_file(&self, file: File) {
        *lock(&self.file) = Some(file);
    }
}
