// SPDX-License-Identifier: GPL-2.0-or-later

use common::{time::UnixMicro, LogEntry, LogLevel, Logger};
use std::fmt;
use tokio::sync::broadcast;

/// Logger used everywhere across the application.
pub struct AppLogger {
    /// Internal logging feed.
    feed: broadcast::Sender<LogEntryWithTime>,
}

impl AppLogger {
    /// Creates a new logger.
    #[must_use]
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(64);
        Self { feed }
    }

    /// Subscribes to the log feed and returns a channel that receives all log entries.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntryWithTime> {
        self.feed.subscribe()
    }
}

impl Default for AppLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger for AppLogger {
    /// Sends log entry to all subscribers. The timestamp is applied now.
    fn log(&self, entry: LogEntry) {
        let entry = LogEntryWithTime {
            level: entry.level,
            source: entry.source,
            stream_url: entry.stream_url,
            message: entry.message,
            time: UnixMicro::now(),
        };

        // Print to stdout.
        println!("{entry}");

        // Only returns an error if there are no subscribers.
        self.feed.send(entry).ok();
    }
}

#[derive(Clone, Debug)]
pub struct LogEntryWithTime {
    pub level: LogLevel,
    pub source: &'static str,
    pub stream_url: Option<String>,
    pub message: String,
    pub time: UnixMicro,
}

impl fmt::Display for LogEntryWithTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sec = *self.time / common::time::SECOND;
        let time = chrono::DateTime::from_timestamp(sec, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();

        match &self.stream_url {
            Some(url) => write!(
                f,
                "[{}] {} {}: {}: {}",
                self.level, time, self.source, url, self.message
            ),
            None => write!(f, "[{}] {} {}: {}", self.level, time, self.source, self.message),
        }
    }
}
