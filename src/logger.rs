//! Global logger module.
//!
//! Source-tagged leveled logging with a bounded in-memory ring buffer and
//! stderr line output. Request and error records have their own sink
//! (`relay::sink`); this logger is for diagnostics only.

use std::collections::VecDeque;
use std::sync::RwLock;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

const RING_CAPACITY: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: i64,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
}

static MIN_LEVEL: RwLock<LogLevel> = RwLock::new(LogLevel::Info);

static RING: Lazy<RwLock<VecDeque<LogEntry>>> =
    Lazy::new(|| RwLock::new(VecDeque::with_capacity(RING_CAPACITY)));

/// Set the minimum level kept by the logger.
pub fn init(min_level: LogLevel) {
    if let Ok(mut level) = MIN_LEVEL.write() {
        *level = min_level;
    }
}

fn log_internal(level: LogLevel, source: &str, message: &str) {
    let min = MIN_LEVEL.read().map(|l| *l).unwrap_or(LogLevel::Info);
    if level < min {
        return;
    }

    let entry = LogEntry {
        timestamp: chrono::Utc::now().timestamp_millis(),
        level,
        source: source.to_string(),
        message: message.to_string(),
    };

    eprintln!("[{}] [{}] {}", entry.level.as_str(), source, message);

    if let Ok(mut ring) = RING.write() {
        if ring.len() >= RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(entry);
    }
}

pub fn debug(source: &str, message: &str) {
    log_internal(LogLevel::Debug, source, message);
}

pub fn info(source: &str, message: &str) {
    log_internal(LogLevel::Info, source, message);
}

pub fn warn(source: &str, message: &str) {
    log_internal(LogLevel::Warn, source, message);
}

pub fn error(source: &str, message: &str) {
    log_internal(LogLevel::Error, source, message);
}

/// Most recent entries, newest first.
pub fn recent(limit: usize) -> Vec<LogEntry> {
    RING.read()
        .map(|ring| ring.iter().rev().take(limit).cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn test_level_round_trip() {
        for level in [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            assert_eq!(LogLevel::from_str(level.as_str()), Some(level));
        }
        assert_eq!(LogLevel::from_str("verbose"), None);
    }

    #[test]
    fn test_recent_returns_entries() {
        error("test", "ring entry");
        let entries = recent(10);
        assert!(entries.iter().any(|e| e.message == "ring entry"));
    }
}
