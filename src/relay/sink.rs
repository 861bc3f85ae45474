//! Request/error log records and the opaque sink seam.
//!
//! Persistent storage lives with an external collaborator; the relay only
//! emits records. The bounded in-memory sink is the default backend and
//! feeds the ops endpoints.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct RequestLogRecord {
    pub model: String,
    /// Redacted credential.
    pub key: String,
    pub success: bool,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorLogRecord {
    pub model: String,
    /// Redacted credential.
    pub key: String,
    pub error_type: String,
    pub message: String,
    pub status_code: u16,
    /// Present only when `ERROR_LOG_RECORD_REQUEST_BODY` is set.
    pub request_body: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

pub trait LogSink: Send + Sync {
    fn add_request_log(&self, record: RequestLogRecord);
    fn add_error_log(&self, record: ErrorLogRecord);
}

pub struct MemoryLogSink {
    capacity: usize,
    requests: Mutex<VecDeque<RequestLogRecord>>,
    errors: Mutex<VecDeque<ErrorLogRecord>>,
}

impl MemoryLogSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            requests: Mutex::new(VecDeque::new()),
            errors: Mutex::new(VecDeque::new()),
        }
    }

    pub fn recent_requests(&self, limit: usize) -> Vec<RequestLogRecord> {
        self.requests
            .lock()
            .map(|q| q.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorLogRecord> {
        self.errors
            .lock()
            .map(|q| q.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }
}

impl LogSink for MemoryLogSink {
    fn add_request_log(&self, record: RequestLogRecord) {
        if let Ok(mut queue) = self.requests.lock() {
            if queue.len() >= self.capacity {
                queue.pop_front();
            }
            queue.push_back(record);
        }
    }

    fn add_error_log(&self, record: ErrorLogRecord) {
        if let Ok(mut queue) = self.errors.lock() {
            if queue.len() >= self.capacity {
                queue.pop_front();
            }
            queue.push_back(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_record(model: &str) -> RequestLogRecord {
        RequestLogRecord {
            model: model.to_string(),
            key: "abc...def".to_string(),
            success: true,
            status_code: Some(200),
            latency_ms: 12,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_memory_sink_is_bounded() {
        let sink = MemoryLogSink::new(3);
        for i in 0..5 {
            sink.add_request_log(request_record(&format!("m{}", i)));
        }
        let recent = sink.recent_requests(10);
        assert_eq!(recent.len(), 3);
        // Newest first.
        assert_eq!(recent[0].model, "m4");
        assert_eq!(recent[2].model, "m2");
    }

    #[test]
    fn test_error_records_kept_separately() {
        let sink = MemoryLogSink::new(4);
        sink.add_error_log(ErrorLogRecord {
            model: "m".to_string(),
            key: "abc...def".to_string(),
            error_type: "gemini-chat-stream".to_string(),
            message: "boom".to_string(),
            status_code: 500,
            request_body: None,
            timestamp: Utc::now(),
        });
        assert_eq!(sink.recent_errors(10).len(), 1);
        assert!(sink.recent_requests(10).is_empty());
    }
}
