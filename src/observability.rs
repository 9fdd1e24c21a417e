//! Structured logging and service metrics
//!
//! In-process counters, gauges and a bounded structured log buffer. Log
//! entries carry the viewer id and a correlation id so one request can be
//! stitched together across the façade, the assembler and the fan-out
//! worker.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

/// Log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured log record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub module: String,
    pub message: String,
    pub viewer_id: Option<String>,
    pub correlation_id: Option<String>,
}

/// Point-in-time copy of all metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
}

/// Shared observability sink for the whole service
pub struct ObservabilityManager {
    logs: RwLock<VecDeque<LogEntry>>,
    counters: RwLock<HashMap<String, u64>>,
    gauges: RwLock<HashMap<String, f64>>,
    log_buffer_size: usize,
    min_level: LogLevel,
}

impl ObservabilityManager {
    pub fn new(log_buffer_size: usize, min_level: LogLevel) -> Self {
        Self {
            logs: RwLock::new(VecDeque::new()),
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            log_buffer_size,
            min_level,
        }
    }

    pub fn log(
        &self,
        level: LogLevel,
        module: &str,
        message: &str,
        viewer_id: Option<&str>,
        correlation_id: Option<&str>,
    ) {
        if level < self.min_level {
            return;
        }
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            module: module.to_string(),
            message: message.to_string(),
            viewer_id: viewer_id.map(str::to_string),
            correlation_id: correlation_id.map(str::to_string),
        };
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        logs.push_back(entry);
        while logs.len() > self.log_buffer_size {
            logs.pop_front();
        }
    }

    pub fn info(&self, module: &str, message: &str) {
        self.log(LogLevel::Info, module, message, None, None);
    }

    pub fn warn(&self, module: &str, message: &str) {
        self.log(LogLevel::Warn, module, message, None, None);
    }

    pub fn error(
        &self,
        module: &str,
        message: &str,
        viewer_id: Option<&str>,
        correlation_id: Option<&str>,
    ) {
        self.log(LogLevel::Error, module, message, viewer_id, correlation_id);
    }

    pub fn increment(&self, name: &str) {
        self.increment_by(name, 1);
    }

    pub fn increment_by(&self, name: &str, by: u64) {
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        *counters.entry(name.to_string()).or_insert(0) += by;
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        let mut gauges = self.gauges.write().unwrap_or_else(|e| e.into_inner());
        gauges.insert(name.to_string(), value);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.read().unwrap_or_else(|e| e.into_inner()).clone(),
            gauges: self.gauges.read().unwrap_or_else(|e| e.into_inner()).clone(),
        }
    }

    pub fn recent_logs(&self, limit: usize) -> Vec<LogEntry> {
        let logs = self.logs.read().unwrap_or_else(|e| e.into_inner());
        logs.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for ObservabilityManager {
    fn default() -> Self {
        Self::new(10_000, LogLevel::Info)
    }
}
