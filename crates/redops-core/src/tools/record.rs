//! Execution records and per-tool statistics.
//!
//! Every tool invocation (local, remote, or builtin) produces one record
//! in a process-wide log keyed by a fresh UUID. The registry and the remote
//! transport share one log so downstream consumers aggregate all origins
//! through a single schema.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One tool invocation, from dispatch to terminal state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: String,
    pub tool_name: String,
    pub arguments: HashMap<String, Value>,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Milliseconds between start and end.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStats {
    pub tool_name: String,
    pub total_calls: u64,
    pub success_calls: u64,
    pub failed_calls: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_call_time: Option<DateTime<Utc>>,
}

const RESULT_PREVIEW_CHARS: usize = 200;

/// Filter for listing execution records.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub tool_name: Option<String>,
    pub status: Option<ExecutionStatus>,
}

/// In-memory log of execution records plus aggregate statistics.
#[derive(Default)]
pub struct ExecutionLog {
    inner: Mutex<LogInner>,
}

#[derive(Default)]
struct LogInner {
    records: HashMap<String, ExecutionRecord>,
    // Insertion order, for stable listings.
    order: Vec<String>,
    stats: HashMap<String, ToolStats>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running execution and return its ID.
    pub fn begin(&self, tool_name: &str, arguments: &HashMap<String, Value>) -> String {
        let id = Uuid::new_v4().to_string();
        let record = ExecutionRecord {
            id: id.clone(),
            tool_name: tool_name.to_string(),
            arguments: arguments.clone(),
            status: ExecutionStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            result_preview: None,
            error: None,
        };

        let mut inner = self.inner.lock().expect("execution log poisoned");
        inner.order.push(id.clone());
        inner.records.insert(id.clone(), record);
        let stats = inner
            .stats
            .entry(tool_name.to_string())
            .or_insert_with(|| ToolStats {
                tool_name: tool_name.to_string(),
                ..Default::default()
            });
        stats.total_calls += 1;
        stats.last_call_time = Some(Utc::now());
        id
    }

    /// Mark an execution completed with a bounded preview of its result.
    pub fn complete(&self, id: &str, result: &str) {
        self.finish(id, ExecutionStatus::Completed, Some(result), None);
    }

    /// Mark an execution failed, keeping the error text.
    pub fn fail(&self, id: &str, error: &str) {
        self.finish(id, ExecutionStatus::Failed, None, Some(error));
    }

    fn finish(
        &self,
        id: &str,
        status: ExecutionStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) {
        let mut inner = self.inner.lock().expect("execution log poisoned");
        let Some(record) = inner.records.get_mut(id) else {
            return;
        };
        // Terminal states are never mutated again.
        if record.status.is_terminal() {
            return;
        }

        let now = Utc::now();
        record.status = status;
        record.end_time = Some(now);
        record.duration_ms = Some((now - record.start_time).num_milliseconds());
        record.result_preview = result.map(preview);
        record.error = error.map(|e| e.to_string());

        let tool_name = record.tool_name.clone();
        if let Some(stats) = inner.stats.get_mut(&tool_name) {
            match status {
                ExecutionStatus::Failed => stats.failed_calls += 1,
                _ => stats.success_calls += 1,
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<ExecutionRecord> {
        self.inner
            .lock()
            .expect("execution log poisoned")
            .records
            .get(id)
            .cloned()
    }

    /// List records newest-first, filtered and paged.
    pub fn list(&self, filter: &ExecutionFilter, page: usize, limit: usize) -> Vec<ExecutionRecord> {
        let inner = self.inner.lock().expect("execution log poisoned");
        let limit = limit.max(1);
        let page = page.max(1);

        let matching: Vec<&ExecutionRecord> = inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.records.get(id))
            .filter(|r| {
                filter
                    .tool_name
                    .as_ref()
                    .map(|t| &r.tool_name == t)
                    .unwrap_or(true)
                    && filter.status.map(|s| r.status == s).unwrap_or(true)
            })
            .collect();

        matching
            .into_iter()
            .skip((page - 1) * limit)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> Vec<ToolStats> {
        let inner = self.inner.lock().expect("execution log poisoned");
        let mut stats: Vec<ToolStats> = inner.stats.values().cloned().collect();
        stats.sort_by(|a, b| a.tool_name.cmp(&b.tool_name));
        stats
    }
}

fn preview(text: &str) -> String {
    if text.len() <= RESULT_PREVIEW_CHARS {
        return text.to_string();
    }
    let mut end = RESULT_PREVIEW_CHARS;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
