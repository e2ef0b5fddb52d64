//! File-backed storage for tool execution results.
//!
//! Oversized tool output is parked here instead of being fed back into the
//! model context. Each execution gets one `<id>.txt` with the raw output and
//! one `<id>.meta.json` sidecar, so anything with filesystem access can read
//! the results directly.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One page of a stored result, split on line terminators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultPage {
    pub lines: Vec<String>,
    pub page: usize,
    pub limit: usize,
    pub total_lines: usize,
    pub total_pages: usize,
}

/// Sidecar metadata persisted next to the raw result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub execution_id: String,
    pub tool_name: String,
    pub total_bytes: usize,
    pub total_lines: usize,
    pub created_at: DateTime<Utc>,
}

/// File-per-execution result store.
///
/// Readers and writers serialise through one store-wide lock; per-ID locking
/// would be a drop-in refinement since the contract only promises that readers
/// never observe a partially written file.
pub struct FileResultStore {
    base_dir: PathBuf,
    lock: RwLock<()>,
}

impl FileResultStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("failed to create result store dir {:?}", base_dir))?;
        Ok(Self {
            base_dir,
            lock: RwLock::new(()),
        })
    }

    fn result_path(&self, execution_id: &str) -> PathBuf {
        self.base_dir.join(format!("{execution_id}.txt"))
    }

    fn metadata_path(&self, execution_id: &str) -> PathBuf {
        self.base_dir.join(format!("{execution_id}.meta.json"))
    }

    /// Persist a result and its metadata sidecar. Single-shot per execution ID.
    pub fn save(&self, execution_id: &str, tool_name: &str, result: &str) -> Result<()> {
        let _guard = self.lock.write().expect("result store lock poisoned");

        fs::write(self.result_path(execution_id), result.as_bytes())
            .with_context(|| format!("failed to write result file for {execution_id}"))?;

        let total_lines = result.split('\n').count();
        let metadata = ResultMetadata {
            execution_id: execution_id.to_string(),
            tool_name: tool_name.to_string(),
            total_bytes: result.len(),
            total_lines,
            created_at: Utc::now(),
        };
        let json = serde_json::to_vec(&metadata)?;
        fs::write(self.metadata_path(execution_id), json)
            .with_context(|| format!("failed to write metadata for {execution_id}"))?;

        tracing::info!(
            execution_id,
            tool = tool_name,
            bytes = result.len(),
            lines = total_lines,
            "saved tool execution result"
        );
        Ok(())
    }

    /// Read the full raw result.
    pub fn get(&self, execution_id: &str) -> Result<String> {
        let _guard = self.lock.read().expect("result store lock poisoned");
        self.read_result(execution_id)
    }

    fn read_result(&self, execution_id: &str) -> Result<String> {
        let path = self.result_path(execution_id);
        match fs::read_to_string(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(anyhow!("result not found: {execution_id}"))
            }
            Err(e) => Err(e).with_context(|| format!("failed to read result file {path:?}")),
        }
    }

    pub fn get_metadata(&self, execution_id: &str) -> Result<ResultMetadata> {
        let _guard = self.lock.read().expect("result store lock poisoned");
        let path = self.metadata_path(execution_id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(anyhow!("result not found: {execution_id}"));
            }
            Err(e) => return Err(e).with_context(|| format!("failed to read metadata {path:?}")),
        };
        serde_json::from_slice(&data).context("failed to parse result metadata")
    }

    /// Read one page of the result, split on `\n`.
    ///
    /// `page` is clamped into `[1, total_pages]`, so callers can walk forward
    /// until the returned page equals `total_pages` without probing.
    pub fn get_page(&self, execution_id: &str, page: usize, limit: usize) -> Result<ResultPage> {
        let _guard = self.lock.read().expect("result store lock poisoned");
        let result = self.read_result(execution_id)?;

        let limit = limit.max(1);
        let lines: Vec<&str> = result.split('\n').collect();
        let total_lines = lines.len();
        let total_pages = total_lines.div_ceil(limit).max(1);

        let page = page.clamp(1, total_pages);
        let start = (page - 1) * limit;
        let end = (start + limit).min(total_lines);
        let page_lines = if start < total_lines {
            lines[start..end].iter().map(|s| s.to_string()).collect()
        } else {
            Vec::new()
        };

        Ok(ResultPage {
            lines: page_lines,
            page,
            limit,
            total_lines,
            total_pages,
        })
    }

    /// Return every line containing `keyword`, in original order.
    pub fn search(&self, execution_id: &str, keyword: &str) -> Result<Vec<String>> {
        let _guard = self.lock.read().expect("result store lock poisoned");
        let result = self.read_result(execution_id)?;
        Ok(result
            .split('\n')
            .filter(|line| line.contains(keyword))
            .map(|line| line.to_string())
            .collect())
    }

    /// Filtering is keyword containment, same scan as [`search`](Self::search).
    pub fn filter(&self, execution_id: &str, predicate: &str) -> Result<Vec<String>> {
        self.search(execution_id, predicate)
    }

    /// Delete a stored result. Deleting an absent ID succeeds.
    pub fn delete(&self, execution_id: &str) -> Result<()> {
        let _guard = self.lock.write().expect("result store lock poisoned");

        for path in [
            self.result_path(execution_id),
            self.metadata_path(execution_id),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("failed to remove {path:?}")),
            }
        }
        tracing::info!(execution_id, "deleted tool execution result");
        Ok(())
    }
}
