//! Append-only JSON-lines log of dispatched results

use crate::dispatch::ResultSink;
use crate::error::DispatchError;
use crate::types::result::EnsembleResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// One line of the results log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub scored_at: DateTime<Utc>,
    pub result: EnsembleResult,
}

/// Persists results as one JSON document per line
pub struct ResultStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl ResultStore {
    /// Open (or create) the log, creating parent directories as needed
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, DispatchError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        info!(path = %path.display(), "Results log opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one result and flush it to disk
    pub async fn append(&self, result: &EnsembleResult) -> Result<(), DispatchError> {
        let record = StoredResult {
            scored_at: Utc::now(),
            result: result.clone(),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        let committed = file.metadata().await?.len();
        if let Err(e) = write_line(&mut file, &line).await {
            // Cut a partial line so the log stays one document per line
            if let Err(truncate) = file.set_len(committed).await {
                warn!(
                    error = %truncate,
                    path = %self.path.display(),
                    "Failed to truncate partial line"
                );
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Read every stored result back.
    ///
    /// Lines that do not parse are logged and skipped.
    pub async fn read_all<P: AsRef<Path>>(path: P) -> Result<Vec<StoredResult>, DispatchError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).await?;
        let mut stored = Vec::new();
        for (number, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => stored.push(record),
                Err(e) => warn!(
                    path = %path.display(),
                    line = number + 1,
                    error = %e,
                    "Skipping unreadable results log line"
                ),
            }
        }
        Ok(stored)
    }
}

async fn write_line(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.flush().await
}

#[async_trait]
impl ResultSink for ResultStore {
    fn name(&self) -> &str {
        "store"
    }

    async fn deliver(&self, result: &EnsembleResult) -> Result<(), DispatchError> {
        self.append(result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_result;

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("results.jsonl");

        let store = ResultStore::open(&path).await.unwrap();
        let first = sample_result("tx_1", 0.2);
        let second = sample_result("tx_2", 0.9);
        store.deliver(&first).await.unwrap();
        store.deliver(&second).await.unwrap();

        let stored = ResultStore::read_all(store.path()).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].result, first);
        assert_eq!(stored[1].result, second);
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");

        ResultStore::open(&path)
            .await
            .unwrap()
            .append(&sample_result("tx_1", 0.2))
            .await
            .unwrap();
        ResultStore::open(&path)
            .await
            .unwrap()
            .append(&sample_result("tx_2", 0.3))
            .await
            .unwrap();

        let stored = ResultStore::read_all(&path).await.unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn test_torn_line_does_not_hide_other_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");

        let store = ResultStore::open(&path).await.unwrap();
        store.append(&sample_result("tx_1", 0.2)).await.unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&path).await.unwrap();
            file.write_all(br#"{"scored_at":"2024-01-01T00:00:00Z","res"#)
                .await
                .unwrap();
            file.write_all(b"\n").await.unwrap();
        }
        store.append(&sample_result("tx_2", 0.9)).await.unwrap();

        let stored = ResultStore::read_all(&path).await.unwrap();
        let ids: Vec<&str> = stored
            .iter()
            .map(|s| s.result.transaction_id.as_str())
            .collect();
        assert_eq!(ids, vec!["tx_1", "tx_2"]);
    }
}
