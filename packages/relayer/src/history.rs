//! Completed-task history persisted to a JSON file
//!
//! The record is keyed to one transport contract address; loading it for a
//! different address starts a fresh record.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use alloy::primitives::Address;
use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct HistoryFile {
    transport_address: String,
    end_tasks: Vec<u64>,
}

struct Inner {
    ended: BTreeSet<u64>,
}

/// Task indices that reached a terminal state
pub struct TaskHistoryStore {
    path: PathBuf,
    transport_address: Address,
    inner: Mutex<Inner>,
}

impl TaskHistoryStore {
    /// Load the history for `transport_address`, creating or resetting the
    /// file as needed. Unparsable content is an error.
    pub async fn open(path: impl AsRef<Path>, transport_address: Address) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let ended = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: HistoryFile = serde_json::from_slice(&bytes).wrap_err_with(|| {
                    format!("Task history {} is malformed", path.display())
                })?;
                let recorded: Option<Address> = file.transport_address.parse().ok();
                if recorded == Some(transport_address) {
                    file.end_tasks.into_iter().collect()
                } else {
                    info!(
                        path = %path.display(),
                        previous = %file.transport_address,
                        current = %transport_address,
                        "Transport contract changed, resetting task history"
                    );
                    BTreeSet::new()
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => {
                return Err(e).wrap_err_with(|| format!("Failed to read {}", path.display()))
            }
        };

        let store = Self {
            path,
            transport_address,
            inner: Mutex::new(Inner { ended }),
        };
        {
            let inner = store.inner.lock().await;
            store.persist(&inner).await?;
        }
        Ok(store)
    }

    pub fn transport_address(&self) -> Address {
        self.transport_address
    }

    pub async fn contains(&self, index: u64) -> bool {
        self.inner.lock().await.ended.contains(&index)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.ended.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot(&self) -> BTreeSet<u64> {
        self.inner.lock().await.ended.clone()
    }

    /// Record a task as ended. Returns false if it was already recorded.
    pub async fn record(&self, index: u64) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.ended.insert(index) {
            return Ok(false);
        }
        if let Err(e) = self.persist(&inner).await {
            inner.ended.remove(&index);
            return Err(e);
        }
        debug!(index, "Recorded ended task");
        Ok(true)
    }

    /// Write via a temp file and rename so a crash never leaves a torn file
    async fn persist(&self, inner: &Inner) -> Result<()> {
        let file = HistoryFile {
            transport_address: self.transport_address.to_string(),
            end_tasks: inner.ended.iter().copied().collect(),
        };
        let data = serde_json::to_vec_pretty(&file)?;

        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| eyre!("Task history path {} has no file name", self.path.display()))?;
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(".tmp");
        let tmp = self.path.with_file_name(tmp_name);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .wrap_err_with(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&tmp, &data)
            .await
            .wrap_err_with(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .wrap_err_with(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    #[tokio::test]
    async fn test_creates_file_and_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data").join("history.json");

        let store = TaskHistoryStore::open(&path, addr(1)).await.unwrap();
        assert!(store.is_empty().await);
        assert!(path.exists());

        assert!(store.record(3).await.unwrap());
        assert!(!store.record(3).await.unwrap());
        assert!(store.record(1).await.unwrap());

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["endTasks"], serde_json::json!([1, 3]));
        assert_eq!(raw["transportAddress"], addr(1).to_string());
    }

    #[tokio::test]
    async fn test_reload_same_contract_keeps_history() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");
        {
            let store = TaskHistoryStore::open(&path, addr(1)).await.unwrap();
            store.record(7).await.unwrap();
        }
        let store = TaskHistoryStore::open(&path, addr(1)).await.unwrap();
        assert!(store.contains(7).await);
    }

    #[tokio::test]
    async fn test_contract_change_resets_history() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");
        {
            let store = TaskHistoryStore::open(&path, addr(1)).await.unwrap();
            store.record(7).await.unwrap();
        }
        let store = TaskHistoryStore::open(&path, addr(2)).await.unwrap();
        assert!(!store.contains(7).await);

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["transportAddress"], addr(2).to_string());
        assert_eq!(raw["endTasks"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_malformed_file_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(TaskHistoryStore::open(&path, addr(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_records_are_serialized() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");
        let store = Arc::new(TaskHistoryStore::open(&path, addr(1)).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..20u64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.record(i).await.unwrap() }));
        }
        for h in handles {
            assert!(h.await.unwrap());
        }

        let reopened = TaskHistoryStore::open(&path, addr(1)).await.unwrap();
        assert_eq!(reopened.len().await, 20);
    }
}
