//! Append-only audit log of action records
//!
//! The most recent records are kept in memory for queries. When a path is
//! configured every record is also appended to a JSON lines file, which is
//! replayed on startup.

use crate::models::ActionRecord;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

pub struct ActionLog {
    records: RwLock<VecDeque<ActionRecord>>,
    capacity: usize,
    path: Option<PathBuf>,
    file: Mutex<Option<tokio::fs::File>>,
}

impl ActionLog {
    /// Memory-only log
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
            path: None,
            file: Mutex::new(None),
        }
    }

    /// Open (or create) a persistent log, replaying its existing records
    pub async fn open(capacity: usize, path: &Path) -> io::Result<Self> {
        let capacity = capacity.max(1);
        let mut records = VecDeque::with_capacity(capacity);

        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                for (line_no, line) in contents.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ActionRecord>(line) {
                        Ok(record) => {
                            if records.len() == capacity {
                                records.pop_front();
                            }
                            records.push_back(record);
                        }
                        Err(e) => {
                            warn!(path = %path.display(), line = line_no + 1, error = %e, "Skipping unreadable audit record");
                        }
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        debug!(path = %path.display(), records = records.len(), "Opened audit log");
        Ok(Self {
            records: RwLock::new(records),
            capacity,
            path: Some(path.to_path_buf()),
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append a record.
    ///
    /// The in-memory copy is always kept; an error only means the record
    /// did not reach the file.
    pub async fn append(&self, record: &ActionRecord) -> io::Result<()> {
        {
            let mut records = self.records.write().await;
            if records.len() == self.capacity {
                records.pop_front();
            }
            records.push_back(record.clone());
        }

        let mut file = self.file.lock().await;
        if let Some(file) = file.as_mut() {
            let mut line = serde_json::to_vec(record)?;
            line.push(b'\n');
            file.write_all(&line).await?;
            file.flush().await?;
        }
        Ok(())
    }

    /// Newest records first, optionally limited to one namespace
    pub async fn recent(&self, namespace: Option<&str>, limit: usize) -> Vec<ActionRecord> {
        let records = self.records.read().await;
        records
            .iter()
            .rev()
            .filter(|r| namespace.map_or(true, |ns| r.workload().namespace == ns))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Every retained record, oldest first
    pub async fn all(&self) -> Vec<ActionRecord> {
        self.records.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ActionKind, ActionValues, Decision, Recommendation, TargetParameters, WorkloadIdentity,
    };
    use chrono::{Duration, Utc};

    fn record(namespace: &str, replicas: u32) -> ActionRecord {
        let now = Utc::now();
        ActionRecord {
            recommendation: Recommendation {
                workload: WorkloadIdentity::new(namespace, "api", "node-1"),
                action: ActionKind::ScaleDown,
                parameters: TargetParameters {
                    replicas: Some(replicas),
                    ..Default::default()
                },
                confidence: 0.9,
                rationale: "idle".to_string(),
                estimated_savings_kwh: None,
                created_at: now,
                expires_at: now + Duration::seconds(300),
            },
            decision: Decision::Accepted,
            reason: None,
            applied_at: now,
            pre: ActionValues {
                replicas: Some(replicas + 1),
                ..Default::default()
            },
            post: ActionValues {
                replicas: Some(replicas),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let log = ActionLog::in_memory(3);
        for i in 0..5 {
            log.append(&record("shop", i)).await.unwrap();
        }

        let all = log.all().await;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].post.replicas, Some(2));
    }

    #[tokio::test]
    async fn test_recent_is_newest_first_and_filtered() {
        let log = ActionLog::in_memory(10);
        log.append(&record("shop", 1)).await.unwrap();
        log.append(&record("billing", 2)).await.unwrap();
        log.append(&record("shop", 3)).await.unwrap();

        let recent = log.recent(Some("shop"), 10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].post.replicas, Some(3));
        assert_eq!(log.recent(None, 1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_persisted_records_are_replayed() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("audit").join("actions.jsonl");

        {
            let log = ActionLog::open(100, &path).await.unwrap();
            log.append(&record("shop", 1)).await.unwrap();
            log.append(&record("shop", 2)).await.unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);

        let reopened = ActionLog::open(100, &path).await.unwrap();
        let all = reopened.all().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].post.replicas, Some(2));
    }

    #[tokio::test]
    async fn test_unreadable_lines_are_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("actions.jsonl");
        let good = serde_json::to_string(&record("shop", 4)).unwrap();
        std::fs::write(&path, format!("not json\n{}\n", good)).unwrap();

        let log = ActionLog::open(100, &path).await.unwrap();
        assert_eq!(log.len().await, 1);
    }
}
