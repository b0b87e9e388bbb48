//! External change-record collaborator. Records are opened when a plan is
//! approved and closed when the task reaches a terminal state. Failures are
//! logged and never gate the task.
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{RiskClass, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub task_id: String,
    pub summary: String,
    pub risk_class: RiskClass,
    pub affected_resources: Vec<String>,
    pub approvers: Vec<String>,
}

#[async_trait]
pub trait ChangeRecords: Send + Sync {
    /// Opens a record for the task and returns the external reference.
    async fn open(&self, request: &ChangeRequest) -> Result<String>;
    async fn close(&self, task_id: &str, outcome: TaskStatus, reason: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopChangeRecords;

#[async_trait]
impl ChangeRecords for NoopChangeRecords {
    async fn open(&self, request: &ChangeRequest) -> Result<String> {
        Ok(change_reference(&request.task_id))
    }

    async fn close(&self, _task_id: &str, _outcome: TaskStatus, _reason: &str) -> Result<()> {
        Ok(())
    }
}

pub fn change_reference(task_id: &str) -> String {
    format!("CHG-{task_id}")
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum JournalEntry {
    Open {
        reference: String,
        at: DateTime<Utc>,
        #[serde(flatten)]
        request: ChangeRequest,
    },
    Close {
        reference: String,
        task_id: String,
        outcome: TaskStatus,
        reason: String,
        at: DateTime<Utc>,
    },
}

/// Writes open/close actions to a JSONL journal for pickup by an ITSM
/// integration.
#[derive(Debug, Clone)]
pub struct JournalChangeRecords {
    pub path: PathBuf,
    file_lock: Arc<Mutex<()>>,
}

impl JournalChangeRecords {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file_lock: Arc::new(Mutex::new(())),
        }
    }

    fn append(&self, entry: &JournalEntry) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create ITSM journal directory '{}'", parent.display()))?;
        }
        let _guard = self.file_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open ITSM journal '{}'", self.path.display()))?;
        serde_json::to_writer(&mut file, entry).context("failed to serialize ITSM journal entry")?;
        writeln!(file).context("failed to write ITSM journal newline")
    }
}

#[async_trait]
impl ChangeRecords for JournalChangeRecords {
    async fn open(&self, request: &ChangeRequest) -> Result<String> {
        let reference = change_reference(&request.task_id);
        self.append(&JournalEntry::Open {
            reference: reference.clone(),
            at: Utc::now(),
            request: request.clone(),
        })?;
        Ok(reference)
    }

    async fn close(&self, task_id: &str, outcome: TaskStatus, reason: &str) -> Result<()> {
        self.append(&JournalEntry::Close {
            reference: change_reference(task_id),
            task_id: task_id.to_string(),
            outcome,
            reason: reason.to_string(),
            at: Utc::now(),
        })
    }
}

pub fn spawn_open(records: &Arc<dyn ChangeRecords>, request: ChangeRequest) {
    let records = Arc::clone(records);
    tokio::spawn(async move {
        match records.open(&request).await {
            Ok(reference) => {
                tracing::info!(task_id = %request.task_id, reference = %reference, "change record opened")
            }
            Err(err) => tracing::warn!(
                task_id = %request.task_id,
                error = %err,
                "change record open failed"
            ),
        }
    });
}

pub fn spawn_close(records: &Arc<dyn ChangeRecords>, task_id: String, outcome: TaskStatus, reason: String) {
    let records = Arc::clone(records);
    tokio::spawn(async move {
        if let Err(err) = records.close(&task_id, outcome, &reason).await {
            tracing::warn!(task_id = %task_id, error = %err, "change record close failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn journal_writes_open_and_close_entries() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let records = JournalChangeRecords::new(dir.path().join("itsm.jsonl"));
        let reference = records
            .open(&ChangeRequest {
                task_id: "task-1".to_string(),
                summary: "apply kernel patch".to_string(),
                risk_class: RiskClass::StateChangeProd,
                affected_resources: vec!["web-01".to_string()],
                approvers: vec!["bob".to_string(), "carol".to_string()],
            })
            .await
            .expect("open should succeed");
        assert_eq!(reference, "CHG-task-1");
        records
            .close("task-1", TaskStatus::Completed, "all phases passed")
            .await
            .expect("close should succeed");

        let raw = std::fs::read_to_string(&records.path).expect("journal should exist");
        let lines = raw.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"action\":\"open\""));
        assert!(lines[1].contains("\"outcome\":\"completed\""));
    }
}
