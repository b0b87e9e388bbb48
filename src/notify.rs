use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ApprovalRequested,
    PromotionRequested,
    PhaseFailed,
    ManualInterventionRequired,
    TaskTerminal,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::ApprovalRequested => "approval_requested",
            NotificationKind::PromotionRequested => "promotion_requested",
            NotificationKind::PhaseFailed => "phase_failed",
            NotificationKind::ManualInterventionRequired => "manual_intervention_required",
            NotificationKind::TaskTerminal => "task_terminal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub task_id: String,
    pub execution_id: Option<String>,
    pub status: String,
    pub summary: String,
    pub trace: String,
    pub at: DateTime<Utc>,
}

/// Outbound notification channel. Delivery is best-effort: failures are
/// logged by [`dispatch`] and never reach the state machine.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Hands `notification` to `notifier` on a detached task.
pub fn dispatch(notifier: &Arc<dyn Notifier>, notification: Notification) {
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        if let Err(err) = notifier.send(&notification).await {
            tracing::warn!(
                kind = notification.kind.as_str(),
                task_id = %notification.task_id,
                error = %err,
                "notification delivery failed"
            );
        }
    });
}

#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, _notification: &Notification) -> Result<()> {
        Ok(())
    }
}

/// Appends one JSON object per notification to a local file.
#[derive(Debug, Clone)]
pub struct JsonlNotifier {
    pub path: PathBuf,
    file_lock: Arc<Mutex<()>>,
}

impl JsonlNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file_lock: Arc::new(Mutex::new(())),
        }
    }

    fn append_line(&self, notification: &Notification) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create notification directory '{}'", parent.display())
            })?;
        }

        let _guard = self.file_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open notification path '{}'", self.path.display()))?;
        serde_json::to_writer(&mut file, notification)
            .context("failed to serialize notification")?;
        writeln!(file).context("failed to write notification newline")
    }
}

#[async_trait]
impl Notifier for JsonlNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let sink = self.clone();
        let notification = notification.clone();
        tokio::task::spawn_blocking(move || sink.append_line(&notification))
            .await
            .context("notification writer panicked")?
    }
}

/// Keeps notifications in memory; handy for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification.clone());
        Ok(())
    }
}

pub fn build_notifier(cfg: &RuntimeConfig) -> Arc<dyn Notifier> {
    if cfg.notify_enabled {
        Arc::new(JsonlNotifier::new(&cfg.notify_path))
    } else {
        Arc::new(NoopNotifier)
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct NotificationSummary {
    pub total_lines: usize,
    pub parsed: usize,
    pub parse_errors: usize,
    pub tasks: BTreeSet<String>,
    pub kind_counts: BTreeMap<String, usize>,
    pub terminal_statuses: BTreeMap<String, usize>,
    pub last_at: Option<DateTime<Utc>>,
}

pub fn summarize_notification_lines(lines: Vec<String>, limit: usize) -> NotificationSummary {
    let mut summary = NotificationSummary {
        total_lines: lines.len(),
        ..NotificationSummary::default()
    };
    for line in lines.into_iter().rev().take(limit.max(1)) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(notification) = serde_json::from_str::<Notification>(line) else {
            summary.parse_errors += 1;
            continue;
        };
        summary.parsed += 1;
        summary.tasks.insert(notification.task_id.clone());
        *summary
            .kind_counts
            .entry(notification.kind.as_str().to_string())
            .or_insert(0) += 1;
        if notification.kind == NotificationKind::TaskTerminal {
            *summary
                .terminal_statuses
                .entry(notification.status.clone())
                .or_insert(0) += 1;
        }
        summary.last_at = Some(
            summary
                .last_at
                .map(|existing| existing.max(notification.at))
                .unwrap_or(notification.at),
        );
    }
    summary
}

pub fn run_notifications_report(cfg: &RuntimeConfig, path_override: Option<String>, limit: usize) -> Result<()> {
    let path = PathBuf::from(path_override.unwrap_or_else(|| cfg.notify_path.clone()));
    if !path.exists() {
        println!("No notification file found at '{}'.", path.display());
        return Ok(());
    }
    let file = std::fs::File::open(&path)
        .with_context(|| format!("failed to open notification file '{}'", path.display()))?;
    let lines = io::BufReader::new(file)
        .lines()
        .collect::<std::result::Result<Vec<String>, std::io::Error>>()
        .with_context(|| format!("failed to read notification file '{}'", path.display()))?;

    let summary = summarize_notification_lines(lines, limit);
    println!("Notification report");
    println!("  file: {}", path.display());
    println!("  lines: {} (parsed {}, errors {})", summary.total_lines, summary.parsed, summary.parse_errors);
    println!("  tasks: {}", summary.tasks.len());
    for (kind, count) in &summary.kind_counts {
        println!("  {kind}: {count}");
    }
    if !summary.terminal_statuses.is_empty() {
        println!("  terminal outcomes:");
        for (status, count) in &summary.terminal_statuses {
            println!("    {status}: {count}");
        }
    }
    if let Some(last) = summary.last_at {
        println!("  last: {}", last.to_rfc3339());
    }
    Ok(())
}
