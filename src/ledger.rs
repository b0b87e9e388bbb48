//! Audit Ledger: append-only decision trail keyed by task id.
//!
//! Events are only ever inserted inside the same transaction as the state
//! change they describe; there is no update or delete path.
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row, SqliteConnection};

use crate::error::{OrchestrationError, OrchestrationResult};
use crate::store::{ms_to_dt, dt_to_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "task.submitted")]
    TaskSubmitted,
    #[serde(rename = "intent.screened")]
    IntentScreened,
    #[serde(rename = "intent.resolved")]
    IntentResolved,
    #[serde(rename = "task.transition")]
    TaskTransition,
    #[serde(rename = "plan.created")]
    PlanCreated,
    #[serde(rename = "plan.validated")]
    PlanValidated,
    #[serde(rename = "tool.invoked")]
    ToolInvoked,
    #[serde(rename = "approval.recorded")]
    ApprovalRecorded,
    #[serde(rename = "execution.created")]
    ExecutionCreated,
    #[serde(rename = "execution.transition")]
    ExecutionTransition,
    #[serde(rename = "execution.control")]
    ExecutionControl,
    #[serde(rename = "phase.transition")]
    PhaseTransition,
    #[serde(rename = "resource.outcome")]
    ResourceOutcome,
    #[serde(rename = "resource.rollback")]
    ResourceRollback,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::TaskSubmitted => "task.submitted",
            EventKind::IntentScreened => "intent.screened",
            EventKind::IntentResolved => "intent.resolved",
            EventKind::TaskTransition => "task.transition",
            EventKind::PlanCreated => "plan.created",
            EventKind::PlanValidated => "plan.validated",
            EventKind::ToolInvoked => "tool.invoked",
            EventKind::ApprovalRecorded => "approval.recorded",
            EventKind::ExecutionCreated => "execution.created",
            EventKind::ExecutionTransition => "execution.transition",
            EventKind::ExecutionControl => "execution.control",
            EventKind::PhaseTransition => "phase.transition",
            EventKind::ResourceOutcome => "resource.outcome",
            EventKind::ResourceRollback => "resource.rollback",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        serde_json::from_value(Value::String(value.to_string())).ok()
    }
}

/// The actor recorded for transitions the engine makes on its own.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Assigned by the store on insert; zero until then.
    pub seq: i64,
    pub task_id: String,
    pub execution_id: Option<String>,
    pub kind: EventKind,
    pub actor: String,
    /// What changed: `task`, `plan`, `execution`, `phase:<n>`, `resource:<id>`, a tool name.
    pub subject: String,
    pub from_state: Option<String>,
    pub to_state: Option<String>,
    pub reason: Option<String>,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(task_id: &str, kind: EventKind, actor: &str, subject: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            seq: 0,
            task_id: task_id.to_string(),
            execution_id: None,
            kind,
            actor: actor.to_string(),
            subject: subject.into(),
            from_state: None,
            to_state: None,
            reason: None,
            payload: Value::Null,
            at,
        }
    }

    pub fn execution(mut self, execution_id: &str) -> Self {
        self.execution_id = Some(execution_id.to_string());
        self
    }

    pub fn transition(mut self, from: Option<&str>, to: &str) -> Self {
        self.from_state = from.map(str::to_string);
        self.to_state = Some(to.to_string());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

pub async fn append(conn: &mut SqliteConnection, event: &AuditEvent) -> OrchestrationResult<i64> {
    let result = sqlx::query(
        "INSERT INTO audit_events
            (task_id, execution_id, kind, actor, subject, from_state, to_state, reason, payload_json, at_ms)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&event.task_id)
    .bind(&event.execution_id)
    .bind(event.kind.as_str())
    .bind(&event.actor)
    .bind(&event.subject)
    .bind(&event.from_state)
    .bind(&event.to_state)
    .bind(&event.reason)
    .bind(serde_json::to_string(&event.payload)?)
    .bind(dt_to_ms(event.at))
    .execute(&mut *conn)
    .await?;
    tracing::debug!(
        task_id = %event.task_id,
        kind = event.kind.as_str(),
        subject = %event.subject,
        to_state = event.to_state.as_deref().unwrap_or("-"),
        "audit event recorded"
    );
    Ok(result.last_insert_rowid())
}

/// Every event for `task_id`, totally ordered by timestamp then insertion.
pub async fn trace(conn: &mut SqliteConnection, task_id: &str) -> OrchestrationResult<Vec<AuditEvent>> {
    let rows = sqlx::query(
        "SELECT seq, task_id, execution_id, kind, actor, subject, from_state, to_state, reason, payload_json, at_ms
         FROM audit_events WHERE task_id = ? ORDER BY at_ms ASC, seq ASC",
    )
    .bind(task_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter()
        .map(|row| {
            let kind: String = row.try_get("kind")?;
            let payload: String = row.try_get("payload_json")?;
            Ok(AuditEvent {
                seq: row.try_get("seq")?,
                task_id: row.try_get("task_id")?,
                execution_id: row.try_get("execution_id")?,
                kind: EventKind::parse(&kind).ok_or_else(|| {
                    OrchestrationError::InvalidInput(format!("unknown audit event kind '{kind}'"))
                })?,
                actor: row.try_get("actor")?,
                subject: row.try_get("subject")?,
                from_state: row.try_get("from_state")?,
                to_state: row.try_get("to_state")?,
                reason: row.try_get("reason")?,
                payload: serde_json::from_str(&payload)?,
                at: ms_to_dt(row.try_get("at_ms")?),
            })
        })
        .collect()
}

pub fn trace_link(task_id: &str) -> String {
    format!("/v1/tasks/{task_id}/audit")
}

/// One line per event: time, actor, kind, subject, transition and reason.
pub fn render_trace(events: &[AuditEvent]) -> String {
    let mut out = String::new();
    for event in events {
        let _ = write!(
            out,
            "{} #{:<4} {:<20} {:<10} {}",
            event.at.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            event.seq,
            event.kind.as_str(),
            event.actor,
            event.subject
        );
        match (&event.from_state, &event.to_state) {
            (Some(from), Some(to)) => {
                let _ = write!(out, " {from} -> {to}");
            }
            (None, Some(to)) => {
                let _ = write!(out, " -> {to}");
            }
            _ => {}
        }
        if let Some(reason) = &event.reason {
            let _ = write!(out, " ({reason})");
        }
        out.push('\n');
    }
    out
}
