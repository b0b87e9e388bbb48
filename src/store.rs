//! Durable state: tasks, plans, approvals, tool invocations, executions,
//! phases, per-resource outcomes and the audit ledger, in one sqlite file.
//!
//! Every state transition goes through a [`StoreTx`] so the row change and
//! its audit event commit together. Task transitions compare-and-swap on the
//! status column; execution updates compare-and-swap on a version column.
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::error::{OrchestrationError, OrchestrationResult};
use crate::ledger::{self, AuditEvent};
use crate::model::{
    ApprovalDecision, ApprovalRecord, ApprovalScope, AutonomyMode, Execution, ExecutionStatus,
    HoldReason, InvocationOutcome, Phase, PhaseSpec, PhaseStatus, Plan, ResourceOutcome,
    ResourceState, RiskClass, Task, TaskStatus, ToolInvocation,
};
use crate::quality::QualityScore;

pub const SCHEMA_VERSION: i64 = 2;

struct Migration {
    version: i64,
    name: &'static str,
    statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        statements: &[
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                intent TEXT NOT NULL,
                context_json TEXT NOT NULL,
                status TEXT NOT NULL,
                risk_class TEXT NULL,
                submitter TEXT NOT NULL,
                agent TEXT NULL,
                revision INTEGER NOT NULL DEFAULT 0,
                idempotency_key TEXT NULL,
                status_reason TEXT NULL,
                approval_deadline_ms INTEGER NULL,
                created_at_ms INTEGER NOT NULL,
                approved_at_ms INTEGER NULL,
                completed_at_ms INTEGER NULL,
                updated_at_ms INTEGER NOT NULL
            )",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_idempotency_key
                ON tasks(idempotency_key) WHERE idempotency_key IS NOT NULL",
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, created_at_ms)",
            "CREATE TABLE IF NOT EXISTS plans (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES tasks(id),
                agent TEXT NOT NULL,
                phases_json TEXT NOT NULL,
                affected_json TEXT NOT NULL,
                risk_class TEXT NOT NULL,
                risk_score INTEGER NOT NULL,
                quality_json TEXT NOT NULL,
                rationale TEXT NOT NULL,
                autonomy TEXT NOT NULL,
                digest TEXT NOT NULL,
                active INTEGER NOT NULL,
                validated INTEGER NOT NULL,
                created_at_ms INTEGER NOT NULL
            )",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_plans_one_active
                ON plans(task_id) WHERE active = 1",
            "CREATE TABLE IF NOT EXISTS approvals (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES tasks(id),
                plan_id TEXT NOT NULL REFERENCES plans(id),
                approver_id TEXT NOT NULL,
                decision TEXT NOT NULL,
                scope TEXT NOT NULL,
                notes TEXT NULL,
                sequence INTEGER NOT NULL,
                created_at_ms INTEGER NOT NULL,
                UNIQUE(plan_id, scope, approver_id, decision)
            )",
            "CREATE TABLE IF NOT EXISTS tool_invocations (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES tasks(id),
                execution_id TEXT NULL,
                tool TEXT NOT NULL,
                risk_class TEXT NOT NULL,
                input_json TEXT NOT NULL,
                output_json TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_tool_invocations_task
                ON tool_invocations(task_id, created_at_ms)",
            "CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES tasks(id),
                plan_id TEXT NOT NULL REFERENCES plans(id),
                status TEXT NOT NULL,
                active INTEGER NOT NULL,
                current_phase INTEGER NOT NULL,
                phase_count INTEGER NOT NULL,
                version INTEGER NOT NULL,
                pause_requested INTEGER NOT NULL DEFAULT 0,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                hold TEXT NULL,
                status_reason TEXT NULL,
                deadline_ms INTEGER NOT NULL,
                resume_at_ms INTEGER NULL,
                paused_at_ms INTEGER NULL,
                started_at_ms INTEGER NOT NULL,
                completed_at_ms INTEGER NULL
            )",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_one_active
                ON executions(task_id) WHERE active = 1",
            "CREATE TABLE IF NOT EXISTS phases (
                execution_id TEXT NOT NULL REFERENCES executions(id),
                idx INTEGER NOT NULL,
                spec_json TEXT NOT NULL,
                status TEXT NOT NULL,
                failure_fraction REAL NULL,
                started_at_ms INTEGER NULL,
                completed_at_ms INTEGER NULL,
                PRIMARY KEY (execution_id, idx)
            )",
            "CREATE TABLE IF NOT EXISTS resource_outcomes (
                execution_id TEXT NOT NULL REFERENCES executions(id),
                phase_index INTEGER NOT NULL,
                resource_id TEXT NOT NULL,
                state TEXT NOT NULL,
                detail TEXT NULL,
                completion_seq INTEGER NULL,
                updated_at_ms INTEGER NOT NULL,
                PRIMARY KEY (execution_id, phase_index, resource_id)
            )",
        ],
    },
    Migration {
        version: 2,
        name: "audit_ledger",
        statements: &[
            "CREATE TABLE IF NOT EXISTS audit_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                execution_id TEXT NULL,
                kind TEXT NOT NULL,
                actor TEXT NOT NULL,
                subject TEXT NOT NULL,
                from_state TEXT NULL,
                to_state TEXT NULL,
                reason TEXT NULL,
                payload_json TEXT NOT NULL,
                at_ms INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_audit_events_task ON audit_events(task_id, at_ms, seq)",
        ],
    },
];

// ---------------------------------------------------------------------------
// Connection helpers
// ---------------------------------------------------------------------------

pub fn ensure_parent_dir_for_sqlite_url(db_url: &str) -> OrchestrationResult<()> {
    let Some(db_path) = sqlite_path_from_url(db_url) else {
        return Ok(());
    };
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|err| {
            OrchestrationError::InvalidInput(format!(
                "failed to create directory for sqlite database {}: {err}",
                parent.display()
            ))
        })?;
    }
    Ok(())
}

pub fn sqlite_path_from_url(db_url: &str) -> Option<PathBuf> {
    let path_with_params = db_url
        .strip_prefix("sqlite://")
        .or_else(|| db_url.strip_prefix("sqlite:"))?;
    let path_without_params = path_with_params
        .split_once('?')
        .map(|(path, _)| path)
        .unwrap_or(path_with_params);
    if path_without_params.is_empty() || path_without_params == ":memory:" {
        return None;
    }
    Some(Path::new(path_without_params).to_path_buf())
}

pub fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn opt_ms(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(dt_to_ms)
}

fn opt_dt(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(ms_to_dt)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("2067") | Some("1555"))
                || db.message().contains("UNIQUE constraint failed")
        }
        _ => false,
    }
}

fn corrupt(column: &str, value: &str) -> OrchestrationError {
    OrchestrationError::InvalidInput(format!("stored {column} has unknown value '{value}'"))
}

fn json_column<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> OrchestrationResult<T> {
    let raw: String = row.try_get(column)?;
    Ok(serde_json::from_str(&raw)?)
}

fn index_column(row: &SqliteRow, column: &str) -> OrchestrationResult<usize> {
    let raw: i64 = row.try_get(column)?;
    usize::try_from(raw).map_err(|_| corrupt(column, &raw.to_string()))
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens the database without touching the schema.
    ///
    /// The pool holds a single connection: sqlite admits one writer, and a
    /// single connection serializes write transactions instead of surfacing
    /// `SQLITE_BUSY` on lock upgrades.
    pub async fn connect(db_url: &str) -> OrchestrationResult<Self> {
        ensure_parent_dir_for_sqlite_url(db_url)?;
        let in_memory = sqlite_path_from_url(db_url).is_none();
        let mut options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }
        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30));
        if in_memory {
            // An in-memory database lives only as long as its connection.
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;
        Ok(Self { pool })
    }

    /// Opens the database and applies pending migrations.
    pub async fn open(db_url: &str) -> OrchestrationResult<Self> {
        let store = Self::connect(db_url).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn schema_version(&self) -> OrchestrationResult<i64> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
        )
        .fetch_one(&self.pool)
        .await?;
        if exists == 0 {
            return Ok(0);
        }
        let version: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
                .fetch_one(&self.pool)
                .await?;
        Ok(version)
    }

    /// Applies every migration newer than the recorded schema version and
    /// returns the resulting version.
    pub async fn migrate(&self) -> OrchestrationResult<i64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at_ms INTEGER NOT NULL
            )",
        )
        .execute(&mut *tx)
        .await?;
        let current_version: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
                .fetch_one(&mut *tx)
                .await?;
        let mut version = current_version;
        for migration in MIGRATIONS.iter().filter(|m| m.version > current_version) {
            for statement in migration.statements {
                sqlx::query(statement).execute(&mut *tx).await?;
            }
            sqlx::query(
                "INSERT INTO schema_migrations (version, name, applied_at_ms) VALUES (?, ?, ?)",
            )
            .bind(migration.version)
            .bind(migration.name)
            .bind(dt_to_ms(Utc::now()))
            .execute(&mut *tx)
            .await?;
            tracing::info!(version = migration.version, name = migration.name, "applied migration");
            version = migration.version;
        }
        tx.commit().await?;
        Ok(version)
    }

    pub async fn begin(&self) -> OrchestrationResult<StoreTx> {
        Ok(StoreTx {
            tx: self.pool.begin().await?,
        })
    }

    // -- tasks ---------------------------------------------------------------

    pub async fn get_task(&self, task_id: &str) -> OrchestrationResult<Task> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => task_from_row(&row),
            None => Err(OrchestrationError::NotFound {
                kind: "task",
                id: task_id.to_string(),
            }),
        }
    }

    pub async fn find_task_by_idempotency_key(&self, key: &str) -> OrchestrationResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE idempotency_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>, limit: u32) -> OrchestrationResult<Vec<Task>> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM tasks WHERE status = ? ORDER BY created_at_ms DESC, id LIMIT ?")
                    .bind(status.as_str())
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM tasks ORDER BY created_at_ms DESC, id LIMIT ?")
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(task_from_row).collect()
    }

    /// Ids of tasks still pending approval whose deadline has passed.
    pub async fn expired_approvals(&self, now: DateTime<Utc>) -> OrchestrationResult<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM tasks
             WHERE status = 'pending_approval' AND approval_deadline_ms IS NOT NULL AND approval_deadline_ms <= ?
             ORDER BY approval_deadline_ms, id",
        )
        .bind(dt_to_ms(now))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    // -- plans ---------------------------------------------------------------

    pub async fn get_plan(&self, plan_id: &str) -> OrchestrationResult<Plan> {
        let row = sqlx::query("SELECT * FROM plans WHERE id = ?")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => plan_from_row(&row),
            None => Err(OrchestrationError::NotFound {
                kind: "plan",
                id: plan_id.to_string(),
            }),
        }
    }

    pub async fn active_plan(&self, task_id: &str) -> OrchestrationResult<Option<Plan>> {
        let row = sqlx::query("SELECT * FROM plans WHERE task_id = ? AND active = 1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(plan_from_row).transpose()
    }

    pub async fn plans_for_task(&self, task_id: &str) -> OrchestrationResult<Vec<Plan>> {
        let rows = sqlx::query("SELECT * FROM plans WHERE task_id = ? ORDER BY created_at_ms, rowid")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(plan_from_row).collect()
    }

    // -- approvals and invocations -------------------------------------------

    pub async fn approvals_for_task(&self, task_id: &str) -> OrchestrationResult<Vec<ApprovalRecord>> {
        let rows = sqlx::query("SELECT * FROM approvals WHERE task_id = ? ORDER BY sequence")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(approval_from_row).collect()
    }

    pub async fn invocations_for_task(&self, task_id: &str) -> OrchestrationResult<Vec<ToolInvocation>> {
        let rows = sqlx::query(
            "SELECT * FROM tool_invocations WHERE task_id = ? ORDER BY created_at_ms, rowid",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(invocation_from_row).collect()
    }

    // -- executions ----------------------------------------------------------

    pub async fn get_execution(&self, execution_id: &str) -> OrchestrationResult<Execution> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => execution_from_row(&row),
            None => Err(OrchestrationError::NotFound {
                kind: "execution",
                id: execution_id.to_string(),
            }),
        }
    }

    pub async fn active_execution(&self, task_id: &str) -> OrchestrationResult<Option<Execution>> {
        let row = sqlx::query("SELECT * FROM executions WHERE task_id = ? AND active = 1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(execution_from_row).transpose()
    }

    pub async fn executions_for_task(&self, task_id: &str) -> OrchestrationResult<Vec<Execution>> {
        let rows = sqlx::query("SELECT * FROM executions WHERE task_id = ? ORDER BY started_at_ms, rowid")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(execution_from_row).collect()
    }

    /// Non-terminal executions with work to do at `now`: runnable and not
    /// waiting, past their global deadline, or carrying a cancel request.
    pub async fn due_executions(&self, now: DateTime<Utc>) -> OrchestrationResult<Vec<Execution>> {
        let now_ms = dt_to_ms(now);
        let rows = sqlx::query(
            "SELECT * FROM executions
             WHERE active = 1 AND (
                deadline_ms <= ?
                OR cancel_requested = 1
                OR (status IN ('created', 'running') AND (resume_at_ms IS NULL OR resume_at_ms <= ?))
             )
             ORDER BY started_at_ms, id",
        )
        .bind(now_ms)
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(execution_from_row).collect()
    }

    pub async fn phases(&self, execution_id: &str) -> OrchestrationResult<Vec<Phase>> {
        let rows = sqlx::query("SELECT * FROM phases WHERE execution_id = ? ORDER BY idx")
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(phase_from_row).collect()
    }

    pub async fn outcomes(&self, execution_id: &str, phase_index: usize) -> OrchestrationResult<Vec<ResourceOutcome>> {
        let rows = sqlx::query(
            "SELECT * FROM resource_outcomes WHERE execution_id = ? AND phase_index = ?
             ORDER BY COALESCE(completion_seq, 9223372036854775807), resource_id",
        )
        .bind(execution_id)
        .bind(phase_index as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(outcome_from_row).collect()
    }

    pub async fn all_outcomes(&self, execution_id: &str) -> OrchestrationResult<Vec<ResourceOutcome>> {
        let rows = sqlx::query(
            "SELECT * FROM resource_outcomes WHERE execution_id = ?
             ORDER BY phase_index, COALESCE(completion_seq, 9223372036854775807), resource_id",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(outcome_from_row).collect()
    }

    // -- ledger --------------------------------------------------------------

    pub async fn trace(&self, task_id: &str) -> OrchestrationResult<Vec<AuditEvent>> {
        let mut conn = self.pool.acquire().await?;
        ledger::trace(&mut conn, task_id).await
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// One write transaction. Dropping it without `commit` rolls back.
pub struct StoreTx {
    tx: Transaction<'static, Sqlite>,
}

impl StoreTx {
    pub async fn commit(self) -> OrchestrationResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn append(&mut self, event: &AuditEvent) -> OrchestrationResult<i64> {
        ledger::append(&mut self.tx, event).await
    }

    pub async fn insert_task(&mut self, task: &Task) -> OrchestrationResult<()> {
        let result = sqlx::query(
            "INSERT INTO tasks
                (id, intent, context_json, status, risk_class, submitter, agent, revision, idempotency_key,
                 status_reason, approval_deadline_ms, created_at_ms, approved_at_ms, completed_at_ms, updated_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.intent)
        .bind(serde_json::to_string(&task.context)?)
        .bind(task.status.as_str())
        .bind(task.risk_class.map(RiskClass::as_str))
        .bind(&task.submitter)
        .bind(&task.agent)
        .bind(i64::from(task.revision))
        .bind(&task.idempotency_key)
        .bind(&task.status_reason)
        .bind(opt_ms(task.approval_deadline))
        .bind(dt_to_ms(task.created_at))
        .bind(opt_ms(task.approved_at))
        .bind(opt_ms(task.completed_at))
        .bind(dt_to_ms(task.created_at))
        .execute(&mut *self.tx)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(OrchestrationError::InvalidInput(format!(
                "idempotency key '{}' is already in use",
                task.idempotency_key.as_deref().unwrap_or_default()
            ))),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes every mutable column of `task` if its stored status is still
    /// `expected`. A lost race surfaces as `InvalidTransition` naming the
    /// status actually found.
    pub async fn update_task(&mut self, task: &Task, expected: TaskStatus, now: DateTime<Utc>) -> OrchestrationResult<()> {
        let result = sqlx::query(
            "UPDATE tasks SET
                context_json = ?, status = ?, risk_class = ?, agent = ?, revision = ?, status_reason = ?,
                approval_deadline_ms = ?, approved_at_ms = ?, completed_at_ms = ?, updated_at_ms = ?
             WHERE id = ? AND status = ?",
        )
        .bind(serde_json::to_string(&task.context)?)
        .bind(task.status.as_str())
        .bind(task.risk_class.map(RiskClass::as_str))
        .bind(&task.agent)
        .bind(i64::from(task.revision))
        .bind(&task.status_reason)
        .bind(opt_ms(task.approval_deadline))
        .bind(opt_ms(task.approved_at))
        .bind(opt_ms(task.completed_at))
        .bind(dt_to_ms(now))
        .bind(&task.id)
        .bind(expected.as_str())
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }
        let found: Option<String> = sqlx::query_scalar("SELECT status FROM tasks WHERE id = ?")
            .bind(&task.id)
            .fetch_optional(&mut *self.tx)
            .await?;
        match found {
            Some(state) => Err(OrchestrationError::InvalidTransition {
                subject: format!("task '{}'", task.id),
                state,
                action: format!("move to {}", task.status),
            }),
            None => Err(OrchestrationError::NotFound {
                kind: "task",
                id: task.id.clone(),
            }),
        }
    }

    pub async fn deactivate_plans(&mut self, task_id: &str) -> OrchestrationResult<u64> {
        let result = sqlx::query("UPDATE plans SET active = 0 WHERE task_id = ? AND active = 1")
            .bind(task_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn insert_plan(&mut self, plan: &Plan) -> OrchestrationResult<()> {
        let result = sqlx::query(
            "INSERT INTO plans
                (id, task_id, agent, phases_json, affected_json, risk_class, risk_score, quality_json,
                 rationale, autonomy, digest, active, validated, created_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&plan.id)
        .bind(&plan.task_id)
        .bind(&plan.agent)
        .bind(serde_json::to_string(&plan.phases)?)
        .bind(serde_json::to_string(&plan.affected_resources)?)
        .bind(plan.risk_class.as_str())
        .bind(i64::from(plan.risk_score))
        .bind(serde_json::to_string(&plan.quality)?)
        .bind(&plan.rationale)
        .bind(plan.autonomy.as_str())
        .bind(&plan.digest)
        .bind(plan.active)
        .bind(plan.validated)
        .bind(dt_to_ms(plan.created_at))
        .execute(&mut *self.tx)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(OrchestrationError::ActivePlanExists {
                task_id: plan.task_id.clone(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn insert_invocation(&mut self, invocation: &ToolInvocation) -> OrchestrationResult<()> {
        sqlx::query(
            "INSERT INTO tool_invocations
                (id, task_id, execution_id, tool, risk_class, input_json, output_json, duration_ms, outcome, created_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&invocation.id)
        .bind(&invocation.task_id)
        .bind(&invocation.execution_id)
        .bind(&invocation.tool)
        .bind(invocation.risk_class.as_str())
        .bind(serde_json::to_string(&invocation.input)?)
        .bind(serde_json::to_string(&invocation.output)?)
        .bind(i64::try_from(invocation.duration_ms).unwrap_or(i64::MAX))
        .bind(match invocation.outcome {
            InvocationOutcome::Success => "success",
            InvocationOutcome::Error => "error",
        })
        .bind(dt_to_ms(invocation.created_at))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Inserts an approval decision, assigning the next per-task sequence.
    /// Returns `false` when the same principal already recorded the same
    /// decision for the same plan and scope; the repeat is a no-op.
    pub async fn insert_approval(&mut self, record: &mut ApprovalRecord) -> OrchestrationResult<bool> {
        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM approvals WHERE task_id = ?",
        )
        .bind(&record.task_id)
        .fetch_one(&mut *self.tx)
        .await?;
        record.sequence = u32::try_from(next).unwrap_or(u32::MAX);
        let result = sqlx::query(
            "INSERT OR IGNORE INTO approvals
                (id, task_id, plan_id, approver_id, decision, scope, notes, sequence, created_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.task_id)
        .bind(&record.plan_id)
        .bind(&record.approver_id)
        .bind(record.decision.as_str())
        .bind(record.scope.key())
        .bind(&record.notes)
        .bind(next)
        .bind(dt_to_ms(record.created_at))
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn approvals_for_task(&mut self, task_id: &str) -> OrchestrationResult<Vec<ApprovalRecord>> {
        let rows = sqlx::query("SELECT * FROM approvals WHERE task_id = ? ORDER BY sequence")
            .bind(task_id)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(approval_from_row).collect()
    }

    pub async fn insert_execution(&mut self, execution: &Execution, phases: &[Phase]) -> OrchestrationResult<()> {
        let result = sqlx::query(
            "INSERT INTO executions
                (id, task_id, plan_id, status, active, current_phase, phase_count, version, pause_requested,
                 cancel_requested, hold, status_reason, deadline_ms, resume_at_ms, paused_at_ms, started_at_ms,
                 completed_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&execution.id)
        .bind(&execution.task_id)
        .bind(&execution.plan_id)
        .bind(execution.status.as_str())
        .bind(!execution.status.is_terminal())
        .bind(execution.current_phase as i64)
        .bind(execution.phase_count as i64)
        .bind(execution.version)
        .bind(execution.pause_requested)
        .bind(execution.cancel_requested)
        .bind(execution.hold.map(HoldReason::as_str))
        .bind(&execution.status_reason)
        .bind(dt_to_ms(execution.deadline))
        .bind(opt_ms(execution.resume_at))
        .bind(opt_ms(execution.paused_at))
        .bind(dt_to_ms(execution.started_at))
        .bind(opt_ms(execution.completed_at))
        .execute(&mut *self.tx)
        .await;
        match result {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(OrchestrationError::ActiveExecutionExists {
                    task_id: execution.task_id.clone(),
                });
            }
            Err(err) => return Err(err.into()),
        }
        for phase in phases {
            sqlx::query(
                "INSERT INTO phases (execution_id, idx, spec_json, status, failure_fraction, started_at_ms, completed_at_ms)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&phase.execution_id)
            .bind(phase.index as i64)
            .bind(serde_json::to_string(&phase.spec)?)
            .bind(phase.status.as_str())
            .bind(phase.failure_fraction)
            .bind(opt_ms(phase.started_at))
            .bind(opt_ms(phase.completed_at))
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    /// Writes `execution` if nobody else has since the caller read it, then
    /// bumps the in-memory version to match the stored one.
    pub async fn update_execution(&mut self, execution: &mut Execution) -> OrchestrationResult<()> {
        let result = sqlx::query(
            "UPDATE executions SET
                status = ?, active = ?, current_phase = ?, version = version + 1, pause_requested = ?,
                cancel_requested = ?, hold = ?, status_reason = ?, resume_at_ms = ?, paused_at_ms = ?,
                completed_at_ms = ?
             WHERE id = ? AND version = ?",
        )
        .bind(execution.status.as_str())
        .bind(!execution.status.is_terminal())
        .bind(execution.current_phase as i64)
        .bind(execution.pause_requested)
        .bind(execution.cancel_requested)
        .bind(execution.hold.map(HoldReason::as_str))
        .bind(&execution.status_reason)
        .bind(opt_ms(execution.resume_at))
        .bind(opt_ms(execution.paused_at))
        .bind(opt_ms(execution.completed_at))
        .bind(&execution.id)
        .bind(execution.version)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() != 1 {
            return Err(OrchestrationError::ConcurrentModification {
                execution_id: execution.id.clone(),
            });
        }
        execution.version += 1;
        Ok(())
    }

    /// Sets a control flag without a version check. Returns `false` when the
    /// execution is already terminal.
    pub async fn request_control(&mut self, execution_id: &str, pause: bool, cancel: bool) -> OrchestrationResult<bool> {
        let result = sqlx::query(
            "UPDATE executions SET
                pause_requested = MAX(pause_requested, ?), cancel_requested = MAX(cancel_requested, ?),
                version = version + 1
             WHERE id = ? AND active = 1",
        )
        .bind(pause)
        .bind(cancel)
        .bind(execution_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn update_phase(&mut self, phase: &Phase) -> OrchestrationResult<()> {
        sqlx::query(
            "UPDATE phases SET status = ?, failure_fraction = ?, started_at_ms = ?, completed_at_ms = ?
             WHERE execution_id = ? AND idx = ?",
        )
        .bind(phase.status.as_str())
        .bind(phase.failure_fraction)
        .bind(opt_ms(phase.started_at))
        .bind(opt_ms(phase.completed_at))
        .bind(&phase.execution_id)
        .bind(phase.index as i64)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Inserts or replaces one resource outcome. When `assign_seq` is set and
    /// the outcome has no completion sequence yet, it takes the next value in
    /// the execution's completion order.
    pub async fn upsert_outcome(&mut self, outcome: &mut ResourceOutcome, assign_seq: bool) -> OrchestrationResult<()> {
        if assign_seq && outcome.completion_seq.is_none() {
            let next: i64 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(completion_seq), 0) + 1 FROM resource_outcomes WHERE execution_id = ?",
            )
            .bind(&outcome.execution_id)
            .fetch_one(&mut *self.tx)
            .await?;
            outcome.completion_seq = Some(next);
        }
        sqlx::query(
            "INSERT INTO resource_outcomes
                (execution_id, phase_index, resource_id, state, detail, completion_seq, updated_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (execution_id, phase_index, resource_id) DO UPDATE SET
                state = excluded.state,
                detail = excluded.detail,
                completion_seq = COALESCE(resource_outcomes.completion_seq, excluded.completion_seq),
                updated_at_ms = excluded.updated_at_ms",
        )
        .bind(&outcome.execution_id)
        .bind(outcome.phase_index as i64)
        .bind(&outcome.resource_id)
        .bind(outcome.state.as_str())
        .bind(&outcome.detail)
        .bind(outcome.completion_seq)
        .bind(dt_to_ms(outcome.updated_at))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn task_from_row(row: &SqliteRow) -> OrchestrationResult<Task> {
    let status: String = row.try_get("status")?;
    let risk: Option<String> = row.try_get("risk_class")?;
    let revision: i64 = row.try_get("revision")?;
    Ok(Task {
        id: row.try_get("id")?,
        intent: row.try_get("intent")?,
        context: json_column(row, "context_json")?,
        status: TaskStatus::parse(&status).ok_or_else(|| corrupt("task status", &status))?,
        risk_class: risk
            .map(|raw| RiskClass::parse(&raw).ok_or_else(|| corrupt("risk class", &raw)))
            .transpose()?,
        submitter: row.try_get("submitter")?,
        agent: row.try_get("agent")?,
        revision: u32::try_from(revision).unwrap_or_default(),
        idempotency_key: row.try_get("idempotency_key")?,
        status_reason: row.try_get("status_reason")?,
        approval_deadline: opt_dt(row.try_get("approval_deadline_ms")?),
        created_at: ms_to_dt(row.try_get("created_at_ms")?),
        approved_at: opt_dt(row.try_get("approved_at_ms")?),
        completed_at: opt_dt(row.try_get("completed_at_ms")?),
    })
}

fn plan_from_row(row: &SqliteRow) -> OrchestrationResult<Plan> {
    let risk: String = row.try_get("risk_class")?;
    let autonomy: String = row.try_get("autonomy")?;
    let risk_score: i64 = row.try_get("risk_score")?;
    let phases: Vec<PhaseSpec> = json_column(row, "phases_json")?;
    let quality: QualityScore = json_column(row, "quality_json")?;
    Ok(Plan {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        agent: row.try_get("agent")?,
        phases,
        affected_resources: json_column(row, "affected_json")?,
        risk_class: RiskClass::parse(&risk).ok_or_else(|| corrupt("risk class", &risk))?,
        risk_score: u32::try_from(risk_score).unwrap_or_default(),
        quality,
        rationale: row.try_get("rationale")?,
        autonomy: parse_autonomy(&autonomy).ok_or_else(|| corrupt("autonomy", &autonomy))?,
        digest: row.try_get("digest")?,
        active: row.try_get("active")?,
        validated: row.try_get("validated")?,
        created_at: ms_to_dt(row.try_get("created_at_ms")?),
    })
}

fn parse_autonomy(value: &str) -> Option<AutonomyMode> {
    match value {
        "supervised" => Some(AutonomyMode::Supervised),
        "canary_only" => Some(AutonomyMode::CanaryOnly),
        "full_auto" => Some(AutonomyMode::FullAuto),
        _ => None,
    }
}

fn approval_from_row(row: &SqliteRow) -> OrchestrationResult<ApprovalRecord> {
    let decision: String = row.try_get("decision")?;
    let scope: String = row.try_get("scope")?;
    let sequence: i64 = row.try_get("sequence")?;
    Ok(ApprovalRecord {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        plan_id: row.try_get("plan_id")?,
        approver_id: row.try_get("approver_id")?,
        decision: ApprovalDecision::parse(&decision).ok_or_else(|| corrupt("decision", &decision))?,
        scope: ApprovalScope::parse(&scope).ok_or_else(|| corrupt("approval scope", &scope))?,
        notes: row.try_get("notes")?,
        sequence: u32::try_from(sequence).unwrap_or_default(),
        created_at: ms_to_dt(row.try_get("created_at_ms")?),
    })
}

fn invocation_from_row(row: &SqliteRow) -> OrchestrationResult<ToolInvocation> {
    let risk: String = row.try_get("risk_class")?;
    let outcome: String = row.try_get("outcome")?;
    let duration_ms: i64 = row.try_get("duration_ms")?;
    Ok(ToolInvocation {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        execution_id: row.try_get("execution_id")?,
        tool: row.try_get("tool")?,
        risk_class: RiskClass::parse(&risk).ok_or_else(|| corrupt("risk class", &risk))?,
        input: json_column(row, "input_json")?,
        output: json_column(row, "output_json")?,
        duration_ms: u64::try_from(duration_ms).unwrap_or_default(),
        outcome: match outcome.as_str() {
            "success" => InvocationOutcome::Success,
            "error" => InvocationOutcome::Error,
            other => return Err(corrupt("invocation outcome", other)),
        },
        created_at: ms_to_dt(row.try_get("created_at_ms")?),
    })
}

fn execution_from_row(row: &SqliteRow) -> OrchestrationResult<Execution> {
    let status: String = row.try_get("status")?;
    let hold: Option<String> = row.try_get("hold")?;
    Ok(Execution {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        plan_id: row.try_get("plan_id")?,
        status: ExecutionStatus::parse(&status).ok_or_else(|| corrupt("execution status", &status))?,
        current_phase: index_column(row, "current_phase")?,
        phase_count: index_column(row, "phase_count")?,
        version: row.try_get("version")?,
        pause_requested: row.try_get("pause_requested")?,
        cancel_requested: row.try_get("cancel_requested")?,
        hold: hold
            .map(|raw| HoldReason::parse(&raw).ok_or_else(|| corrupt("hold reason", &raw)))
            .transpose()?,
        status_reason: row.try_get("status_reason")?,
        deadline: ms_to_dt(row.try_get("deadline_ms")?),
        resume_at: opt_dt(row.try_get("resume_at_ms")?),
        paused_at: opt_dt(row.try_get("paused_at_ms")?),
        started_at: ms_to_dt(row.try_get("started_at_ms")?),
        completed_at: opt_dt(row.try_get("completed_at_ms")?),
    })
}

fn phase_from_row(row: &SqliteRow) -> OrchestrationResult<Phase> {
    let status: String = row.try_get("status")?;
    Ok(Phase {
        execution_id: row.try_get("execution_id")?,
        index: index_column(row, "idx")?,
        spec: json_column(row, "spec_json")?,
        status: PhaseStatus::parse(&status).ok_or_else(|| corrupt("phase status", &status))?,
        failure_fraction: row.try_get("failure_fraction")?,
        started_at: opt_dt(row.try_get("started_at_ms")?),
        completed_at: opt_dt(row.try_get("completed_at_ms")?),
    })
}

fn outcome_from_row(row: &SqliteRow) -> OrchestrationResult<ResourceOutcome> {
    let state: String = row.try_get("state")?;
    Ok(ResourceOutcome {
        execution_id: row.try_get("execution_id")?,
        phase_index: index_column(row, "phase_index")?,
        resource_id: row.try_get("resource_id")?,
        state: ResourceState::parse(&state).ok_or_else(|| corrupt("resource state", &state))?,
        detail: row.try_get("detail")?,
        completion_seq: row.try_get("completion_seq")?,
        updated_at: ms_to_dt(row.try_get("updated_at_ms")?),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn task(id: &str, key: Option<&str>) -> Task {
        Task {
            id: id.to_string(),
            intent: "report drift".to_string(),
            context: BTreeMap::new(),
            status: TaskStatus::Draft,
            risk_class: None,
            submitter: "alice".to_string(),
            agent: None,
            revision: 0,
            idempotency_key: key.map(str::to_string),
            status_reason: None,
            approval_deadline: None,
            created_at: Utc::now(),
            approved_at: None,
            completed_at: None,
        }
    }

    async fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let url = format!("sqlite://{}", dir.path().join("state.db").display());
        let store = Store::open(&url).await.expect("store should open");
        (dir, store)
    }

    #[test]
    fn sqlite_paths_strip_scheme_and_params() {
        assert_eq!(
            sqlite_path_from_url("sqlite://.changegate/state.db?mode=rwc"),
            Some(PathBuf::from(".changegate/state.db"))
        );
        assert_eq!(sqlite_path_from_url("sqlite::memory:"), None);
        assert_eq!(sqlite_path_from_url("postgres://x"), None);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let (_dir, store) = temp_store().await;
        assert_eq!(store.schema_version().await.expect("version"), SCHEMA_VERSION);
        assert_eq!(store.migrate().await.expect("re-migrate"), SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn task_updates_compare_and_swap_on_status() {
        let (_dir, store) = temp_store().await;
        let mut draft = task("task-1", Some("key-1"));
        let mut tx = store.begin().await.expect("begin");
        tx.insert_task(&draft).await.expect("insert");
        tx.commit().await.expect("commit");

        draft.status = TaskStatus::PendingApproval;
        let mut tx = store.begin().await.expect("begin");
        tx.update_task(&draft, TaskStatus::Draft, Utc::now()).await.expect("first move");
        tx.commit().await.expect("commit");

        let mut tx = store.begin().await.expect("begin");
        let err = tx
            .update_task(&draft, TaskStatus::Draft, Utc::now())
            .await
            .expect_err("stale expectation should fail");
        assert!(matches!(
            err,
            OrchestrationError::InvalidTransition { ref state, .. } if state == "pending_approval"
        ));
        drop(tx);

        let found = store
            .find_task_by_idempotency_key("key-1")
            .await
            .expect("lookup")
            .expect("task should exist");
        assert_eq!(found.status, TaskStatus::PendingApproval);
    }

    #[tokio::test]
    async fn duplicate_idempotency_keys_are_rejected_by_the_schema() {
        let (_dir, store) = temp_store().await;
        let mut tx = store.begin().await.expect("begin");
        tx.insert_task(&task("task-1", Some("same"))).await.expect("insert");
        let err = tx
            .insert_task(&task("task-2", Some("same")))
            .await
            .expect_err("second insert should fail");
        assert!(matches!(err, OrchestrationError::InvalidInput(_)));
    }
}
