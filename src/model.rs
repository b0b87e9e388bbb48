use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::quality::QualityScore;

pub type ContextMap = BTreeMap<String, Value>;

pub fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

// ---------------------------------------------------------------------------
// Risk classification
// ---------------------------------------------------------------------------

/// Risk classes are ordered: aggregation over a set of tools always takes the
/// maximum, so risk never decreases by combining capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    ReadOnly,
    PlanOnly,
    StateChangeNonprod,
    StateChangeProd,
}

impl RiskClass {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskClass::ReadOnly => "read_only",
            RiskClass::PlanOnly => "plan_only",
            RiskClass::StateChangeNonprod => "state_change_nonprod",
            RiskClass::StateChangeProd => "state_change_prod",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "read_only" => Some(RiskClass::ReadOnly),
            "plan_only" => Some(RiskClass::PlanOnly),
            "state_change_nonprod" => Some(RiskClass::StateChangeNonprod),
            "state_change_prod" => Some(RiskClass::StateChangeProd),
            _ => None,
        }
    }

    pub fn is_state_change(self) -> bool {
        matches!(
            self,
            RiskClass::StateChangeNonprod | RiskClass::StateChangeProd
        )
    }
}

impl fmt::Display for RiskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Highest risk class in the iterator, `ReadOnly` when empty.
pub fn aggregate_risk(classes: impl IntoIterator<Item = RiskClass>) -> RiskClass {
    classes.into_iter().max().unwrap_or(RiskClass::ReadOnly)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Prod,
    Nonprod,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Prod => "prod",
            Environment::Nonprod => "nonprod",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" | "prd" | "live" => Some(Environment::Prod),
            "nonprod" | "non-prod" | "staging" | "stage" | "dev" | "development" | "test"
            | "qa" | "sandbox" => Some(Environment::Nonprod),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyMode {
    Supervised,
    CanaryOnly,
    FullAuto,
}

impl AutonomyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AutonomyMode::Supervised => "supervised",
            AutonomyMode::CanaryOnly => "canary_only",
            AutonomyMode::FullAuto => "full_auto",
        }
    }

    /// Whether starting `phase_index` of a `phase_count`-phase rollout needs a
    /// fresh human promotion approval.
    pub fn requires_promotion_approval(self, phase_index: usize, phase_count: usize) -> bool {
        if phase_index == 0 || phase_index >= phase_count {
            return false;
        }
        match self {
            AutonomyMode::Supervised => true,
            AutonomyMode::CanaryOnly => phase_index + 1 == phase_count,
            AutonomyMode::FullAuto => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Draft,
    PendingApproval,
    Approved,
    Rejected,
    Expired,
    Executing,
    Completed,
    FailedWithRollback,
    Cancelled,
    Halted,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Draft => "draft",
            TaskStatus::PendingApproval => "pending_approval",
            TaskStatus::Approved => "approved",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Expired => "expired",
            TaskStatus::Executing => "executing",
            TaskStatus::Completed => "completed",
            TaskStatus::FailedWithRollback => "failed_with_rollback",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Halted => "halted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "draft" => TaskStatus::Draft,
            "pending_approval" => TaskStatus::PendingApproval,
            "approved" => TaskStatus::Approved,
            "rejected" => TaskStatus::Rejected,
            "expired" => TaskStatus::Expired,
            "executing" => TaskStatus::Executing,
            "completed" => TaskStatus::Completed,
            "failed_with_rollback" => TaskStatus::FailedWithRollback,
            "cancelled" => TaskStatus::Cancelled,
            "halted" => TaskStatus::Halted,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Rejected
                | TaskStatus::Expired
                | TaskStatus::Completed
                | TaskStatus::FailedWithRollback
                | TaskStatus::Cancelled
                | TaskStatus::Halted
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub intent: String,
    pub context: ContextMap,
    pub status: TaskStatus,
    pub risk_class: Option<RiskClass>,
    pub submitter: String,
    pub agent: Option<String>,
    pub revision: u32,
    pub idempotency_key: Option<String>,
    pub status_reason: Option<String>,
    pub approval_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// One authored phase of a plan. Immutable once the plan passes validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    pub targets: Vec<String>,
    pub target_percentage: u32,
    pub wait_secs: u64,
    pub operation: String,
    #[serde(default)]
    pub params: Value,
    pub rollback_operation: Option<String>,
    pub risk_class: RiskClass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub task_id: String,
    pub agent: String,
    pub phases: Vec<PhaseSpec>,
    pub affected_resources: Vec<String>,
    pub risk_class: RiskClass,
    pub risk_score: u32,
    pub quality: QualityScore,
    pub rationale: String,
    pub autonomy: AutonomyMode,
    pub digest: String,
    pub active: bool,
    pub validated: bool,
    pub created_at: DateTime<Utc>,
}

/// md5 digest over the plan content that matters for equivalence: agent,
/// phases, affected resources and rationale. Ids and timestamps are excluded
/// so identical resubmissions produce identical digests.
pub fn plan_digest(agent: &str, phases: &[PhaseSpec], affected: &[String], rationale: &str) -> String {
    let canonical = serde_json::json!({
        "agent": agent,
        "phases": phases,
        "affected_resources": affected,
        "rationale": rationale,
    });
    format!("{:x}", md5::compute(canonical.to_string().as_bytes()))
}

// ---------------------------------------------------------------------------
// Tool invocations and approvals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationOutcome {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub task_id: String,
    pub execution_id: Option<String>,
    pub tool: String,
    pub risk_class: RiskClass,
    pub input: Value,
    pub output: Value,
    pub duration_ms: u64,
    pub outcome: InvocationOutcome,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
    Modify,
}

impl ApprovalDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalDecision::Approve => "approve",
            ApprovalDecision::Reject => "reject",
            ApprovalDecision::Modify => "modify",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approve" => Some(ApprovalDecision::Approve),
            "reject" => Some(ApprovalDecision::Reject),
            "modify" => Some(ApprovalDecision::Modify),
            _ => None,
        }
    }
}

/// What an approval applies to: the whole plan, or the promotion into one
/// phase of a running execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "phase")]
pub enum ApprovalScope {
    Plan,
    Phase(usize),
}

impl ApprovalScope {
    pub fn key(self) -> String {
        match self {
            ApprovalScope::Plan => "plan".to_string(),
            ApprovalScope::Phase(index) => format!("phase:{index}"),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        if value == "plan" {
            return Some(ApprovalScope::Plan);
        }
        value
            .strip_prefix("phase:")
            .and_then(|raw| raw.parse::<usize>().ok())
            .map(ApprovalScope::Phase)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: String,
    pub task_id: String,
    pub plan_id: String,
    pub approver_id: String,
    pub decision: ApprovalDecision,
    pub scope: ApprovalScope,
    pub notes: Option<String>,
    pub sequence: u32,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Execution and phases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Created,
    Running,
    Paused,
    Completed,
    Cancelled,
    FailedWithRollback,
    Expired,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Created => "created",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::FailedWithRollback => "failed_with_rollback",
            ExecutionStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "created" => ExecutionStatus::Created,
            "running" => ExecutionStatus::Running,
            "paused" => ExecutionStatus::Paused,
            "completed" => ExecutionStatus::Completed,
            "cancelled" => ExecutionStatus::Cancelled,
            "failed_with_rollback" => ExecutionStatus::FailedWithRollback,
            "expired" => ExecutionStatus::Expired,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::FailedWithRollback
                | ExecutionStatus::Expired
        )
    }

    /// The task status mirrored once the execution reaches this status.
    pub fn task_status(self) -> TaskStatus {
        match self {
            ExecutionStatus::Completed => TaskStatus::Completed,
            ExecutionStatus::Cancelled => TaskStatus::Cancelled,
            ExecutionStatus::FailedWithRollback => TaskStatus::FailedWithRollback,
            ExecutionStatus::Expired => TaskStatus::Expired,
            ExecutionStatus::Created | ExecutionStatus::Running | ExecutionStatus::Paused => {
                TaskStatus::Executing
            }
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    Operator,
    PromotionApproval,
}

impl HoldReason {
    pub fn as_str(self) -> &'static str {
        match self {
            HoldReason::Operator => "operator",
            HoldReason::PromotionApproval => "promotion_approval",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "operator" => Some(HoldReason::Operator),
            "promotion_approval" => Some(HoldReason::PromotionApproval),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub task_id: String,
    pub plan_id: String,
    pub status: ExecutionStatus,
    pub current_phase: usize,
    pub phase_count: usize,
    pub version: i64,
    pub pause_requested: bool,
    pub cancel_requested: bool,
    pub hold: Option<HoldReason>,
    pub status_reason: Option<String>,
    pub deadline: DateTime<Utc>,
    pub resume_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    HealthCheck,
    Passed,
    Failed,
    RollbackInProgress,
    RolledBack,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::HealthCheck => "health_check",
            PhaseStatus::Passed => "passed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::RollbackInProgress => "rollback_in_progress",
            PhaseStatus::RolledBack => "rolled_back",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "pending" => PhaseStatus::Pending,
            "in_progress" => PhaseStatus::InProgress,
            "health_check" => PhaseStatus::HealthCheck,
            "passed" => PhaseStatus::Passed,
            "failed" => PhaseStatus::Failed,
            "rollback_in_progress" => PhaseStatus::RollbackInProgress,
            "rolled_back" => PhaseStatus::RolledBack,
            _ => return None,
        })
    }

    /// Terminal for ordering purposes: the next phase may start.
    pub fn is_terminal(self) -> bool {
        matches!(self, PhaseStatus::Passed | PhaseStatus::RolledBack)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub execution_id: String,
    pub index: usize,
    pub spec: PhaseSpec,
    pub status: PhaseStatus,
    pub failure_fraction: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Applied,
    Failed,
    Unhealthy,
    Skipped,
    RolledBack,
    ManualInterventionRequired,
}

impl ResourceState {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceState::Applied => "applied",
            ResourceState::Failed => "failed",
            ResourceState::Unhealthy => "unhealthy",
            ResourceState::Skipped => "skipped",
            ResourceState::RolledBack => "rolled_back",
            ResourceState::ManualInterventionRequired => "manual_intervention_required",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "applied" => ResourceState::Applied,
            "failed" => ResourceState::Failed,
            "unhealthy" => ResourceState::Unhealthy,
            "skipped" => ResourceState::Skipped,
            "rolled_back" => ResourceState::RolledBack,
            "manual_intervention_required" => ResourceState::ManualInterventionRequired,
            _ => return None,
        })
    }

    pub fn counts_as_failure(self) -> bool {
        matches!(self, ResourceState::Failed | ResourceState::Unhealthy)
    }

    /// The operation changed the resource and a revert is owed on rollback.
    pub fn needs_revert(self) -> bool {
        matches!(self, ResourceState::Applied | ResourceState::Unhealthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceOutcome {
    pub execution_id: String,
    pub phase_index: usize,
    pub resource_id: String,
    pub state: ResourceState,
    pub detail: Option<String>,
    /// Monotonic per-execution completion order, used to revert in reverse.
    pub completion_seq: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

/// Failure fraction of a phase over its full target set.
pub fn failure_fraction(outcomes: &[ResourceOutcome], target_count: usize) -> f64 {
    if target_count == 0 {
        return 0.0;
    }
    let failures = outcomes
        .iter()
        .filter(|outcome| outcome.state.counts_as_failure())
        .count();
    failures as f64 / target_count as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_aggregation_takes_the_highest_class() {
        let risk = aggregate_risk([
            RiskClass::ReadOnly,
            RiskClass::StateChangeProd,
            RiskClass::PlanOnly,
        ]);
        assert_eq!(risk, RiskClass::StateChangeProd);
        assert_eq!(aggregate_risk([]), RiskClass::ReadOnly);
    }

    #[test]
    fn canary_only_gates_only_the_final_phase() {
        let mode = AutonomyMode::CanaryOnly;
        assert!(!mode.requires_promotion_approval(0, 3));
        assert!(!mode.requires_promotion_approval(1, 3));
        assert!(mode.requires_promotion_approval(2, 3));
        assert!(AutonomyMode::Supervised.requires_promotion_approval(1, 3));
        assert!(!AutonomyMode::FullAuto.requires_promotion_approval(2, 3));
    }

    #[test]
    fn approval_scope_keys_round_trip() {
        assert_eq!(ApprovalScope::parse("plan"), Some(ApprovalScope::Plan));
        assert_eq!(
            ApprovalScope::parse(&ApprovalScope::Phase(2).key()),
            Some(ApprovalScope::Phase(2))
        );
        assert_eq!(ApprovalScope::parse("phase:x"), None);
    }

    #[test]
    fn plan_digest_ignores_identity() {
        let phases = vec![PhaseSpec {
            name: "canary".to_string(),
            targets: vec!["web-1".to_string()],
            target_percentage: 10,
            wait_secs: 0,
            operation: "patch.apply_prod".to_string(),
            params: Value::Null,
            rollback_operation: Some("patch.rollback".to_string()),
            risk_class: RiskClass::StateChangeProd,
        }];
        let affected = vec!["web-1".to_string()];
        let first = plan_digest("patch", &phases, &affected, "why");
        let second = plan_digest("patch", &phases, &affected, "why");
        assert_eq!(first, second);
        assert_ne!(first, plan_digest("patch", &phases, &affected, "other"));
    }
}
