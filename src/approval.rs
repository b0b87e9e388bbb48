//! Risk & Approval Gate.
//!
//! A task's approval status is never stored as a counter: it is recomputed
//! by folding the plan's ApprovalRecords under the configured policy, so two
//! approvals arriving in either order land on the same verdict.
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{OrchestrationError, OrchestrationResult};
use crate::model::{ApprovalDecision, ApprovalRecord, ApprovalScope, Plan, RiskClass, Task, TaskStatus};
use crate::tool_policy::any_pattern_matches;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalPolicy {
    pub plan_only_min_quality: u32,
    pub prod_min_quality: u32,
    /// Wildcard patterns of principals holding the approval permission.
    pub approvers: Vec<String>,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            plan_only_min_quality: 60,
            prod_min_quality: 80,
            approvers: vec!["*".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    /// Draft goes straight to Approved.
    Automatic,
    /// Distinct eligible approvals needed.
    Approvals(usize),
}

impl ApprovalPolicy {
    pub fn requirement(&self, plan: &Plan) -> Requirement {
        match plan.risk_class {
            RiskClass::ReadOnly => Requirement::Automatic,
            RiskClass::PlanOnly if plan.quality.total() >= self.plan_only_min_quality => {
                Requirement::Automatic
            }
            RiskClass::PlanOnly | RiskClass::StateChangeNonprod => Requirement::Approvals(1),
            RiskClass::StateChangeProd => Requirement::Approvals(2),
        }
    }

    /// Minimum total quality an Approve action must meet, if any.
    pub fn approve_quality_floor(&self, risk_class: RiskClass) -> Option<u32> {
        (risk_class == RiskClass::StateChangeProd).then_some(self.prod_min_quality)
    }

    pub fn is_approver(&self, principal: &str) -> bool {
        any_pattern_matches(&self.approvers, principal)
    }

    /// Whether `principal` may act on `task` at all.
    pub fn check_eligible(&self, principal: &str, task: &Task) -> OrchestrationResult<()> {
        let principal = principal.trim();
        if principal.is_empty() {
            return Err(OrchestrationError::InvalidInput(
                "approver id must not be empty".to_string(),
            ));
        }
        if principal == task.submitter {
            return Err(OrchestrationError::IneligibleApprover {
                principal: principal.to_string(),
                reason: "the submitter cannot approve their own task".to_string(),
            });
        }
        if !self.is_approver(principal) {
            return Err(OrchestrationError::IneligibleApprover {
                principal: principal.to_string(),
                reason: "principal does not hold the approval permission".to_string(),
            });
        }
        Ok(())
    }

    /// Blocks Approve on a production plan whose quality misses the floor,
    /// whoever the approver is.
    pub fn check_quality(&self, plan: &Plan) -> OrchestrationResult<()> {
        let Some(required) = self.approve_quality_floor(plan.risk_class) else {
            return Ok(());
        };
        let score = plan.quality.total();
        if score >= required {
            return Ok(());
        }
        Err(OrchestrationError::QualityBelowThreshold {
            score,
            required,
            deficient: plan.quality.deficient_dimensions(required),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Rejected { by: String, notes: Option<String> },
    /// A reviewer asked for changes: the task goes back to Draft.
    ModificationRequested { by: String, notes: Option<String> },
    Pending { approvals: usize, required: usize },
}

/// Folds plan-scoped records for `plan` into a verdict.
///
/// Any rejection wins over approvals regardless of arrival order. Repeat
/// approvals by one principal count once. Records from the submitter or from
/// principals without the approval permission never count.
pub fn fold(records: &[ApprovalRecord], plan: &Plan, task: &Task, policy: &ApprovalPolicy) -> Verdict {
    let mut ordered = records
        .iter()
        .filter(|record| record.plan_id == plan.id && record.scope == ApprovalScope::Plan)
        .filter(|record| policy.check_eligible(&record.approver_id, task).is_ok())
        .collect::<Vec<&ApprovalRecord>>();
    ordered.sort_by_key(|record| record.sequence);

    if let Some(reject) = ordered
        .iter()
        .find(|record| record.decision == ApprovalDecision::Reject)
    {
        return Verdict::Rejected {
            by: reject.approver_id.clone(),
            notes: reject.notes.clone(),
        };
    }
    if let Some(modify) = ordered
        .iter()
        .find(|record| record.decision == ApprovalDecision::Modify)
    {
        return Verdict::ModificationRequested {
            by: modify.approver_id.clone(),
            notes: modify.notes.clone(),
        };
    }

    let approvers = ordered
        .iter()
        .filter(|record| record.decision == ApprovalDecision::Approve)
        .map(|record| record.approver_id.as_str())
        .collect::<BTreeSet<&str>>();
    let required = match policy.requirement(plan) {
        Requirement::Automatic => return Verdict::Approved,
        Requirement::Approvals(required) => required,
    };
    if approvers.len() >= required && policy.check_quality(plan).is_ok() {
        Verdict::Approved
    } else {
        Verdict::Pending {
            approvals: approvers.len(),
            required,
        }
    }
}

/// Whether a promotion into `phase` was approved by an eligible principal.
pub fn phase_released(records: &[ApprovalRecord], plan_id: &str, phase: usize, task: &Task, policy: &ApprovalPolicy) -> bool {
    records.iter().any(|record| {
        record.plan_id == plan_id
            && record.scope == ApprovalScope::Phase(phase)
            && record.decision == ApprovalDecision::Approve
            && policy.check_eligible(&record.approver_id, task).is_ok()
    })
}

/// Numeric risk in 0..=100: a base per class, widened by blast radius and by
/// state-changing phases without a declared revert.
pub fn risk_score(plan_risk: RiskClass, affected: usize, unpaired_changes: usize) -> u32 {
    let base = match plan_risk {
        RiskClass::ReadOnly => 5,
        RiskClass::PlanOnly => 20,
        RiskClass::StateChangeNonprod => 45,
        RiskClass::StateChangeProd => 70,
    };
    let radius = (affected as u32).div_ceil(5).min(20);
    let unpaired = (unpaired_changes as u32 * 10).min(20);
    (base + radius + unpaired).min(100)
}

/// Whether a pending task's approval window has closed.
pub fn approval_expired(task: &Task, now: DateTime<Utc>) -> bool {
    task.status == TaskStatus::PendingApproval
        && task.approval_deadline.is_some_and(|deadline| now >= deadline)
}
