//! Execution Engine.
//!
//! An execution is driven by repeatedly loading its durable state and taking
//! exactly one step: a phase transition, a batch of resource operations, a
//! health pass or a rollback. Every step is committed before the next one
//! starts, so a crash resumes from the last recorded step and resources that
//! already have an outcome are never re-applied.
//!
//! The engine never sleeps. Bake waits and promotion gates return control to
//! the caller with the durable timer set; the sweeper wakes the execution
//! later.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::task::JoinSet;

use crate::agents::PlanRequest;
use crate::agents::planners::evaluation_input;
use crate::approval::{self, ApprovalPolicy};
use crate::capabilities::CapabilityRegistry;
use crate::clock::{Clock, seconds};
use crate::connector::{ApplyOutcome, Connector, Health, HealthProbe};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::itsm::{self, ChangeRecords};
use crate::ledger::{AuditEvent, EventKind, SYSTEM_ACTOR, trace_link};
use crate::model::{
    Environment, Execution, ExecutionStatus, HoldReason, InvocationOutcome, Phase, PhaseStatus,
    ResourceOutcome, ResourceState, Task, TaskStatus, ToolInvocation, failure_fraction, new_id,
};
use crate::notify::{self, Notification, NotificationKind, Notifier};
use crate::store::Store;

pub const DEFAULT_FAN_OUT_LIMIT: usize = 4;
pub const DEFAULT_AUTO_ROLLBACK_THRESHOLD: f64 = 0.05;
pub const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 4 * 3600;

const MAX_STEPS: usize = 10_000;
const MAX_CONFLICT_RETRIES: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    pub fan_out_limit: usize,
    pub auto_rollback_threshold: f64,
    pub execution_timeout_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            fan_out_limit: DEFAULT_FAN_OUT_LIMIT,
            auto_rollback_threshold: DEFAULT_AUTO_ROLLBACK_THRESHOLD,
            execution_timeout_secs: DEFAULT_EXECUTION_TIMEOUT_SECS,
        }
    }
}

/// Whether `failures` out of `targets` meets the rollback threshold. A
/// fraction exactly at the threshold counts.
pub fn meets_rollback_threshold(failures: usize, targets: usize, threshold: f64) -> bool {
    if targets == 0 || failures == 0 {
        return false;
    }
    failures as f64 + 1e-9 >= threshold * targets as f64
}

/// Where an `advance` call left the execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Advance {
    Finished {
        status: ExecutionStatus,
        reason: String,
    },
    /// Bake wait before `phase` starts.
    Waiting { phase: usize, until: DateTime<Utc> },
    /// Held by an operator pause before `phase`.
    Paused { phase: usize },
    /// Held until an eligible principal approves promotion into `phase`.
    AwaitingPromotion { phase: usize },
}

enum Step {
    Continue,
    Stop(Advance),
}

/// Terminal status reached by unwinding every applied phase.
#[derive(Debug, Clone, Copy)]
enum Unwind {
    Cancelled,
    Expired,
}

pub struct Executor {
    pub store: Store,
    pub clock: Arc<dyn Clock>,
    pub capabilities: Arc<CapabilityRegistry>,
    pub connector: Arc<dyn Connector>,
    pub probe: Arc<dyn HealthProbe>,
    pub notifier: Arc<dyn Notifier>,
    pub change_records: Arc<dyn ChangeRecords>,
    pub approvals: ApprovalPolicy,
    pub settings: ExecutorSettings,
}

impl Executor {
    /// Creates the execution for an approved task and moves the task to
    /// Executing, in one transaction.
    pub async fn start(&self, task: &Task, plan_id: &str, actor: &str) -> OrchestrationResult<Execution> {
        let plan = self.store.get_plan(plan_id).await?;
        let now = self.clock.now();
        let execution = Execution {
            id: new_id("exec"),
            task_id: task.id.clone(),
            plan_id: plan.id.clone(),
            status: ExecutionStatus::Created,
            current_phase: 0,
            phase_count: plan.phases.len(),
            version: 0,
            pause_requested: false,
            cancel_requested: false,
            hold: None,
            status_reason: None,
            deadline: now + seconds(self.settings.execution_timeout_secs),
            resume_at: None,
            paused_at: None,
            started_at: now,
            completed_at: None,
        };
        let phases = plan
            .phases
            .iter()
            .enumerate()
            .map(|(index, spec)| Phase {
                execution_id: execution.id.clone(),
                index,
                spec: spec.clone(),
                status: PhaseStatus::Pending,
                failure_fraction: None,
                started_at: None,
                completed_at: None,
            })
            .collect::<Vec<Phase>>();

        let mut next = task.clone();
        next.status = TaskStatus::Executing;
        let mut tx = self.store.begin().await?;
        tx.insert_execution(&execution, &phases).await?;
        tx.update_task(&next, TaskStatus::Approved, now).await?;
        tx.append(
            &AuditEvent::new(&task.id, EventKind::ExecutionCreated, actor, "execution", now)
                .execution(&execution.id)
                .transition(None, ExecutionStatus::Created.as_str())
                .payload(json!({
                    "plan_id": plan.id,
                    "phases": plan.phases.iter().map(|p| json!({"name": p.name, "targets": p.targets.len()})).collect::<Vec<_>>(),
                    "deadline": execution.deadline,
                })),
        )
        .await?;
        tx.append(
            &AuditEvent::new(&task.id, EventKind::TaskTransition, actor, "task", now)
                .execution(&execution.id)
                .transition(Some(TaskStatus::Approved.as_str()), TaskStatus::Executing.as_str())
                .reason("execution started"),
        )
        .await?;
        tx.commit().await?;
        tracing::info!(
            task_id = %task.id,
            execution_id = %execution.id,
            phases = execution.phase_count,
            "execution created"
        );
        Ok(execution)
    }

    /// Drives the execution until it finishes or has to wait on time or on a
    /// human.
    pub async fn advance(&self, execution_id: &str) -> OrchestrationResult<Advance> {
        let mut conflicts = 0usize;
        for _ in 0..MAX_STEPS {
            let execution = self.store.get_execution(execution_id).await?;
            match self.step(execution).await {
                Ok(Step::Continue) => conflicts = 0,
                Ok(Step::Stop(advance)) => return Ok(advance),
                Err(OrchestrationError::ConcurrentModification { .. })
                    if conflicts < MAX_CONFLICT_RETRIES =>
                {
                    conflicts += 1;
                    tracing::debug!(execution_id = execution_id, conflicts, "execution changed underneath; reloading");
                }
                Err(err) => return Err(err),
            }
        }
        Err(OrchestrationError::Collaborator(format!(
            "execution '{execution_id}' did not settle within {MAX_STEPS} steps"
        )))
    }

    async fn step(&self, mut execution: Execution) -> OrchestrationResult<Step> {
        if execution.status.is_terminal() {
            return Ok(Step::Stop(Advance::Finished {
                status: execution.status,
                reason: execution.status_reason.clone().unwrap_or_default(),
            }));
        }
        let now = self.clock.now();
        let phases = self.store.phases(&execution.id).await?;

        if now >= execution.deadline {
            return self.unwind(execution, phases, Unwind::Expired).await;
        }

        if execution.status == ExecutionStatus::Created {
            execution.status = ExecutionStatus::Running;
            let event = self.execution_event(&execution, Some(ExecutionStatus::Created), "execution started", now);
            self.commit(&mut execution, None, vec![event]).await?;
            return Ok(Step::Continue);
        }

        let index = execution.current_phase;
        if index >= phases.len() {
            let reason = format!("all {} phase(s) passed", phases.len());
            return self.finish(execution, ExecutionStatus::Completed, reason).await;
        }
        let mut phase = phases[index].clone();

        let at_boundary = phase.status == PhaseStatus::Pending;
        if execution.cancel_requested && at_boundary {
            return self.unwind(execution, phases, Unwind::Cancelled).await;
        }
        if execution.status == ExecutionStatus::Paused {
            return Ok(Step::Stop(match execution.hold {
                Some(HoldReason::PromotionApproval) => Advance::AwaitingPromotion { phase: index },
                _ => Advance::Paused { phase: index },
            }));
        }

        match phase.status {
            PhaseStatus::Pending => {
                if execution.pause_requested {
                    execution.status = ExecutionStatus::Paused;
                    execution.hold = Some(HoldReason::Operator);
                    execution.pause_requested = false;
                    execution.paused_at = Some(now);
                    let event = self.execution_event(
                        &execution,
                        Some(ExecutionStatus::Running),
                        &format!("paused before phase '{}'", phase.spec.name),
                        now,
                    );
                    self.commit(&mut execution, None, vec![event]).await?;
                    tracing::info!(execution_id = %execution.id, phase = index, "execution paused at phase boundary");
                    return Ok(Step::Stop(Advance::Paused { phase: index }));
                }
                if let Some(until) = execution.resume_at
                    && until > now
                {
                    return Ok(Step::Stop(Advance::Waiting { phase: index, until }));
                }
                if self.promotion_blocked(&execution, index).await? {
                    execution.status = ExecutionStatus::Paused;
                    execution.hold = Some(HoldReason::PromotionApproval);
                    execution.paused_at = Some(now);
                    let reason = format!("promotion into phase '{}' needs approval", phase.spec.name);
                    let event = self.execution_event(&execution, Some(ExecutionStatus::Running), &reason, now);
                    self.commit(&mut execution, None, vec![event]).await?;
                    self.notify(&execution, NotificationKind::PromotionRequested, reason);
                    return Ok(Step::Stop(Advance::AwaitingPromotion { phase: index }));
                }
                phase.status = PhaseStatus::InProgress;
                phase.started_at = Some(now);
                execution.resume_at = None;
                let event = self.phase_event(&execution, &phase, PhaseStatus::Pending, None, now);
                self.commit(&mut execution, Some(&phase), vec![event]).await?;
                Ok(Step::Continue)
            }
            PhaseStatus::InProgress => {
                self.run_phase(&execution, &phase).await?;
                phase.status = PhaseStatus::HealthCheck;
                let event = self.phase_event(&execution, &phase, PhaseStatus::InProgress, None, self.clock.now());
                self.commit(&mut execution, Some(&phase), vec![event]).await?;
                Ok(Step::Continue)
            }
            PhaseStatus::HealthCheck => {
                let (failures, fraction) = self.check_health(&execution, &phase).await?;
                let now = self.clock.now();
                phase.failure_fraction = Some(fraction);
                let targets = phase.spec.targets.len();
                if meets_rollback_threshold(failures, targets, self.settings.auto_rollback_threshold) {
                    phase.status = PhaseStatus::Failed;
                    let failure = OrchestrationError::PhaseHealthCheckFailed {
                        phase: phase.spec.name.clone(),
                        failure_fraction: fraction,
                    };
                    tracing::warn!(
                        execution_id = %execution.id,
                        phase = index,
                        failures,
                        targets,
                        "{failure}"
                    );
                    let event = self.phase_event(&execution, &phase, PhaseStatus::HealthCheck, Some(failure.to_string()), now);
                    self.commit(&mut execution, Some(&phase), vec![event]).await?;
                    self.notify(&execution, NotificationKind::PhaseFailed, failure.to_string());
                    return Ok(Step::Continue);
                }
                phase.status = PhaseStatus::Passed;
                phase.completed_at = Some(now);
                execution.current_phase = index + 1;
                execution.resume_at = (index + 1 < phases.len() && phase.spec.wait_secs > 0)
                    .then(|| now + seconds(phase.spec.wait_secs));
                let event = self.phase_event(
                    &execution,
                    &phase,
                    PhaseStatus::HealthCheck,
                    Some(format!("failure fraction {fraction:.3}")),
                    now,
                );
                self.commit(&mut execution, Some(&phase), vec![event]).await?;
                Ok(Step::Continue)
            }
            PhaseStatus::Failed => {
                phase.status = PhaseStatus::RollbackInProgress;
                let event = self.phase_event(&execution, &phase, PhaseStatus::Failed, None, now);
                self.commit(&mut execution, Some(&phase), vec![event]).await?;
                Ok(Step::Continue)
            }
            PhaseStatus::RollbackInProgress => {
                self.rollback_phase(&execution, &phase).await?;
                phase.status = PhaseStatus::RolledBack;
                phase.completed_at = Some(self.clock.now());
                let event = self.phase_event(&execution, &phase, PhaseStatus::RollbackInProgress, None, self.clock.now());
                self.commit(&mut execution, Some(&phase), vec![event]).await?;
                Ok(Step::Continue)
            }
            PhaseStatus::RolledBack => {
                let manual = self.manual_resources(&execution.id).await?;
                let mut reason = format!(
                    "phase '{}' failed health gating (failure fraction {:.3} >= threshold {:.3}) and was rolled back",
                    phase.spec.name,
                    phase.failure_fraction.unwrap_or_default(),
                    self.settings.auto_rollback_threshold
                );
                append_manual(&mut reason, &manual);
                self.finish(execution, ExecutionStatus::FailedWithRollback, reason).await
            }
            PhaseStatus::Passed => {
                // A passed phase is always committed together with the index bump.
                execution.current_phase = index + 1;
                self.commit(&mut execution, None, Vec::new()).await?;
                Ok(Step::Continue)
            }
        }
    }

    async fn promotion_blocked(&self, execution: &Execution, index: usize) -> OrchestrationResult<bool> {
        let plan = self.store.get_plan(&execution.plan_id).await?;
        if !plan.risk_class.is_state_change()
            || !plan
                .autonomy
                .requires_promotion_approval(index, execution.phase_count)
        {
            return Ok(false);
        }
        let task = self.store.get_task(&execution.task_id).await?;
        let records = self.store.approvals_for_task(&task.id).await?;
        Ok(!approval::phase_released(&records, &plan.id, index, &task, &self.approvals))
    }

    // -- resource operations -------------------------------------------------

    /// Applies the phase operation to every target without a recorded
    /// outcome. Each result is committed as it arrives.
    async fn run_phase(&self, execution: &Execution, phase: &Phase) -> OrchestrationResult<()> {
        let recorded = self.store.outcomes(&execution.id, phase.index).await?;
        let done = recorded
            .iter()
            .map(|outcome| outcome.resource_id.as_str())
            .collect::<BTreeSet<&str>>();
        let remaining = phase
            .spec
            .targets
            .iter()
            .filter(|target| !done.contains(target.as_str()))
            .cloned()
            .collect::<Vec<String>>();
        let targets = phase.spec.targets.len();
        let mut failures = recorded
            .iter()
            .filter(|outcome| outcome.state.counts_as_failure())
            .count();
        let threshold = self.settings.auto_rollback_threshold;

        if !phase.spec.risk_class.is_state_change() {
            let task = self.store.get_task(&execution.task_id).await?;
            for resource in remaining {
                let started = Instant::now();
                let input = self.evaluation_input(&task, phase, &resource);
                let result = self.capabilities.evaluate(&phase.spec.operation, &input);
                let (state, detail, output, outcome) = match result {
                    Ok(output) => (ResourceState::Applied, None, output, InvocationOutcome::Success),
                    Err(err) => {
                        let message = err.to_string();
                        (ResourceState::Failed, Some(message.clone()), json!({ "error": message }), InvocationOutcome::Error)
                    }
                };
                let invocation = self.invocation(execution, &phase.spec.operation, phase, input, output, started, outcome);
                self.record_outcome(execution, phase, &resource, state, detail, Some(invocation)).await?;
            }
            return Ok(());
        }

        let fan_out = self.settings.fan_out_limit.max(1);
        let mut pending = remaining.into_iter();
        let mut in_flight: JoinSet<(String, ApplyOutcome, Instant)> = JoinSet::new();
        let mut aborted = meets_rollback_threshold(failures, targets, threshold);
        loop {
            while !aborted && in_flight.len() < fan_out {
                let Some(resource) = pending.next() else {
                    break;
                };
                let connector = Arc::clone(&self.connector);
                let operation = phase.spec.operation.clone();
                let params = phase.spec.params.clone();
                tracing::debug!(execution_id = %execution.id, phase = phase.index, resource = %resource, "dispatching resource operation");
                in_flight.spawn(async move {
                    let started = Instant::now();
                    let outcome = connector.apply(&resource, &operation, &params).await;
                    (resource, outcome, started)
                });
            }
            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let (resource, outcome, started) = joined.map_err(|err| {
                OrchestrationError::Collaborator(format!("resource operation task failed: {err}"))
            })?;
            let (state, detail) = match &outcome {
                ApplyOutcome::Succeeded { detail } => (ResourceState::Applied, detail.clone()),
                ApplyOutcome::Failed { reason } => (ResourceState::Failed, Some(reason.clone())),
            };
            if state.counts_as_failure() {
                failures += 1;
            }
            let invocation = self.invocation(
                execution,
                &phase.spec.operation,
                phase,
                json!({ "resource": resource, "params": phase.spec.params }),
                serde_json::to_value(&outcome)?,
                started,
                if outcome.is_success() { InvocationOutcome::Success } else { InvocationOutcome::Error },
            );
            self.record_outcome(execution, phase, &resource, state, detail, Some(invocation)).await?;
            if !aborted && meets_rollback_threshold(failures, targets, threshold) {
                aborted = true;
                tracing::warn!(
                    execution_id = %execution.id,
                    phase = phase.index,
                    failures,
                    targets,
                    "rollback threshold reached; no further resources will be dispatched"
                );
            }
        }
        for resource in pending {
            self.record_outcome(
                execution,
                phase,
                &resource,
                ResourceState::Skipped,
                Some("not attempted: phase aborted after reaching the rollback threshold".to_string()),
                None,
            )
            .await?;
        }
        Ok(())
    }

    /// Probes every applied resource of a state-changing phase and returns
    /// the failure count and fraction over the full target set.
    async fn check_health(&self, execution: &Execution, phase: &Phase) -> OrchestrationResult<(usize, f64)> {
        let mut outcomes = self.store.outcomes(&execution.id, phase.index).await?;
        if phase.spec.risk_class.is_state_change() {
            for outcome in outcomes.iter_mut() {
                if outcome.state != ResourceState::Applied {
                    continue;
                }
                if let Health::Unhealthy { reason } = self.probe.check(&outcome.resource_id).await {
                    tracing::warn!(
                        execution_id = %execution.id,
                        phase = phase.index,
                        resource = %outcome.resource_id,
                        reason = %reason,
                        "resource failed health check"
                    );
                    outcome.state = ResourceState::Unhealthy;
                    outcome.detail = Some(reason);
                    outcome.updated_at = self.clock.now();
                    self.persist_outcome(execution, outcome, EventKind::ResourceOutcome, None).await?;
                }
            }
        }
        let targets = phase.spec.targets.len();
        let failures = outcomes
            .iter()
            .filter(|outcome| outcome.state.counts_as_failure())
            .count();
        Ok((failures, failure_fraction(&outcomes, targets)))
    }

    /// Reverts the phase's changed resources in reverse completion order,
    /// probing health after each revert. A resource whose revert fails is
    /// flagged for manual intervention and the rollback carries on.
    async fn rollback_phase(&self, execution: &Execution, phase: &Phase) -> OrchestrationResult<()> {
        let Some(rollback) = phase.spec.rollback_operation.as_deref() else {
            return Ok(());
        };
        let mut owed = self
            .store
            .outcomes(&execution.id, phase.index)
            .await?
            .into_iter()
            .filter(|outcome| outcome.state.needs_revert())
            .collect::<Vec<ResourceOutcome>>();
        owed.sort_by_key(|outcome| std::cmp::Reverse(outcome.completion_seq));

        let mut manual = Vec::new();
        for mut outcome in owed {
            let started = Instant::now();
            let applied = self
                .connector
                .apply(&outcome.resource_id, rollback, &phase.spec.params)
                .await;
            let (state, detail) = match &applied {
                ApplyOutcome::Failed { reason } => (
                    ResourceState::ManualInterventionRequired,
                    Some(format!("revert failed: {reason}")),
                ),
                ApplyOutcome::Succeeded { .. } => match self.probe.check(&outcome.resource_id).await {
                    Health::Healthy => (ResourceState::RolledBack, None),
                    Health::Unhealthy { reason } => (
                        ResourceState::ManualInterventionRequired,
                        Some(format!("unhealthy after revert: {reason}")),
                    ),
                },
            };
            let invocation = self.invocation(
                execution,
                rollback,
                phase,
                json!({ "resource": outcome.resource_id, "params": phase.spec.params }),
                serde_json::to_value(&applied)?,
                started,
                if applied.is_success() { InvocationOutcome::Success } else { InvocationOutcome::Error },
            );
            if state == ResourceState::ManualInterventionRequired {
                manual.push(outcome.resource_id.clone());
            }
            tracing::info!(
                execution_id = %execution.id,
                phase = phase.index,
                resource = %outcome.resource_id,
                state = state.as_str(),
                "resource rollback step"
            );
            outcome.state = state;
            outcome.detail = detail;
            outcome.updated_at = self.clock.now();
            self.persist_outcome(execution, &mut outcome, EventKind::ResourceRollback, Some(invocation))
                .await?;
        }
        if !manual.is_empty() {
            let failure = OrchestrationError::RollbackPartialFailure { resources: manual };
            tracing::error!(execution_id = %execution.id, phase = phase.index, "{failure}");
            self.notify(execution, NotificationKind::ManualInterventionRequired, failure.to_string());
        }
        Ok(())
    }

    async fn manual_resources(&self, execution_id: &str) -> OrchestrationResult<Vec<String>> {
        Ok(self
            .store
            .all_outcomes(execution_id)
            .await?
            .into_iter()
            .filter(|outcome| outcome.state == ResourceState::ManualInterventionRequired)
            .map(|outcome| outcome.resource_id)
            .collect())
    }

    /// Rolls back every phase that changed anything, latest phase first, then
    /// ends the execution as cancelled or expired.
    async fn unwind(&self, mut execution: Execution, phases: Vec<Phase>, why: Unwind) -> OrchestrationResult<Step> {
        let mut reverted = 0usize;
        for mut phase in phases.into_iter().rev() {
            if matches!(phase.status, PhaseStatus::Pending | PhaseStatus::RolledBack) {
                continue;
            }
            let now = self.clock.now();
            if phase.status != PhaseStatus::RollbackInProgress {
                let from = phase.status;
                phase.status = PhaseStatus::RollbackInProgress;
                let event = self.phase_event(&execution, &phase, from, Some(unwind_label(why).to_string()), now);
                self.commit(&mut execution, Some(&phase), vec![event]).await?;
            }
            self.rollback_phase(&execution, &phase).await?;
            phase.status = PhaseStatus::RolledBack;
            phase.completed_at = Some(self.clock.now());
            let event = self.phase_event(&execution, &phase, PhaseStatus::RollbackInProgress, None, self.clock.now());
            self.commit(&mut execution, Some(&phase), vec![event]).await?;
            reverted += 1;
        }
        let manual = self.manual_resources(&execution.id).await?;
        let (status, mut reason) = match why {
            Unwind::Cancelled => (
                ExecutionStatus::Cancelled,
                format!("cancelled at phase boundary; rolled back {reverted} phase(s)"),
            ),
            Unwind::Expired => (
                ExecutionStatus::Expired,
                format!(
                    "{}; rolled back {reverted} phase(s)",
                    OrchestrationError::ExecutionTimeout {
                        execution_id: execution.id.clone()
                    }
                ),
            ),
        };
        append_manual(&mut reason, &manual);
        self.finish(execution, status, reason).await
    }

    /// Moves the execution and its task to a terminal status together.
    async fn finish(&self, mut execution: Execution, status: ExecutionStatus, reason: String) -> OrchestrationResult<Step> {
        let now = self.clock.now();
        let task = self.store.get_task(&execution.task_id).await?;
        let from = execution.status;
        execution.status = status;
        execution.status_reason = Some(reason.clone());
        execution.completed_at = Some(now);
        execution.hold = None;
        execution.resume_at = None;
        execution.pause_requested = false;

        let mut next = task.clone();
        next.status = status.task_status();
        next.status_reason = Some(format!("{reason} (trace: {})", trace_link(&task.id)));
        next.completed_at = Some(now);

        let mut tx = self.store.begin().await?;
        tx.update_execution(&mut execution).await?;
        tx.update_task(&next, TaskStatus::Executing, now).await?;
        tx.append(&self.execution_event(&execution, Some(from), &reason, now)).await?;
        tx.append(
            &AuditEvent::new(&task.id, EventKind::TaskTransition, SYSTEM_ACTOR, "task", now)
                .execution(&execution.id)
                .transition(Some(task.status.as_str()), next.status.as_str())
                .reason(reason.clone()),
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            task_id = %task.id,
            execution_id = %execution.id,
            status = status.as_str(),
            reason = %reason,
            "execution finished"
        );
        self.notify(&execution, NotificationKind::TaskTerminal, reason.clone());
        itsm::spawn_close(&self.change_records, task.id.clone(), next.status, reason.clone());
        Ok(Step::Stop(Advance::Finished { status, reason }))
    }

    // -- persistence helpers -------------------------------------------------

    async fn commit(&self, execution: &mut Execution, phase: Option<&Phase>, events: Vec<AuditEvent>) -> OrchestrationResult<()> {
        let mut tx = self.store.begin().await?;
        tx.update_execution(execution).await?;
        if let Some(phase) = phase {
            tx.update_phase(phase).await?;
        }
        for event in &events {
            tx.append(event).await?;
        }
        tx.commit().await
    }

    async fn record_outcome(
        &self,
        execution: &Execution,
        phase: &Phase,
        resource: &str,
        state: ResourceState,
        detail: Option<String>,
        invocation: Option<ToolInvocation>,
    ) -> OrchestrationResult<()> {
        let mut outcome = ResourceOutcome {
            execution_id: execution.id.clone(),
            phase_index: phase.index,
            resource_id: resource.to_string(),
            state,
            detail,
            completion_seq: None,
            updated_at: self.clock.now(),
        };
        tracing::info!(
            task_id = %execution.task_id,
            execution_id = %execution.id,
            phase = phase.index,
            resource = resource,
            state = state.as_str(),
            "resource outcome recorded"
        );
        self.persist_outcome(execution, &mut outcome, EventKind::ResourceOutcome, invocation)
            .await
    }

    async fn persist_outcome(
        &self,
        execution: &Execution,
        outcome: &mut ResourceOutcome,
        kind: EventKind,
        invocation: Option<ToolInvocation>,
    ) -> OrchestrationResult<()> {
        let assign_seq = matches!(outcome.state, ResourceState::Applied | ResourceState::Failed);
        let mut tx = self.store.begin().await?;
        tx.upsert_outcome(outcome, assign_seq).await?;
        if let Some(invocation) = &invocation {
            tx.insert_invocation(invocation).await?;
            tx.append(
                &AuditEvent::new(&execution.task_id, EventKind::ToolInvoked, SYSTEM_ACTOR, invocation.tool.as_str(), invocation.created_at)
                    .execution(&execution.id)
                    .payload(json!({
                        "invocation_id": invocation.id,
                        "resource": outcome.resource_id,
                        "outcome": invocation.outcome,
                        "duration_ms": invocation.duration_ms,
                    })),
            )
            .await?;
        }
        let mut event = AuditEvent::new(
            &execution.task_id,
            kind,
            SYSTEM_ACTOR,
            format!("resource:{}", outcome.resource_id),
            outcome.updated_at,
        )
        .execution(&execution.id)
        .transition(None, outcome.state.as_str())
        .payload(json!({ "phase": outcome.phase_index, "completion_seq": outcome.completion_seq }));
        if let Some(detail) = &outcome.detail {
            event = event.reason(detail.clone());
        }
        tx.append(&event).await?;
        tx.commit().await
    }

    #[allow(clippy::too_many_arguments)]
    fn invocation(
        &self,
        execution: &Execution,
        tool: &str,
        phase: &Phase,
        input: Value,
        output: Value,
        started: Instant,
        outcome: InvocationOutcome,
    ) -> ToolInvocation {
        let risk_class = self
            .capabilities
            .get(tool)
            .map(|capability| capability.risk_class)
            .unwrap_or(phase.spec.risk_class);
        ToolInvocation {
            id: new_id("inv"),
            task_id: execution.task_id.clone(),
            execution_id: Some(execution.id.clone()),
            tool: tool.to_string(),
            risk_class,
            input,
            output,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            outcome,
            created_at: self.clock.now(),
        }
    }

    fn evaluation_input(&self, task: &Task, phase: &Phase, resource: &str) -> Value {
        let environment = phase
            .spec
            .params
            .get("environment")
            .and_then(Value::as_str)
            .and_then(Environment::parse)
            .unwrap_or(Environment::Prod);
        let request = PlanRequest {
            task_id: &task.id,
            intent: &task.intent,
            context: &task.context,
            environment,
            resources: vec![resource.to_string()],
        };
        let mut input = evaluation_input(&request);
        if let (Some(object), Some(params)) = (input.as_object_mut(), phase.spec.params.as_object()) {
            for (key, value) in params {
                object.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        input
    }

    fn execution_event(&self, execution: &Execution, from: Option<ExecutionStatus>, reason: &str, at: DateTime<Utc>) -> AuditEvent {
        AuditEvent::new(&execution.task_id, EventKind::ExecutionTransition, SYSTEM_ACTOR, "execution", at)
            .execution(&execution.id)
            .transition(from.map(ExecutionStatus::as_str), execution.status.as_str())
            .reason(reason)
            .payload(json!({
                "current_phase": execution.current_phase,
                "hold": execution.hold,
            }))
    }

    fn phase_event(&self, execution: &Execution, phase: &Phase, from: PhaseStatus, reason: Option<String>, at: DateTime<Utc>) -> AuditEvent {
        tracing::info!(
            task_id = %execution.task_id,
            execution_id = %execution.id,
            phase = phase.index,
            name = %phase.spec.name,
            from = from.as_str(),
            to = phase.status.as_str(),
            "phase transition"
        );
        let mut event = AuditEvent::new(
            &execution.task_id,
            EventKind::PhaseTransition,
            SYSTEM_ACTOR,
            format!("phase:{}", phase.index),
            at,
        )
        .execution(&execution.id)
        .transition(Some(from.as_str()), phase.status.as_str())
        .payload(json!({
            "name": phase.spec.name,
            "targets": phase.spec.targets.len(),
            "failure_fraction": phase.failure_fraction,
        }));
        if let Some(reason) = reason {
            event = event.reason(reason);
        }
        event
    }

    fn notify(&self, execution: &Execution, kind: NotificationKind, summary: String) {
        notify::dispatch(
            &self.notifier,
            Notification {
                kind,
                task_id: execution.task_id.clone(),
                execution_id: Some(execution.id.clone()),
                status: execution.status.as_str().to_string(),
                summary,
                trace: trace_link(&execution.task_id),
                at: self.clock.now(),
            },
        );
    }
}

fn unwind_label(why: Unwind) -> &'static str {
    match why {
        Unwind::Cancelled => "cancellation requested",
        Unwind::Expired => "global timeout reached",
    }
}

fn append_manual(reason: &mut String, manual: &[String]) {
    if !manual.is_empty() {
        reason.push_str(&format!(
            "; manual intervention required for {}",
            manual.join(", ")
        ));
    }
}

/// Per-phase outcome summary for status views.
pub fn outcome_counts(outcomes: &[ResourceOutcome]) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for outcome in outcomes {
        *counts.entry(outcome.state.as_str()).or_insert(0) += 1;
    }
    counts
}
