//! Inbound façade: every operation the presentation layer can call.
//!
//! Mutating calls for one task run under that task's in-process lock, so two
//! approvals racing on the same task are applied one after the other. The
//! store remains the only owner of state: the lock orders writers inside
//! this process and the compare-and-set writes catch everything else.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::agents::{AgentOverrides, AgentRegistry, PlanDraft, PlanRequest, Toolbox, compose};
use crate::approval::{self, ApprovalPolicy, Requirement, Verdict};
use crate::capabilities::CapabilityRegistry;
use crate::clock::{Clock, SystemClock, seconds};
use crate::connector::{Connector, HealthProbe, SimulatedConnector};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::executor::{Advance, Executor, ExecutorSettings, outcome_counts};
use crate::guardrail::IntentGuardrail;
use crate::itsm::{self, ChangeRecords, ChangeRequest, NoopChangeRecords};
use crate::ledger::{AuditEvent, EventKind, SYSTEM_ACTOR, trace_link};
use crate::model::{
    ApprovalDecision, ApprovalRecord, ApprovalScope, ContextMap, Environment, Execution,
    ExecutionStatus, HoldReason, Phase, Plan, ResourceOutcome, Task, TaskStatus, ToolInvocation,
    new_id, plan_digest,
};
use crate::notify::{self, NoopNotifier, Notification, NotificationKind, Notifier};
use crate::quality::{HeuristicReviewer, PlanReviewer};
use crate::resolver::{IntentOracle, IntentResolver, KeywordOracle, TaskSpecification};
use crate::store::Store;
use crate::validation::{PolicyEvaluator, RulePolicyEvaluator, ValidationPipeline, Violation};

pub const DEFAULT_APPROVAL_TIMEOUT_SECS: u64 = 24 * 3600;

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub approval_timeout_secs: u64,
    /// Resuming an execution paused longer than this re-runs policy
    /// evaluation first. `None` disables the check.
    pub revalidate_after_pause_secs: Option<u64>,
    /// Environment facts handed to the policy evaluator.
    pub facts: ContextMap,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            approval_timeout_secs: DEFAULT_APPROVAL_TIMEOUT_SECS,
            revalidate_after_pause_secs: None,
            facts: ContextMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitRequest {
    pub intent: String,
    #[serde(default)]
    pub context: ContextMap,
    pub submitter: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub task: Task,
    pub plan: Option<Plan>,
    /// Non-empty when the plan failed validation and the task stayed in Draft.
    pub violations: Vec<Violation>,
    pub execution: Option<Execution>,
    pub advance: Option<Advance>,
    /// The idempotency key matched an earlier submission.
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionOutcome {
    pub task: Task,
    /// False when the call repeated an action that was already recorded.
    pub recorded: bool,
    pub verdict: Verdict,
    pub execution: Option<Execution>,
    pub advance: Option<Advance>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseView {
    #[serde(flatten)]
    pub phase: Phase,
    pub counts: BTreeMap<&'static str, usize>,
    pub outcomes: Vec<ResourceOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionView {
    pub execution: Execution,
    pub phases: Vec<PhaseView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advance: Option<Advance>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub task: Task,
    pub plan: Option<Plan>,
    pub approvals: Vec<ApprovalRecord>,
    pub verdict: Option<Verdict>,
    pub executions: Vec<Execution>,
    pub trace: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweptExecution {
    pub task_id: String,
    pub execution_id: String,
    pub advance: Advance,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub expired: Vec<String>,
    pub advanced: Vec<SweptExecution>,
    pub skipped_busy: usize,
    pub errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// Per-task locks
// ---------------------------------------------------------------------------

const LOCK_TABLE_PRUNE_AT: usize = 1024;

#[derive(Default)]
struct TaskLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TaskLocks {
    fn handle(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if map.len() >= LOCK_TABLE_PRUNE_AT {
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Arc::clone(map.entry(key.to_string()).or_default())
    }

    async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        self.handle(key).lock_owned().await
    }

    fn try_acquire(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        self.handle(key).try_lock_owned().ok()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct OrchestratorBuilder {
    store: Store,
    clock: Arc<dyn Clock>,
    capabilities: Arc<CapabilityRegistry>,
    overrides: AgentOverrides,
    oracle: Arc<dyn IntentOracle>,
    reviewer: Arc<dyn PlanReviewer>,
    policy: Arc<dyn PolicyEvaluator>,
    guardrail: IntentGuardrail,
    approvals: ApprovalPolicy,
    connector: Arc<dyn Connector>,
    probe: Arc<dyn HealthProbe>,
    notifier: Arc<dyn Notifier>,
    change_records: Arc<dyn ChangeRecords>,
    executor_settings: ExecutorSettings,
    settings: OrchestratorSettings,
}

impl OrchestratorBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn capabilities(mut self, capabilities: CapabilityRegistry) -> Self {
        self.capabilities = Arc::new(capabilities);
        self
    }

    pub fn agent_overrides(mut self, overrides: AgentOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn oracle(mut self, oracle: Arc<dyn IntentOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn reviewer(mut self, reviewer: Arc<dyn PlanReviewer>) -> Self {
        self.reviewer = reviewer;
        self
    }

    pub fn policy(mut self, policy: Arc<dyn PolicyEvaluator>) -> Self {
        self.policy = policy;
        self
    }

    pub fn guardrail(mut self, guardrail: IntentGuardrail) -> Self {
        self.guardrail = guardrail;
        self
    }

    pub fn approvals(mut self, approvals: ApprovalPolicy) -> Self {
        self.approvals = approvals;
        self
    }

    /// Uses one value as both the connector and the health probe.
    pub fn connector<C>(mut self, connector: Arc<C>) -> Self
    where
        C: Connector + HealthProbe + 'static,
    {
        self.probe = connector.clone();
        self.connector = connector;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn change_records(mut self, change_records: Arc<dyn ChangeRecords>) -> Self {
        self.change_records = change_records;
        self
    }

    pub fn executor_settings(mut self, settings: ExecutorSettings) -> Self {
        self.executor_settings = settings;
        self
    }

    pub fn settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Orchestrator {
        let agents = Arc::new(AgentRegistry::new(&self.capabilities, &self.overrides));
        let executor = Executor {
            store: self.store.clone(),
            clock: Arc::clone(&self.clock),
            capabilities: Arc::clone(&self.capabilities),
            connector: self.connector,
            probe: self.probe,
            notifier: Arc::clone(&self.notifier),
            change_records: Arc::clone(&self.change_records),
            approvals: self.approvals.clone(),
            settings: self.executor_settings,
        };
        Orchestrator {
            store: self.store,
            clock: self.clock,
            capabilities: self.capabilities,
            agents,
            oracle: self.oracle,
            reviewer: self.reviewer,
            policy: self.policy,
            guardrail: self.guardrail,
            approvals: self.approvals,
            notifier: self.notifier,
            change_records: self.change_records,
            executor,
            settings: self.settings,
            locks: TaskLocks::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    store: Store,
    clock: Arc<dyn Clock>,
    capabilities: Arc<CapabilityRegistry>,
    agents: Arc<AgentRegistry>,
    oracle: Arc<dyn IntentOracle>,
    reviewer: Arc<dyn PlanReviewer>,
    policy: Arc<dyn PolicyEvaluator>,
    guardrail: IntentGuardrail,
    approvals: ApprovalPolicy,
    notifier: Arc<dyn Notifier>,
    change_records: Arc<dyn ChangeRecords>,
    executor: Executor,
    settings: OrchestratorSettings,
    locks: TaskLocks,
}

impl Orchestrator {
    /// Defaults: system clock, builtin capabilities, keyword oracle,
    /// heuristic reviewer, no policy rules, simulated connector, no-op
    /// notification and change-record collaborators.
    pub fn builder(store: Store) -> OrchestratorBuilder {
        let simulated = Arc::new(SimulatedConnector::default());
        OrchestratorBuilder {
            store,
            clock: Arc::new(SystemClock),
            capabilities: Arc::new(CapabilityRegistry::builtin()),
            overrides: AgentOverrides::default(),
            oracle: Arc::new(KeywordOracle),
            reviewer: Arc::new(HeuristicReviewer),
            policy: Arc::new(RulePolicyEvaluator::default()),
            guardrail: IntentGuardrail::default(),
            approvals: ApprovalPolicy::default(),
            probe: simulated.clone(),
            connector: simulated,
            notifier: Arc::new(NoopNotifier),
            change_records: Arc::new(NoopChangeRecords),
            executor_settings: ExecutorSettings::default(),
            settings: OrchestratorSettings::default(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    fn resolver(&self) -> IntentResolver<'_> {
        IntentResolver {
            oracle: self.oracle.as_ref(),
            agents: &self.agents,
            capabilities: &self.capabilities,
        }
    }

    // -- submission ----------------------------------------------------------

    /// Screens and resolves the intent, persists a Draft task, drafts and
    /// validates its plan, then applies the approval gate. Auto-approved
    /// plans start executing before this returns.
    pub async fn submit(&self, request: SubmitRequest) -> OrchestrationResult<Submission> {
        let submitter = request.submitter.trim().to_string();
        if submitter.is_empty() {
            return Err(OrchestrationError::InvalidInput(
                "submitter must not be empty".to_string(),
            ));
        }
        let idempotency_key = request
            .idempotency_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
        let _key_guard = match &idempotency_key {
            Some(key) => Some(self.locks.acquire(&format!("idempotency:{key}")).await),
            None => None,
        };
        if let Some(key) = &idempotency_key
            && let Some(existing) = self.store.find_task_by_idempotency_key(key).await?
        {
            tracing::info!(task_id = %existing.id, idempotency_key = %key, "submission replayed");
            return self.replay(existing).await;
        }

        let screened = self.guardrail.screen(&request.intent)?;
        let spec = self.resolver().resolve(&screened.text, &request.context).await?;

        let now = self.clock.now();
        let task = Task {
            id: new_id("task"),
            intent: screened.text.clone(),
            context: request.context,
            status: TaskStatus::Draft,
            risk_class: Some(spec.risk_class),
            submitter: submitter.clone(),
            agent: Some(spec.agent_label()),
            revision: 1,
            idempotency_key,
            status_reason: None,
            approval_deadline: None,
            created_at: now,
            approved_at: None,
            completed_at: None,
        };
        let _guard = self.locks.acquire(&task.id).await;

        let mut tx = self.store.begin().await?;
        tx.insert_task(&task).await?;
        tx.append(
            &AuditEvent::new(&task.id, EventKind::TaskSubmitted, &submitter, "task", now)
                .transition(None, TaskStatus::Draft.as_str())
                .payload(json!({
                    "intent": task.intent,
                    "context": task.context,
                    "idempotency_key": task.idempotency_key,
                })),
        )
        .await?;
        if !screened.hits.is_empty() {
            tx.append(
                &AuditEvent::new(&task.id, EventKind::IntentScreened, SYSTEM_ACTOR, "intent", now)
                    .reason(format!("guardrail {} matched sensitive terms", screened.mode.as_str()))
                    .payload(json!({ "mode": screened.mode, "hits": screened.hits })),
            )
            .await?;
        }
        tx.append(
            &AuditEvent::new(&task.id, EventKind::IntentResolved, SYSTEM_ACTOR, "intent", now)
                .reason(format!("resolved to {}", spec.agent_label()))
                .payload(serde_json::to_value(&spec)?),
        )
        .await?;
        tx.commit().await?;
        tracing::info!(
            task_id = %task.id,
            submitter = %submitter,
            agent = %spec.agent_label(),
            risk_class = spec.risk_class.as_str(),
            "task submitted"
        );

        self.install_plan(task, &spec, &submitter).await
    }

    /// Re-plans a Draft task with `context_patch` merged into its context.
    /// A `null` value removes the key.
    pub async fn revise(&self, task_id: &str, actor: &str, context_patch: ContextMap) -> OrchestrationResult<Submission> {
        let _guard = self.locks.acquire(task_id).await;
        let mut task = self.store.get_task(task_id).await?;
        if task.status != TaskStatus::Draft {
            return Err(OrchestrationError::InvalidTransition {
                subject: format!("task '{task_id}'"),
                state: task.status.to_string(),
                action: "revise".to_string(),
            });
        }
        for (key, value) in context_patch {
            if value.is_null() {
                task.context.remove(&key);
            } else {
                task.context.insert(key, value);
            }
        }
        let spec = self.resolver().resolve(&task.intent, &task.context).await?;
        task.revision += 1;
        task.status_reason = None;
        tracing::info!(task_id = %task.id, revision = task.revision, actor = actor, "task revised");
        self.install_plan(task, &spec, actor).await
    }

    async fn replay(&self, task: Task) -> OrchestrationResult<Submission> {
        let plan = self.store.active_plan(&task.id).await?;
        let execution = self.store.executions_for_task(&task.id).await?.pop();
        Ok(Submission {
            task,
            plan,
            violations: Vec::new(),
            execution,
            advance: None,
            replayed: true,
        })
    }

    /// Drafts, scores and validates a plan for a Draft task, installs it as
    /// the task's only active plan and applies the approval gate.
    async fn install_plan(&self, mut task: Task, spec: &TaskSpecification, actor: &str) -> OrchestrationResult<Submission> {
        let (mut plan, invocations) = match self.draft_plan(&task, spec).await {
            Ok(drafted) => drafted,
            Err(err) if err.is_fatal() => {
                self.halt(&task, &err, actor).await?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        let facts = self.facts_for(Some(spec.environment));
        let validation = ValidationPipeline {
            capabilities: &self.capabilities,
            policy: self.policy.as_ref(),
        }
        .validate(&plan, &facts)
        .await?;
        plan.validated = validation.passed;

        let now = self.clock.now();
        task.risk_class = Some(plan.risk_class);
        task.agent = Some(plan.agent.clone());
        task.approval_deadline = None;
        let requirement = self.approvals.requirement(&plan);
        let mut transition_reason = None;
        if !validation.passed {
            task.status_reason = validation.clone().into_error().map(|err| err.to_string());
        } else {
            match requirement {
                Requirement::Automatic => {
                    task.status = TaskStatus::Approved;
                    task.approved_at = Some(now);
                    let reason = format!(
                        "auto-approved: {} plan (quality {})",
                        plan.risk_class,
                        plan.quality.total()
                    );
                    task.status_reason = Some(reason.clone());
                    transition_reason = Some(reason);
                }
                Requirement::Approvals(required) => {
                    task.status = TaskStatus::PendingApproval;
                    task.approval_deadline = Some(now + seconds(self.settings.approval_timeout_secs));
                    let reason = format!("awaiting {required} approval(s) for a {} plan", plan.risk_class);
                    task.status_reason = Some(reason.clone());
                    transition_reason = Some(reason);
                }
            }
        }

        let mut tx = self.store.begin().await?;
        tx.deactivate_plans(&task.id).await?;
        tx.insert_plan(&plan).await?;
        for invocation in &invocations {
            tx.insert_invocation(invocation).await?;
            tx.append(
                &AuditEvent::new(&task.id, EventKind::ToolInvoked, &plan.agent, invocation.tool.as_str(), invocation.created_at)
                    .payload(json!({
                        "invocation_id": invocation.id,
                        "risk_class": invocation.risk_class,
                        "outcome": invocation.outcome,
                        "duration_ms": invocation.duration_ms,
                    })),
            )
            .await?;
        }
        tx.append(
            &AuditEvent::new(&task.id, EventKind::PlanCreated, actor, "plan", now)
                .reason(plan.rationale.clone())
                .payload(json!({
                    "plan_id": plan.id,
                    "revision": task.revision,
                    "agent": plan.agent,
                    "risk_class": plan.risk_class,
                    "risk_score": plan.risk_score,
                    "quality": plan.quality,
                    "quality_total": plan.quality.total(),
                    "autonomy": plan.autonomy,
                    "digest": plan.digest,
                    "phases": plan.phases.iter().map(|p| json!({"name": p.name, "targets": p.targets.len(), "operation": p.operation})).collect::<Vec<_>>(),
                })),
        )
        .await?;
        let mut validated = AuditEvent::new(&task.id, EventKind::PlanValidated, SYSTEM_ACTOR, "plan", now)
            .payload(json!({ "plan_id": plan.id, "passed": validation.passed, "violations": validation.violations }));
        if let Some(reason) = &task.status_reason
            && !validation.passed
        {
            validated = validated.reason(reason.clone());
        }
        tx.append(&validated).await?;
        tx.update_task(&task, TaskStatus::Draft, now).await?;
        if let Some(reason) = &transition_reason {
            tx.append(
                &AuditEvent::new(&task.id, EventKind::TaskTransition, SYSTEM_ACTOR, "task", now)
                    .transition(Some(TaskStatus::Draft.as_str()), task.status.as_str())
                    .reason(reason.clone()),
            )
            .await?;
        }
        tx.commit().await?;

        let mut submission = Submission {
            task: task.clone(),
            plan: Some(plan.clone()),
            violations: validation.violations,
            execution: None,
            advance: None,
            replayed: false,
        };
        match task.status {
            TaskStatus::Draft => {
                tracing::warn!(
                    task_id = %task.id,
                    plan_id = %plan.id,
                    violations = submission.violations.len(),
                    "plan failed validation; task stays in draft"
                );
            }
            TaskStatus::PendingApproval => {
                tracing::info!(task_id = %task.id, plan_id = %plan.id, "task awaiting approval");
                self.notify_task(&task, NotificationKind::ApprovalRequested, transition_reason.unwrap_or_default());
            }
            TaskStatus::Approved => {
                let (execution, advance) = self.launch(&task, &plan, SYSTEM_ACTOR).await?;
                submission.execution = Some(execution);
                submission.advance = Some(advance);
                submission.task = self.store.get_task(&task.id).await?;
            }
            _ => {}
        }
        Ok(submission)
    }

    async fn draft_plan(&self, task: &Task, spec: &TaskSpecification) -> OrchestrationResult<(Plan, Vec<ToolInvocation>)> {
        let mut drafts = Vec::with_capacity(spec.agents.len());
        for kind in &spec.agents {
            let agent = self.agents.get(*kind);
            let mut toolbox = Toolbox::new(
                *kind,
                agent.authorized_tools(),
                &self.capabilities,
                self.clock.as_ref(),
                &task.id,
            );
            let request = PlanRequest {
                task_id: &task.id,
                intent: &task.intent,
                context: &task.context,
                environment: spec.environment,
                resources: spec.resources.clone(),
            };
            let mut draft = agent.plan(&request, &mut toolbox)?;
            draft.invocations.extend(toolbox.into_invocations());
            drafts.push(draft);
        }
        let draft: PlanDraft = if drafts.len() == 1 {
            drafts.remove(0)
        } else {
            compose(drafts)
        };

        let quality = self.reviewer.review(&draft).await?;
        let unpaired = draft
            .phases
            .iter()
            .filter(|phase| phase.risk_class.is_state_change() && phase.rollback_operation.is_none())
            .count();
        let risk_score = approval::risk_score(draft.risk_class, draft.affected_resources.len(), unpaired);
        let digest = plan_digest(&draft.agent, &draft.phases, &draft.affected_resources, &draft.rationale);
        let plan = Plan {
            id: new_id("plan"),
            task_id: task.id.clone(),
            agent: draft.agent,
            phases: draft.phases,
            affected_resources: draft.affected_resources,
            risk_class: draft.risk_class,
            risk_score,
            quality,
            rationale: draft.rationale,
            autonomy: draft.autonomy,
            digest,
            active: true,
            validated: false,
            created_at: self.clock.now(),
        };
        Ok((plan, draft.invocations))
    }

    /// Stops a task after a fatal planning error.
    async fn halt(&self, task: &Task, err: &OrchestrationError, actor: &str) -> OrchestrationResult<()> {
        tracing::error!(task_id = %task.id, code = err.code(), error = %err, "task halted");
        let now = self.clock.now();
        let mut next = task.clone();
        next.status = TaskStatus::Halted;
        next.completed_at = Some(now);
        next.status_reason = Some(format!("{err} (trace: {})", trace_link(&task.id)));
        let mut tx = self.store.begin().await?;
        tx.update_task(&next, task.status, now).await?;
        tx.append(
            &AuditEvent::new(&task.id, EventKind::TaskTransition, actor, "task", now)
                .transition(Some(task.status.as_str()), TaskStatus::Halted.as_str())
                .reason(err.to_string())
                .payload(json!({ "code": err.code() })),
        )
        .await?;
        tx.commit().await?;
        self.notify_task(&next, NotificationKind::TaskTerminal, err.to_string());
        Ok(())
    }

    // -- approvals -----------------------------------------------------------

    pub async fn approve(&self, task_id: &str, principal: &str, notes: Option<String>) -> OrchestrationResult<DecisionOutcome> {
        self.decide(task_id, principal, ApprovalDecision::Approve, notes).await
    }

    pub async fn reject(&self, task_id: &str, principal: &str, notes: Option<String>) -> OrchestrationResult<DecisionOutcome> {
        self.decide(task_id, principal, ApprovalDecision::Reject, notes).await
    }

    pub async fn request_modification(&self, task_id: &str, principal: &str, notes: Option<String>) -> OrchestrationResult<DecisionOutcome> {
        self.decide(task_id, principal, ApprovalDecision::Modify, notes).await
    }

    /// Records one decision and re-folds the verdict. Repeating an already
    /// recorded decision is a no-op.
    pub async fn decide(
        &self,
        task_id: &str,
        principal: &str,
        decision: ApprovalDecision,
        notes: Option<String>,
    ) -> OrchestrationResult<DecisionOutcome> {
        let principal = principal.trim().to_string();
        let _guard = self.locks.acquire(task_id).await;
        let task = self.store.get_task(task_id).await?;
        let plan = self.store.active_plan(task_id).await?;

        if task.status != TaskStatus::PendingApproval {
            return self.repeated_decision(task, plan, &principal, decision).await;
        }
        let plan = plan.ok_or_else(|| OrchestrationError::NotFound {
            kind: "active plan for task",
            id: task_id.to_string(),
        })?;

        let now = self.clock.now();
        if approval::approval_expired(&task, now) {
            self.expire(task).await?;
            return Err(OrchestrationError::ApprovalTimeout {
                task_id: task_id.to_string(),
            });
        }
        self.approvals.check_eligible(&principal, &task)?;
        if decision == ApprovalDecision::Approve
            && let Err(err) = self.approvals.check_quality(&plan)
        {
            tracing::warn!(task_id = task_id, principal = %principal, error = %err, "approval blocked by quality gate");
            return Err(err);
        }

        let mut record = ApprovalRecord {
            id: new_id("appr"),
            task_id: task.id.clone(),
            plan_id: plan.id.clone(),
            approver_id: principal.clone(),
            decision,
            scope: ApprovalScope::Plan,
            notes: notes.clone(),
            sequence: 0,
            created_at: now,
        };
        let mut tx = self.store.begin().await?;
        let recorded = tx.insert_approval(&mut record).await?;
        if recorded {
            let mut event = AuditEvent::new(&task.id, EventKind::ApprovalRecorded, &principal, "plan", now)
                .payload(json!({
                    "approval_id": record.id,
                    "plan_id": plan.id,
                    "decision": decision,
                    "sequence": record.sequence,
                }));
            if let Some(notes) = &notes {
                event = event.reason(notes.clone());
            }
            tx.append(&event).await?;
        }
        let records = tx.approvals_for_task(&task.id).await?;
        let verdict = approval::fold(&records, &plan, &task, &self.approvals);

        let mut next = task.clone();
        match &verdict {
            Verdict::Approved => {
                next.status = TaskStatus::Approved;
                next.approved_at = Some(now);
                next.approval_deadline = None;
                let approvers = records
                    .iter()
                    .filter(|r| r.plan_id == plan.id && r.scope == ApprovalScope::Plan && r.decision == ApprovalDecision::Approve)
                    .map(|r| r.approver_id.as_str())
                    .collect::<Vec<&str>>()
                    .join(", ");
                next.status_reason = Some(format!("approved by {approvers}"));
            }
            Verdict::Rejected { by, notes } => {
                next.status = TaskStatus::Rejected;
                next.completed_at = Some(now);
                next.approval_deadline = None;
                next.status_reason = Some(format!(
                    "rejected by {by}{} (trace: {})",
                    notes.as_deref().map(|n| format!(": {n}")).unwrap_or_default(),
                    trace_link(&task.id)
                ));
            }
            Verdict::ModificationRequested { by, notes } => {
                next.status = TaskStatus::Draft;
                next.approval_deadline = None;
                next.status_reason = Some(format!(
                    "modification requested by {by}{}",
                    notes.as_deref().map(|n| format!(": {n}")).unwrap_or_default()
                ));
            }
            Verdict::Pending { .. } => {}
        }
        if next.status != task.status {
            tx.update_task(&next, TaskStatus::PendingApproval, now).await?;
            let mut event = AuditEvent::new(&task.id, EventKind::TaskTransition, &principal, "task", now)
                .transition(Some(task.status.as_str()), next.status.as_str())
                .payload(serde_json::to_value(&verdict)?);
            if let Some(reason) = &next.status_reason {
                event = event.reason(reason.clone());
            }
            tx.append(&event).await?;
        }
        tx.commit().await?;
        tracing::info!(
            task_id = %task.id,
            principal = %principal,
            decision = decision.as_str(),
            recorded,
            status = next.status.as_str(),
            "approval decision processed"
        );

        let mut outcome = DecisionOutcome {
            task: next.clone(),
            recorded,
            verdict: verdict.clone(),
            execution: None,
            advance: None,
        };
        match next.status {
            TaskStatus::Approved => {
                if plan.risk_class.is_state_change() {
                    itsm::spawn_open(
                        &self.change_records,
                        ChangeRequest {
                            task_id: task.id.clone(),
                            summary: task.intent.clone(),
                            risk_class: plan.risk_class,
                            affected_resources: plan.affected_resources.clone(),
                            approvers: records
                                .iter()
                                .filter(|r| r.plan_id == plan.id && r.decision == ApprovalDecision::Approve)
                                .map(|r| r.approver_id.clone())
                                .collect(),
                        },
                    );
                }
                let (execution, advance) = self.launch(&next, &plan, &principal).await?;
                outcome.execution = Some(execution);
                outcome.advance = Some(advance);
                outcome.task = self.store.get_task(&task.id).await?;
            }
            TaskStatus::Rejected => {
                self.notify_task(&next, NotificationKind::TaskTerminal, next.status_reason.clone().unwrap_or_default());
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// A decision on a task that already left PendingApproval: a no-op if the
    /// same principal already recorded it, otherwise an invalid transition.
    async fn repeated_decision(
        &self,
        task: Task,
        plan: Option<Plan>,
        principal: &str,
        decision: ApprovalDecision,
    ) -> OrchestrationResult<DecisionOutcome> {
        if let Some(plan) = plan {
            let records = self.store.approvals_for_task(&task.id).await?;
            let repeated = records.iter().any(|record| {
                record.plan_id == plan.id
                    && record.scope == ApprovalScope::Plan
                    && record.approver_id == principal
                    && record.decision == decision
            });
            if repeated {
                let verdict = approval::fold(&records, &plan, &task, &self.approvals);
                let execution = self.store.executions_for_task(&task.id).await?.pop();
                return Ok(DecisionOutcome {
                    task,
                    recorded: false,
                    verdict,
                    execution,
                    advance: None,
                });
            }
        }
        Err(OrchestrationError::InvalidTransition {
            subject: format!("task '{}'", task.id),
            state: task.status.to_string(),
            action: format!("{} the plan", decision.as_str()),
        })
    }

    async fn expire(&self, task: Task) -> OrchestrationResult<()> {
        let now = self.clock.now();
        let reason = OrchestrationError::ApprovalTimeout {
            task_id: task.id.clone(),
        }
        .to_string();
        let mut next = task.clone();
        next.status = TaskStatus::Expired;
        next.completed_at = Some(now);
        next.status_reason = Some(format!("{reason} (trace: {})", trace_link(&task.id)));
        let mut tx = self.store.begin().await?;
        tx.update_task(&next, TaskStatus::PendingApproval, now).await?;
        tx.append(
            &AuditEvent::new(&task.id, EventKind::TaskTransition, SYSTEM_ACTOR, "task", now)
                .transition(Some(TaskStatus::PendingApproval.as_str()), TaskStatus::Expired.as_str())
                .reason(reason.clone())
                .payload(json!({ "approval_deadline": task.approval_deadline })),
        )
        .await?;
        tx.commit().await?;
        tracing::info!(task_id = %task.id, "approval window closed; task expired");
        self.notify_task(&next, NotificationKind::TaskTerminal, reason);
        Ok(())
    }

    async fn launch(&self, task: &Task, plan: &Plan, actor: &str) -> OrchestrationResult<(Execution, Advance)> {
        let execution = self.executor.start(task, &plan.id, actor).await?;
        let advance = self.executor.advance(&execution.id).await?;
        let execution = self.store.get_execution(&execution.id).await?;
        Ok((execution, advance))
    }

    // -- execution control ---------------------------------------------------

    /// Requests a pause. It takes effect at the next phase boundary; an
    /// in-flight phase always completes first.
    pub async fn pause(&self, execution_id: &str, actor: &str) -> OrchestrationResult<ExecutionView> {
        let execution = self.store.get_execution(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(control_refused(&execution, "pause"));
        }
        let held = execution.status == ExecutionStatus::Paused && execution.hold == Some(HoldReason::Operator);
        if !execution.pause_requested && !held {
            self.request_control(&execution, actor, true, false).await?;
        }
        let advance = self.drive_if_idle(&execution).await?;
        self.execution_view_with(execution_id, advance).await
    }

    /// Requests cancellation. Honored at the next phase boundary, after which
    /// every phase that changed anything is rolled back.
    pub async fn cancel(&self, execution_id: &str, actor: &str) -> OrchestrationResult<ExecutionView> {
        let execution = self.store.get_execution(execution_id).await?;
        if execution.status == ExecutionStatus::Cancelled {
            return self.execution_view_with(execution_id, None).await;
        }
        if execution.status.is_terminal() {
            return Err(control_refused(&execution, "cancel"));
        }
        if !execution.cancel_requested {
            self.request_control(&execution, actor, false, true).await?;
        }
        let advance = self.drive_if_idle(&execution).await?;
        self.execution_view_with(execution_id, advance).await
    }

    async fn request_control(&self, execution: &Execution, actor: &str, pause: bool, cancel: bool) -> OrchestrationResult<()> {
        let now = self.clock.now();
        let action = if cancel { "cancel" } else { "pause" };
        let mut tx = self.store.begin().await?;
        if !tx.request_control(&execution.id, pause, cancel).await? {
            return Err(control_refused(execution, action));
        }
        tx.append(
            &AuditEvent::new(&execution.task_id, EventKind::ExecutionControl, actor, "execution", now)
                .execution(&execution.id)
                .reason(format!("{action} requested"))
                .payload(json!({ "status": execution.status, "current_phase": execution.current_phase })),
        )
        .await?;
        tx.commit().await?;
        tracing::info!(
            task_id = %execution.task_id,
            execution_id = %execution.id,
            actor = actor,
            action = action,
            "execution control requested"
        );
        Ok(())
    }

    /// Drives the execution now unless another caller already is; that
    /// caller will observe the new flags at its next step.
    async fn drive_if_idle(&self, execution: &Execution) -> OrchestrationResult<Option<Advance>> {
        let Some(_guard) = self.locks.try_acquire(&execution.task_id) else {
            return Ok(None);
        };
        Ok(Some(self.executor.advance(&execution.id).await?))
    }

    /// Continues an operator-paused execution from the phase it stopped
    /// before. Resuming a running execution is a no-op.
    pub async fn resume(&self, execution_id: &str, actor: &str) -> OrchestrationResult<ExecutionView> {
        let task_id = self.store.get_execution(execution_id).await?.task_id;
        let _guard = self.locks.acquire(&task_id).await;
        let mut execution = self.store.get_execution(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(control_refused(&execution, "resume"));
        }
        if execution.hold == Some(HoldReason::PromotionApproval) {
            return Err(OrchestrationError::InvalidTransition {
                subject: format!("execution '{execution_id}'"),
                state: "awaiting promotion approval".to_string(),
                action: "resume (use approve-phase)".to_string(),
            });
        }
        if execution.status != ExecutionStatus::Paused && !execution.pause_requested {
            return self.execution_view_with(execution_id, None).await;
        }

        let now = self.clock.now();
        if execution.status == ExecutionStatus::Paused {
            self.revalidate_after_pause(&execution, actor, now).await?;
        }
        let from = execution.status;
        execution.status = ExecutionStatus::Running;
        execution.hold = None;
        execution.paused_at = None;
        execution.pause_requested = false;
        let mut tx = self.store.begin().await?;
        tx.update_execution(&mut execution).await?;
        tx.append(
            &AuditEvent::new(&execution.task_id, EventKind::ExecutionTransition, actor, "execution", now)
                .execution(&execution.id)
                .transition(Some(from.as_str()), ExecutionStatus::Running.as_str())
                .reason(format!("resumed before phase {}", execution.current_phase))
                .payload(json!({ "current_phase": execution.current_phase })),
        )
        .await?;
        tx.commit().await?;
        tracing::info!(execution_id = %execution.id, phase = execution.current_phase, actor = actor, "execution resumed");

        let advance = self.executor.advance(execution_id).await?;
        self.execution_view_with(execution_id, Some(advance)).await
    }

    async fn revalidate_after_pause(&self, execution: &Execution, actor: &str, now: DateTime<Utc>) -> OrchestrationResult<()> {
        let Some(bound) = self.settings.revalidate_after_pause_secs else {
            return Ok(());
        };
        let Some(paused_at) = execution.paused_at else {
            return Ok(());
        };
        if now - paused_at <= seconds(bound) {
            return Ok(());
        }
        let plan = self.store.get_plan(&execution.plan_id).await?;
        let facts = self.facts_for(plan_environment(&plan));
        let validation = ValidationPipeline {
            capabilities: &self.capabilities,
            policy: self.policy.as_ref(),
        }
        .validate(&plan, &facts)
        .await?;
        if validation.passed {
            return Ok(());
        }
        let reasons = validation
            .violations
            .iter()
            .map(|violation| violation.message.clone())
            .collect::<Vec<String>>();
        let mut tx = self.store.begin().await?;
        tx.append(
            &AuditEvent::new(&execution.task_id, EventKind::ExecutionControl, actor, "execution", now)
                .execution(&execution.id)
                .reason(format!("resume refused: plan no longer passes policy after a pause of {}s", (now - paused_at).num_seconds()))
                .payload(json!({ "violations": validation.violations })),
        )
        .await?;
        tx.commit().await?;
        tracing::warn!(execution_id = %execution.id, violations = reasons.len(), "resume refused by policy re-evaluation");
        Err(OrchestrationError::PolicyDenied { reasons })
    }

    /// Releases a promotion gate. Recorded as a phase-scoped approval.
    pub async fn approve_phase(&self, execution_id: &str, principal: &str, notes: Option<String>) -> OrchestrationResult<ExecutionView> {
        let principal = principal.trim().to_string();
        let task_id = self.store.get_execution(execution_id).await?.task_id;
        let _guard = self.locks.acquire(&task_id).await;
        let mut execution = self.store.get_execution(execution_id).await?;
        let task = self.store.get_task(&task_id).await?;
        let awaiting = execution.status == ExecutionStatus::Paused
            && execution.hold == Some(HoldReason::PromotionApproval);
        if !awaiting {
            let records = self.store.approvals_for_task(&task_id).await?;
            let repeated = records.iter().any(|record| {
                record.plan_id == execution.plan_id
                    && matches!(record.scope, ApprovalScope::Phase(_))
                    && record.approver_id == principal
                    && record.decision == ApprovalDecision::Approve
            });
            if repeated {
                return self.execution_view_with(execution_id, None).await;
            }
            return Err(control_refused(&execution, "approve a phase promotion"));
        }
        self.approvals.check_eligible(&principal, &task)?;

        let now = self.clock.now();
        let phase = execution.current_phase;
        let mut record = ApprovalRecord {
            id: new_id("appr"),
            task_id: task_id.clone(),
            plan_id: execution.plan_id.clone(),
            approver_id: principal.clone(),
            decision: ApprovalDecision::Approve,
            scope: ApprovalScope::Phase(phase),
            notes: notes.clone(),
            sequence: 0,
            created_at: now,
        };
        execution.status = ExecutionStatus::Running;
        execution.hold = None;
        execution.paused_at = None;
        let mut tx = self.store.begin().await?;
        tx.insert_approval(&mut record).await?;
        let mut recorded = AuditEvent::new(&task_id, EventKind::ApprovalRecorded, &principal, format!("phase:{phase}"), now)
            .execution(execution_id)
            .payload(json!({
                "approval_id": record.id,
                "plan_id": execution.plan_id,
                "decision": ApprovalDecision::Approve,
                "scope": record.scope,
                "sequence": record.sequence,
            }));
        if let Some(notes) = &notes {
            recorded = recorded.reason(notes.clone());
        }
        tx.append(&recorded).await?;
        tx.update_execution(&mut execution).await?;
        tx.append(
            &AuditEvent::new(&task_id, EventKind::ExecutionTransition, &principal, "execution", now)
                .execution(execution_id)
                .transition(Some(ExecutionStatus::Paused.as_str()), ExecutionStatus::Running.as_str())
                .reason(format!("promotion into phase {phase} approved by {principal}")),
        )
        .await?;
        tx.commit().await?;
        tracing::info!(execution_id = execution_id, phase, principal = %principal, "phase promotion approved");

        let advance = self.executor.advance(execution_id).await?;
        self.execution_view_with(execution_id, Some(advance)).await
    }

    /// Drives an execution until it has to wait.
    pub async fn advance(&self, execution_id: &str) -> OrchestrationResult<ExecutionView> {
        let task_id = self.store.get_execution(execution_id).await?.task_id;
        let _guard = self.locks.acquire(&task_id).await;
        let advance = self.executor.advance(execution_id).await?;
        self.execution_view_with(execution_id, Some(advance)).await
    }

    /// Fires every durable timer that is due: expires overdue approvals, then
    /// drives executions whose bake wait elapsed, whose deadline passed or
    /// that have a pending cancellation.
    pub async fn sweep(&self) -> OrchestrationResult<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();
        for task_id in self.store.expired_approvals(now).await? {
            let _guard = self.locks.acquire(&task_id).await;
            let task = self.store.get_task(&task_id).await?;
            if !approval::approval_expired(&task, now) {
                continue;
            }
            match self.expire(task).await {
                Ok(()) => report.expired.push(task_id),
                Err(err) => {
                    tracing::warn!(task_id = %task_id, error = %err, "failed to expire task");
                    report.errors.push(format!("{task_id}: {err}"));
                }
            }
        }
        for execution in self.store.due_executions(now).await? {
            let Some(_guard) = self.locks.try_acquire(&execution.task_id) else {
                report.skipped_busy += 1;
                continue;
            };
            match self.executor.advance(&execution.id).await {
                Ok(advance) => report.advanced.push(SweptExecution {
                    task_id: execution.task_id.clone(),
                    execution_id: execution.id.clone(),
                    advance,
                }),
                Err(err) => {
                    tracing::warn!(execution_id = %execution.id, error = %err, "failed to advance execution");
                    report.errors.push(format!("{}: {err}", execution.id));
                }
            }
        }
        if !report.expired.is_empty() || !report.advanced.is_empty() {
            tracing::info!(
                expired = report.expired.len(),
                advanced = report.advanced.len(),
                busy = report.skipped_busy,
                "timer sweep"
            );
        }
        Ok(report)
    }

    // -- queries -------------------------------------------------------------

    pub async fn task_view(&self, task_id: &str) -> OrchestrationResult<TaskView> {
        let task = self.store.get_task(task_id).await?;
        let plan = self.store.active_plan(task_id).await?;
        let approvals = self.store.approvals_for_task(task_id).await?;
        let verdict = plan
            .as_ref()
            .filter(|_| task.status == TaskStatus::PendingApproval)
            .map(|plan| approval::fold(&approvals, plan, &task, &self.approvals));
        let executions = self.store.executions_for_task(task_id).await?;
        Ok(TaskView {
            trace: trace_link(&task.id),
            task,
            plan,
            approvals,
            verdict,
            executions,
        })
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>, limit: u32) -> OrchestrationResult<Vec<Task>> {
        self.store.list_tasks(status, limit).await
    }

    pub async fn trace(&self, task_id: &str) -> OrchestrationResult<Vec<AuditEvent>> {
        self.store.get_task(task_id).await?;
        self.store.trace(task_id).await
    }

    pub async fn execution_view(&self, execution_id: &str) -> OrchestrationResult<ExecutionView> {
        self.execution_view_with(execution_id, None).await
    }

    async fn execution_view_with(&self, execution_id: &str, advance: Option<Advance>) -> OrchestrationResult<ExecutionView> {
        let execution = self.store.get_execution(execution_id).await?;
        let outcomes = self.store.all_outcomes(execution_id).await?;
        let phases = self
            .store
            .phases(execution_id)
            .await?
            .into_iter()
            .map(|phase| {
                let mine = outcomes
                    .iter()
                    .filter(|outcome| outcome.phase_index == phase.index)
                    .cloned()
                    .collect::<Vec<ResourceOutcome>>();
                PhaseView {
                    counts: outcome_counts(&mine),
                    outcomes: mine,
                    phase,
                }
            })
            .collect();
        Ok(ExecutionView {
            execution,
            phases,
            advance,
        })
    }

    // -- helpers -------------------------------------------------------------

    fn facts_for(&self, environment: Option<Environment>) -> ContextMap {
        let mut facts = self.settings.facts.clone();
        if let Some(environment) = environment {
            facts.insert("environment".to_string(), Value::String(environment.as_str().to_string()));
        }
        facts
    }

    fn notify_task(&self, task: &Task, kind: NotificationKind, summary: String) {
        notify::dispatch(
            &self.notifier,
            Notification {
                kind,
                task_id: task.id.clone(),
                execution_id: None,
                status: task.status.as_str().to_string(),
                summary,
                trace: trace_link(&task.id),
                at: self.clock.now(),
            },
        );
    }
}

fn control_refused(execution: &Execution, action: &str) -> OrchestrationError {
    OrchestrationError::InvalidTransition {
        subject: format!("execution '{}'", execution.id),
        state: execution.status.to_string(),
        action: action.to_string(),
    }
}

/// The environment a plan's phases were authored for.
fn plan_environment(plan: &Plan) -> Option<Environment> {
    plan.phases
        .iter()
        .find_map(|phase| phase.params.get("environment").and_then(Value::as_str))
        .and_then(Environment::parse)
}
