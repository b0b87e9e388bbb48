use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, TimeZone, Utc};
use clap::Parser;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tempfile::{TempDir, tempdir};
use tokio::sync::Notify;
use tower::ServiceExt;

use crate::agents::{AgentKind, AgentOverrides};
use crate::approval::Verdict;
use crate::cli::*;
use crate::clock::{ManualClock, seconds};
use crate::config::*;
use crate::connector::{ApplyOutcome, Connector, Health, HealthProbe, SimulatedConnector};
use crate::error::OrchestrationError;
use crate::executor::{Advance, ExecutorSettings};
use crate::ledger::EventKind;
use crate::model::*;
use crate::notify::{MemoryNotifier, NotificationKind};
use crate::orchestrator::*;
use crate::quality::{FixedReviewer, QualityScore};
use crate::server::*;
use crate::store::{SCHEMA_VERSION, Store};
use crate::validation::{PolicyDecision, PolicyEvaluator, PolicyRule, RulePolicyEvaluator};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Harness {
    _dir: TempDir,
    store: Store,
    clock: Arc<ManualClock>,
    notifier: Arc<MemoryNotifier>,
    orchestrator: Arc<Orchestrator>,
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
        .single()
        .expect("fixed start time should be valid")
}

/// Orchestrator over a fresh sqlite file with a manual clock, a fixed
/// reviewer scoring 85 and a fan-out of one.
async fn harness<C>(connector: Arc<C>, configure: impl FnOnce(OrchestratorBuilder) -> OrchestratorBuilder) -> Harness
where
    C: Connector + HealthProbe + 'static,
{
    let dir = tempdir().expect("temp directory should create");
    let url = format!("sqlite://{}", dir.path().join("state.db").display());
    let store = Store::open(&url).await.expect("store should open");
    let clock = Arc::new(ManualClock::new(start()));
    let notifier = Arc::new(MemoryNotifier::default());
    let builder = Orchestrator::builder(store.clone())
        .clock(clock.clone())
        .connector(connector)
        .notifier(notifier.clone())
        .reviewer(Arc::new(FixedReviewer(QualityScore::uniform(85))))
        .executor_settings(ExecutorSettings {
            fan_out_limit: 1,
            ..ExecutorSettings::default()
        });
    let orchestrator = Arc::new(configure(builder).build());
    Harness {
        _dir: dir,
        store,
        clock,
        notifier,
        orchestrator,
    }
}

async fn simulated(connector: SimulatedConnector, configure: impl FnOnce(OrchestratorBuilder) -> OrchestratorBuilder) -> (Harness, Arc<SimulatedConnector>) {
    let connector = Arc::new(connector);
    let h = harness(connector.clone(), configure).await;
    (h, connector)
}

fn fleet(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("web-{i:02}")).collect()
}

fn context(resources: &[String]) -> ContextMap {
    let mut context = ContextMap::new();
    context.insert("resources".to_string(), json!(resources));
    context.insert("bake_secs".to_string(), json!(0));
    context
}

fn submit_request(intent: &str, context: ContextMap) -> SubmitRequest {
    SubmitRequest {
        intent: intent.to_string(),
        context,
        submitter: "alice".to_string(),
        idempotency_key: None,
    }
}

fn autonomy(kind: AgentKind, mode: AutonomyMode) -> AgentOverrides {
    AgentOverrides {
        autonomy: BTreeMap::from([(kind, mode)]),
        deny: BTreeMap::new(),
    }
}

fn quality(score: u32) -> Arc<FixedReviewer> {
    Arc::new(FixedReviewer(QualityScore::uniform(score)))
}

async fn execution_id(h: &Harness, task_id: &str) -> String {
    h.store
        .executions_for_task(task_id)
        .await
        .expect("executions should load")
        .pop()
        .expect("task should have an execution")
        .id
}

fn outcome_states(view: &ExecutionView, phase: usize) -> Vec<(String, ResourceState)> {
    view.phases[phase]
        .outcomes
        .iter()
        .map(|outcome| (outcome.resource_id.clone(), outcome.state))
        .collect()
}

fn applied_calls(calls: &[(String, String)], operation: &str) -> Vec<String> {
    calls
        .iter()
        .filter(|(_, op)| op == operation)
        .map(|(resource, _)| resource.clone())
        .collect()
}

/// Lets detached notification tasks run.
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn sent_kinds(notifier: &MemoryNotifier) -> Vec<NotificationKind> {
    notifier.sent().iter().map(|n| n.kind).collect()
}

/// Connector whose process dies while applying one resource.
struct CrashingConnector {
    crash_on: String,
}

#[async_trait]
impl Connector for CrashingConnector {
    async fn apply(&self, resource_id: &str, _operation: &str, _params: &Value) -> ApplyOutcome {
        if resource_id == self.crash_on {
            panic!("connector process died while applying {resource_id}");
        }
        ApplyOutcome::Succeeded { detail: None }
    }
}

#[async_trait]
impl HealthProbe for CrashingConnector {
    async fn check(&self, _resource_id: &str) -> Health {
        Health::Healthy
    }
}

/// Holds the first apply on `gate` until the test releases it.
struct GatedConnector {
    inner: SimulatedConnector,
    gate: String,
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl GatedConnector {
    fn new(gate: &str) -> Self {
        Self {
            inner: SimulatedConnector::default(),
            gate: gate.to_string(),
            armed: AtomicBool::new(true),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl Connector for GatedConnector {
    async fn apply(&self, resource_id: &str, operation: &str, params: &Value) -> ApplyOutcome {
        if resource_id == self.gate && self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.apply(resource_id, operation, params).await
    }
}

#[async_trait]
impl HealthProbe for GatedConnector {
    async fn check(&self, resource_id: &str) -> Health {
        self.inner.check(resource_id).await
    }
}

/// Policy that denies every plan while the freeze is on.
#[derive(Default)]
struct FreezeSwitch {
    frozen: AtomicBool,
}

#[async_trait]
impl PolicyEvaluator for FreezeSwitch {
    async fn evaluate(&self, _plan: &Plan, _facts: &ContextMap) -> crate::error::OrchestrationResult<PolicyDecision> {
        if self.frozen.load(Ordering::SeqCst) {
            return Ok(PolicyDecision {
                allow: false,
                reasons: vec!["change freeze in effect".to_string()],
            });
        }
        Ok(PolicyDecision::allow())
    }
}

fn freeze_rule() -> PolicyRule {
    PolicyRule {
        name: "prod-freeze".to_string(),
        reason: "production changes are frozen".to_string(),
        operations: vec!["*_prod".to_string()],
        environments: vec![Environment::Prod],
        min_risk: None,
        when_fact: Some("change_freeze".to_string()),
        max_targets: None,
    }
}

// ---------------------------------------------------------------------------
// End-to-end flows
// ---------------------------------------------------------------------------

#[tokio::test]
async fn read_only_report_completes_without_approval() {
    let (h, connector) = simulated(SimulatedConnector::default(), |b| b).await;
    let submission = h
        .orchestrator
        .submit(submit_request("show drift on prod", context(&fleet(3))))
        .await
        .expect("submission should succeed");

    assert!(submission.violations.is_empty());
    assert_eq!(submission.task.status, TaskStatus::Completed);
    assert_eq!(submission.task.risk_class, Some(RiskClass::ReadOnly));
    let plan = submission.plan.as_ref().expect("plan should be drafted");
    assert_eq!(plan.phases.len(), 1);
    assert_eq!(plan.phases[0].operation, "drift.detect");
    assert!(matches!(
        submission.advance,
        Some(Advance::Finished { status: ExecutionStatus::Completed, .. })
    ));

    let view = h
        .orchestrator
        .task_view(&submission.task.id)
        .await
        .expect("task view should load");
    assert!(view.approvals.is_empty(), "read-only plans never record approvals");
    assert!(view.verdict.is_none());
    assert_eq!(view.executions.len(), 1);
    assert!(connector.calls().is_empty(), "evaluations never reach the connector");

    let invocations = h
        .store
        .invocations_for_task(&submission.task.id)
        .await
        .expect("invocations should load");
    assert!(invocations.iter().any(|inv| inv.tool == "drift.detect"));
    assert!(invocations.iter().all(|inv| inv.risk_class == RiskClass::ReadOnly));
}

async fn run_failed_mid_wave(order: [&str; 2]) {
    let (h, connector) = simulated(
        SimulatedConnector::default().fail("web-04", "patch.apply_prod"),
        |b| b,
    )
    .await;
    let submission = h
        .orchestrator
        .submit(submit_request("apply kernel patch to prod web fleet", context(&fleet(20))))
        .await
        .expect("submission should succeed");
    assert_eq!(submission.task.status, TaskStatus::PendingApproval);
    let plan = submission.plan.as_ref().expect("plan should be drafted");
    assert_eq!(plan.risk_class, RiskClass::StateChangeProd);
    assert_eq!(
        plan.phases.iter().map(|p| p.targets.len()).collect::<Vec<usize>>(),
        vec![2, 5, 13]
    );

    let first = h
        .orchestrator
        .approve(&submission.task.id, order[0], None)
        .await
        .expect("first approval should record");
    assert_eq!(first.verdict, Verdict::Pending { approvals: 1, required: 2 });
    assert!(first.execution.is_none());

    let second = h
        .orchestrator
        .approve(&submission.task.id, order[1], None)
        .await
        .expect("second approval should record");
    assert_eq!(second.verdict, Verdict::Approved);
    assert_eq!(second.task.status, TaskStatus::FailedWithRollback);
    match second.advance {
        Some(Advance::Finished { status, ref reason }) => {
            assert_eq!(status, ExecutionStatus::FailedWithRollback);
            assert!(reason.contains("batch"), "reason should name the failed phase: {reason}");
        }
        ref other => panic!("unexpected advance: {other:?}"),
    }

    let exec = execution_id(&h, &submission.task.id).await;
    let view = h
        .orchestrator
        .execution_view(&exec)
        .await
        .expect("execution view should load");
    assert_eq!(view.phases[0].phase.status, PhaseStatus::Passed);
    assert_eq!(view.phases[1].phase.status, PhaseStatus::RolledBack);
    assert_eq!(view.phases[2].phase.status, PhaseStatus::Pending);
    assert_eq!(
        outcome_states(&view, 0),
        vec![
            ("web-01".to_string(), ResourceState::Applied),
            ("web-02".to_string(), ResourceState::Applied),
        ]
    );
    let mid = outcome_states(&view, 1);
    assert!(mid.contains(&("web-03".to_string(), ResourceState::RolledBack)));
    assert!(mid.contains(&("web-04".to_string(), ResourceState::Failed)));
    for skipped in ["web-05", "web-06", "web-07"] {
        assert!(mid.contains(&(skipped.to_string(), ResourceState::Skipped)));
    }
    let fraction = view.phases[1].phase.failure_fraction.expect("fraction should be recorded");
    assert!((fraction - 0.2).abs() < 1e-9);

    let calls = connector.calls();
    assert_eq!(applied_calls(&calls, "patch.rollback"), vec!["web-03".to_string()]);
    assert!(applied_calls(&calls, "patch.apply_prod").iter().all(|r| r.as_str() <= "web-04"));

    settle().await;
    let kinds = sent_kinds(&h.notifier);
    assert!(kinds.contains(&NotificationKind::ApprovalRequested));
    assert!(kinds.contains(&NotificationKind::PhaseFailed));
    assert!(kinds.contains(&NotificationKind::TaskTerminal));
}

#[tokio::test]
async fn failed_mid_wave_rolls_back_after_approvals_in_either_order() {
    run_failed_mid_wave(["bob", "carol"]).await;
    run_failed_mid_wave(["carol", "bob"]).await;
}

#[tokio::test]
async fn unanswered_approval_expires_and_resubmission_is_independent() {
    let (h, _connector) = simulated(SimulatedConnector::default(), |b| b).await;
    let request = submit_request("apply kernel patch to prod web fleet", context(&fleet(4)));
    let first = h
        .orchestrator
        .submit(request.clone())
        .await
        .expect("submission should succeed");
    assert_eq!(first.task.status, TaskStatus::PendingApproval);
    assert_eq!(
        first.task.approval_deadline,
        Some(start() + seconds(DEFAULT_APPROVAL_TIMEOUT_SECS))
    );

    h.clock.advance(seconds(DEFAULT_APPROVAL_TIMEOUT_SECS - 1));
    let early = h.orchestrator.sweep().await.expect("sweep should run");
    assert!(early.expired.is_empty());

    h.clock.advance(seconds(2));
    let report = h.orchestrator.sweep().await.expect("sweep should run");
    assert_eq!(report.expired, vec![first.task.id.clone()]);
    let expired = h.store.get_task(&first.task.id).await.expect("task should load");
    assert_eq!(expired.status, TaskStatus::Expired);
    assert!(h.store.approvals_for_task(&first.task.id).await.expect("approvals").is_empty());

    let late = h
        .orchestrator
        .approve(&first.task.id, "bob", None)
        .await
        .expect_err("an expired task cannot be approved");
    assert!(matches!(late, OrchestrationError::InvalidTransition { .. }));

    let second = h
        .orchestrator
        .submit(request)
        .await
        .expect("resubmission should succeed");
    assert_ne!(second.task.id, first.task.id);
    assert_eq!(second.task.status, TaskStatus::PendingApproval);
    assert_eq!(
        first.plan.as_ref().map(|p| p.digest.clone()),
        second.plan.as_ref().map(|p| p.digest.clone()),
        "equivalent plans share a digest"
    );
    let untouched = h.store.get_task(&first.task.id).await.expect("task should load");
    assert_eq!(untouched.status, TaskStatus::Expired);

    settle().await;
    assert!(sent_kinds(&h.notifier).contains(&NotificationKind::TaskTerminal));
}

#[tokio::test]
async fn approving_after_the_deadline_expires_the_task() {
    let (h, _connector) = simulated(SimulatedConnector::default(), |b| {
        b.settings(OrchestratorSettings {
            approval_timeout_secs: 600,
            ..OrchestratorSettings::default()
        })
    })
    .await;
    let submission = h
        .orchestrator
        .submit(submit_request("apply kernel patch to prod web fleet", context(&fleet(4))))
        .await
        .expect("submission should succeed");

    h.clock.advance(seconds(600));
    let err = h
        .orchestrator
        .approve(&submission.task.id, "bob", None)
        .await
        .expect_err("approval after the deadline should fail");
    assert!(matches!(err, OrchestrationError::ApprovalTimeout { .. }));
    let task = h.store.get_task(&submission.task.id).await.expect("task should load");
    assert_eq!(task.status, TaskStatus::Expired);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_mid_phase_halts_at_the_next_boundary_and_resume_continues_there() {
    let gated = Arc::new(GatedConnector::new("web-02"));
    let h = harness(gated.clone(), |b| {
        b.agent_overrides(autonomy(AgentKind::Patch, AutonomyMode::FullAuto))
            .executor_settings(ExecutorSettings {
                fan_out_limit: 4,
                ..ExecutorSettings::default()
            })
    })
    .await;
    let submission = h
        .orchestrator
        .submit(submit_request("apply kernel patch to staging web fleet", context(&fleet(20))))
        .await
        .expect("submission should succeed");
    assert_eq!(submission.task.status, TaskStatus::PendingApproval);

    let orchestrator = Arc::clone(&h.orchestrator);
    let task_id = submission.task.id.clone();
    let approving = tokio::spawn(async move { orchestrator.approve(&task_id, "bob", None).await });

    gated.entered.notified().await;
    let exec = execution_id(&h, &submission.task.id).await;
    let requested = h
        .orchestrator
        .pause(&exec, "oncall")
        .await
        .expect("pause should be accepted mid-phase");
    assert!(requested.advance.is_none(), "the running driver observes the flag");
    assert!(requested.execution.pause_requested);
    assert_eq!(requested.execution.status, ExecutionStatus::Running);

    gated.release.notify_one();
    let approved = approving
        .await
        .expect("approval task should join")
        .expect("approval should succeed");
    assert_eq!(approved.advance, Some(Advance::Paused { phase: 1 }));

    let paused = h.orchestrator.execution_view(&exec).await.expect("view should load");
    assert_eq!(paused.execution.status, ExecutionStatus::Paused);
    assert_eq!(paused.execution.hold, Some(HoldReason::Operator));
    assert_eq!(paused.phases[0].phase.status, PhaseStatus::Passed);
    assert_eq!(paused.phases[0].counts.get("applied"), Some(&2));
    assert_eq!(paused.phases[1].phase.status, PhaseStatus::Pending);
    assert!(paused.phases[1].outcomes.is_empty());

    let resumed = h
        .orchestrator
        .resume(&exec, "oncall")
        .await
        .expect("resume should succeed");
    assert!(matches!(
        resumed.advance,
        Some(Advance::Finished { status: ExecutionStatus::Completed, .. })
    ));

    let mut applied = applied_calls(&gated.inner.calls(), "patch.apply_nonprod");
    assert_eq!(applied.len(), 20);
    applied.sort();
    applied.dedup();
    assert_eq!(applied.len(), 20, "no resource is applied twice");

    let noop = h
        .orchestrator
        .resume(&exec, "oncall")
        .await
        .expect_err("a completed execution cannot be resumed");
    assert!(matches!(noop, OrchestrationError::InvalidTransition { .. }));
}

// ---------------------------------------------------------------------------
// Approval gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn production_approval_respects_the_quality_floor() {
    let (h, _connector) = simulated(SimulatedConnector::default(), |b| b.reviewer(quality(79))).await;
    let submission = h
        .orchestrator
        .submit(submit_request("apply kernel patch to prod web fleet", context(&fleet(4))))
        .await
        .expect("submission should succeed");
    let err = h
        .orchestrator
        .approve(&submission.task.id, "bob", None)
        .await
        .expect_err("quality 79 should block approval");
    match err {
        OrchestrationError::QualityBelowThreshold { score, required, deficient } => {
            assert_eq!(score, 79);
            assert_eq!(required, 80);
            assert!(!deficient.is_empty());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(h.store.approvals_for_task(&submission.task.id).await.expect("approvals").is_empty());

    let rejected = h
        .orchestrator
        .reject(&submission.task.id, "bob", Some("too risky".to_string()))
        .await
        .expect("rejection ignores the quality floor");
    assert_eq!(rejected.task.status, TaskStatus::Rejected);

    let (h, _connector) = simulated(SimulatedConnector::default(), |b| b.reviewer(quality(80))).await;
    let submission = h
        .orchestrator
        .submit(submit_request("apply kernel patch to prod web fleet", context(&fleet(4))))
        .await
        .expect("submission should succeed");
    let outcome = h
        .orchestrator
        .approve(&submission.task.id, "bob", None)
        .await
        .expect("quality 80 meets the floor");
    assert!(outcome.recorded);
}

#[tokio::test]
async fn plan_only_auto_approval_boundary() {
    let (h, _connector) = simulated(SimulatedConnector::default(), |b| b.reviewer(quality(60))).await;
    let auto = h
        .orchestrator
        .submit(submit_request("plan kernel patch rollout for staging", context(&fleet(4))))
        .await
        .expect("submission should succeed");
    assert_eq!(auto.task.risk_class, Some(RiskClass::PlanOnly));
    assert_eq!(auto.task.status, TaskStatus::Completed);

    let (h, _connector) = simulated(SimulatedConnector::default(), |b| b.reviewer(quality(59))).await;
    let gated = h
        .orchestrator
        .submit(submit_request("plan kernel patch rollout for staging", context(&fleet(4))))
        .await
        .expect("submission should succeed");
    assert_eq!(gated.task.status, TaskStatus::PendingApproval);
    let view = h.orchestrator.task_view(&gated.task.id).await.expect("view should load");
    assert_eq!(view.verdict, Some(Verdict::Pending { approvals: 0, required: 1 }));
}

#[tokio::test]
async fn repeated_approvals_count_once_and_replays_are_no_ops() {
    let (h, _connector) = simulated(SimulatedConnector::default(), |b| {
        b.agent_overrides(autonomy(AgentKind::Patch, AutonomyMode::FullAuto))
    })
    .await;
    let submission = h
        .orchestrator
        .submit(submit_request("apply kernel patch to prod web fleet", context(&fleet(3))))
        .await
        .expect("submission should succeed");
    let task_id = submission.task.id.clone();

    let first = h.orchestrator.approve(&task_id, "bob", None).await.expect("approve");
    let again = h.orchestrator.approve(&task_id, "bob", None).await.expect("repeat approve");
    assert!(first.recorded);
    assert!(!again.recorded);
    assert_eq!(again.verdict, Verdict::Pending { approvals: 1, required: 2 });

    let done = h.orchestrator.approve(&task_id, "carol", None).await.expect("approve");
    assert_eq!(done.task.status, TaskStatus::Completed);

    let replay = h
        .orchestrator
        .approve(&task_id, "carol", None)
        .await
        .expect("replaying a recorded approval is a no-op");
    assert!(!replay.recorded);
    assert_eq!(replay.task.status, TaskStatus::Completed);
    let late = h
        .orchestrator
        .approve(&task_id, "dave", None)
        .await
        .expect_err("a new approver after completion is refused");
    assert!(matches!(late, OrchestrationError::InvalidTransition { .. }));

    let records = h.store.approvals_for_task(&task_id).await.expect("approvals");
    assert_eq!(records.len(), 2);
    assert_eq!(h.store.executions_for_task(&task_id).await.expect("executions").len(), 1);
}

#[tokio::test]
async fn any_rejection_wins_regardless_of_order() {
    let (h, _connector) = simulated(SimulatedConnector::default(), |b| b).await;
    let request = submit_request("apply kernel patch to prod web fleet", context(&fleet(4)));

    let approve_first = h.orchestrator.submit(request.clone()).await.expect("submit");
    h.orchestrator
        .approve(&approve_first.task.id, "bob", None)
        .await
        .expect("approve");
    let outcome = h
        .orchestrator
        .reject(&approve_first.task.id, "carol", Some("maintenance window closed".to_string()))
        .await
        .expect("reject");
    assert_eq!(outcome.task.status, TaskStatus::Rejected);
    assert_eq!(
        outcome.verdict,
        Verdict::Rejected {
            by: "carol".to_string(),
            notes: Some("maintenance window closed".to_string()),
        }
    );

    let reject_first = h.orchestrator.submit(request).await.expect("submit");
    let outcome = h
        .orchestrator
        .reject(&reject_first.task.id, "carol", None)
        .await
        .expect("reject");
    assert_eq!(outcome.task.status, TaskStatus::Rejected);
    let err = h
        .orchestrator
        .approve(&reject_first.task.id, "bob", None)
        .await
        .expect_err("a rejected task cannot be approved");
    assert!(matches!(err, OrchestrationError::InvalidTransition { .. }));
    assert!(h.store.executions_for_task(&reject_first.task.id).await.expect("executions").is_empty());
}

#[tokio::test]
async fn submitters_and_unlisted_principals_cannot_approve() {
    let (h, _connector) = simulated(SimulatedConnector::default(), |b| {
        b.approvals(crate::approval::ApprovalPolicy {
            approvers: vec!["ops-*".to_string()],
            ..crate::approval::ApprovalPolicy::default()
        })
    })
    .await;
    let submission = h
        .orchestrator
        .submit(submit_request("apply kernel patch to staging web fleet", context(&fleet(2))))
        .await
        .expect("submit");

    let own = h
        .orchestrator
        .approve(&submission.task.id, "alice", None)
        .await
        .expect_err("the submitter cannot approve");
    assert!(matches!(own, OrchestrationError::IneligibleApprover { .. }));
    let outsider = h
        .orchestrator
        .approve(&submission.task.id, "mallory", None)
        .await
        .expect_err("principals outside the approver list cannot approve");
    assert!(matches!(outsider, OrchestrationError::IneligibleApprover { .. }));

    let ok = h
        .orchestrator
        .approve(&submission.task.id, "ops-bob", None)
        .await
        .expect("listed approver should succeed");
    assert_eq!(ok.verdict, Verdict::Approved);
}

#[tokio::test]
async fn modification_request_returns_to_draft_and_revision_replans() {
    let (h, _connector) = simulated(SimulatedConnector::default(), |b| b).await;
    let submission = h
        .orchestrator
        .submit(submit_request("apply kernel patch to prod web fleet", context(&fleet(4))))
        .await
        .expect("submit");
    let task_id = submission.task.id.clone();
    h.orchestrator.approve(&task_id, "bob", None).await.expect("approve");
    let modified = h
        .orchestrator
        .request_modification(&task_id, "carol", Some("exclude web-04".to_string()))
        .await
        .expect("modify");
    assert_eq!(modified.task.status, TaskStatus::Draft);
    assert!(matches!(modified.verdict, Verdict::ModificationRequested { ref by, .. } if by == "carol"));

    let mut patch = ContextMap::new();
    patch.insert("resources".to_string(), json!(fleet(3)));
    let revised = h
        .orchestrator
        .revise(&task_id, "alice", patch)
        .await
        .expect("revise");
    assert_eq!(revised.task.revision, 2);
    assert_eq!(revised.task.status, TaskStatus::PendingApproval);
    let plan = revised.plan.expect("revised plan");
    assert_eq!(plan.affected_resources, fleet(3));

    let plans = h.store.plans_for_task(&task_id).await.expect("plans");
    assert_eq!(plans.len(), 2);
    assert_eq!(plans.iter().filter(|p| p.active).count(), 1);
    let view = h.orchestrator.task_view(&task_id).await.expect("view");
    assert_eq!(view.verdict, Some(Verdict::Pending { approvals: 0, required: 2 }));

    let err = h
        .orchestrator
        .revise(&task_id, "alice", ContextMap::new())
        .await
        .expect_err("only draft tasks can be revised");
    assert!(matches!(err, OrchestrationError::InvalidTransition { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_approvals_start_exactly_one_execution() {
    let (h, _connector) = simulated(SimulatedConnector::default(), |b| {
        b.agent_overrides(autonomy(AgentKind::Patch, AutonomyMode::FullAuto))
    })
    .await;
    let submission = h
        .orchestrator
        .submit(submit_request("apply kernel patch to prod web fleet", context(&fleet(3))))
        .await
        .expect("submit");

    let mut handles = Vec::new();
    for i in 0..8 {
        let orchestrator = Arc::clone(&h.orchestrator);
        let task_id = submission.task.id.clone();
        handles.push(tokio::spawn(async move {
            orchestrator.approve(&task_id, &format!("ops-{i}"), None).await
        }));
    }
    let mut recorded = 0;
    for handle in handles {
        match handle.await.expect("approval task should join") {
            Ok(outcome) => {
                assert!(outcome.recorded);
                recorded += 1;
            }
            Err(err) => assert!(matches!(err, OrchestrationError::InvalidTransition { .. }), "{err:?}"),
        }
    }
    assert_eq!(recorded, 2);
    assert_eq!(
        h.store.approvals_for_task(&submission.task.id).await.expect("approvals").len(),
        2
    );
    let executions = h.store.executions_for_task(&submission.task.id).await.expect("executions");
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_with_one_idempotency_key_create_one_task() {
    let (h, _connector) = simulated(SimulatedConnector::default(), |b| b).await;
    let mut handles = Vec::new();
    for _ in 0..5 {
        let orchestrator = Arc::clone(&h.orchestrator);
        let mut request = submit_request("show drift on prod", context(&fleet(2)));
        request.idempotency_key = Some("change-4711".to_string());
        handles.push(tokio::spawn(async move { orchestrator.submit(request).await }));
    }
    let mut ids = Vec::new();
    let mut fresh = 0;
    for handle in handles {
        let submission = handle.await.expect("join").expect("submission should succeed");
        if !submission.replayed {
            fresh += 1;
        }
        ids.push(submission.task.id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(fresh, 1);
    assert_eq!(h.orchestrator.list_tasks(None, 10).await.expect("list").len(), 1);
}

// ---------------------------------------------------------------------------
// Execution engine
// ---------------------------------------------------------------------------

async fn staging_rollout(h: &Harness, hosts: usize, bake_secs: u64) -> (String, DecisionOutcome) {
    let mut ctx = context(&fleet(hosts));
    ctx.insert("bake_secs".to_string(), json!(bake_secs));
    let submission = h
        .orchestrator
        .submit(submit_request("apply kernel patch to staging web fleet", ctx))
        .await
        .expect("submit");
    let outcome = h
        .orchestrator
        .approve(&submission.task.id, "bob", None)
        .await
        .expect("approve");
    (submission.task.id, outcome)
}

#[tokio::test]
async fn failure_fraction_at_the_threshold_triggers_rollback() {
    let (h, _connector) = simulated(
        SimulatedConnector::default().fail("web-03", "patch.apply_nonprod"),
        |b| b.agent_overrides(autonomy(AgentKind::Patch, AutonomyMode::FullAuto)),
    )
    .await;
    let (task_id, outcome) = staging_rollout(&h, 80, 0).await;
    assert!(matches!(
        outcome.advance,
        Some(Advance::Finished { status: ExecutionStatus::FailedWithRollback, .. })
    ));
    let view = h
        .orchestrator
        .execution_view(&execution_id(&h, &task_id).await)
        .await
        .expect("view");
    assert_eq!(view.phases[1].phase.spec.targets.len(), 20);
    let fraction = view.phases[1].phase.failure_fraction.expect("fraction");
    assert!((fraction - 0.05).abs() < 1e-9);
    assert_eq!(view.phases[1].counts.get("skipped"), Some(&19));
}

#[tokio::test]
async fn failure_fraction_below_the_threshold_keeps_rolling() {
    let (h, _connector) = simulated(
        SimulatedConnector::default().fail("web-03", "patch.apply_nonprod"),
        |b| b.agent_overrides(autonomy(AgentKind::Patch, AutonomyMode::FullAuto)),
    )
    .await;
    let (task_id, outcome) = staging_rollout(&h, 84, 0).await;
    assert!(matches!(
        outcome.advance,
        Some(Advance::Finished { status: ExecutionStatus::Completed, .. })
    ));
    let view = h
        .orchestrator
        .execution_view(&execution_id(&h, &task_id).await)
        .await
        .expect("view");
    assert_eq!(view.phases[1].phase.spec.targets.len(), 21);
    assert_eq!(view.phases[1].phase.status, PhaseStatus::Passed);
    assert_eq!(view.phases[1].counts.get("failed"), Some(&1));
    assert_eq!(view.phases[2].phase.status, PhaseStatus::Passed);
}

#[tokio::test]
async fn unhealthy_canary_is_reverted() {
    let (h, connector) = simulated(
        SimulatedConnector::default().unhealthy("web-01", "patch.apply_nonprod"),
        |b| b.agent_overrides(autonomy(AgentKind::Patch, AutonomyMode::FullAuto)),
    )
    .await;
    let (task_id, outcome) = staging_rollout(&h, 20, 0).await;
    assert_eq!(outcome.task.status, TaskStatus::FailedWithRollback);
    let view = h
        .orchestrator
        .execution_view(&execution_id(&h, &task_id).await)
        .await
        .expect("view");
    assert_eq!(
        outcome_states(&view, 0),
        vec![
            ("web-01".to_string(), ResourceState::RolledBack),
            ("web-02".to_string(), ResourceState::RolledBack),
        ]
    );
    // Latest completion is reverted first.
    assert_eq!(
        applied_calls(&connector.calls(), "patch.rollback"),
        vec!["web-02".to_string(), "web-01".to_string()]
    );
}

#[tokio::test]
async fn failed_revert_is_flagged_for_manual_intervention() {
    let (h, _connector) = simulated(
        SimulatedConnector::default()
            .fail("web-04", "patch.apply_nonprod")
            .fail("web-03", "patch.rollback"),
        |b| b.agent_overrides(autonomy(AgentKind::Patch, AutonomyMode::FullAuto)),
    )
    .await;
    let (task_id, outcome) = staging_rollout(&h, 20, 0).await;
    match outcome.advance {
        Some(Advance::Finished { status, ref reason }) => {
            assert_eq!(status, ExecutionStatus::FailedWithRollback);
            assert!(reason.contains("manual intervention required for web-03"), "{reason}");
        }
        ref other => panic!("unexpected advance: {other:?}"),
    }
    let view = h
        .orchestrator
        .execution_view(&execution_id(&h, &task_id).await)
        .await
        .expect("view");
    assert!(outcome_states(&view, 1).contains(&("web-03".to_string(), ResourceState::ManualInterventionRequired)));

    settle().await;
    assert!(sent_kinds(&h.notifier).contains(&NotificationKind::ManualInterventionRequired));
}

#[tokio::test]
async fn sweep_wakes_executions_after_bake_waits() {
    let (h, _connector) = simulated(SimulatedConnector::default(), |b| {
        b.agent_overrides(autonomy(AgentKind::Patch, AutonomyMode::FullAuto))
    })
    .await;
    let (task_id, outcome) = staging_rollout(&h, 20, 600).await;
    assert_eq!(
        outcome.advance,
        Some(Advance::Waiting { phase: 1, until: start() + seconds(600) })
    );

    h.clock.advance(seconds(599));
    let idle = h.orchestrator.sweep().await.expect("sweep");
    assert!(idle.advanced.is_empty());

    h.clock.advance(seconds(1));
    let report = h.orchestrator.sweep().await.expect("sweep");
    assert_eq!(report.advanced.len(), 1);
    assert!(matches!(report.advanced[0].advance, Advance::Waiting { phase: 2, .. }));

    h.clock.advance(seconds(600));
    let report = h.orchestrator.sweep().await.expect("sweep");
    assert!(matches!(
        report.advanced[0].advance,
        Advance::Finished { status: ExecutionStatus::Completed, .. }
    ));
    let task = h.store.get_task(&task_id).await.expect("task");
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn global_timeout_expires_and_rolls_back() {
    let (h, connector) = simulated(SimulatedConnector::default(), |b| {
        b.agent_overrides(autonomy(AgentKind::Patch, AutonomyMode::FullAuto))
            .executor_settings(ExecutorSettings {
                fan_out_limit: 1,
                execution_timeout_secs: 300,
                ..ExecutorSettings::default()
            })
    })
    .await;
    let (task_id, outcome) = staging_rollout(&h, 20, 600).await;
    assert!(matches!(outcome.advance, Some(Advance::Waiting { phase: 1, .. })));

    h.clock.advance(seconds(301));
    let report = h.orchestrator.sweep().await.expect("sweep");
    match &report.advanced[0].advance {
        Advance::Finished { status, reason } => {
            assert_eq!(*status, ExecutionStatus::Expired);
            assert!(reason.contains("rolled back 1 phase(s)"), "{reason}");
        }
        other => panic!("unexpected advance: {other:?}"),
    }
    let task = h.store.get_task(&task_id).await.expect("task");
    assert_eq!(task.status, TaskStatus::Expired);
    assert_eq!(
        applied_calls(&connector.calls(), "patch.rollback").len(),
        2,
        "both canary resources are reverted"
    );
}

#[tokio::test]
async fn cancel_at_a_boundary_rolls_back_completed_phases() {
    let (h, _connector) = simulated(SimulatedConnector::default(), |b| {
        b.agent_overrides(autonomy(AgentKind::Patch, AutonomyMode::FullAuto))
    })
    .await;
    let (task_id, _outcome) = staging_rollout(&h, 20, 600).await;
    let exec = execution_id(&h, &task_id).await;

    let cancelled = h.orchestrator.cancel(&exec, "oncall").await.expect("cancel");
    assert_eq!(cancelled.execution.status, ExecutionStatus::Cancelled);
    assert_eq!(cancelled.phases[0].phase.status, PhaseStatus::RolledBack);
    assert_eq!(cancelled.phases[0].counts.get("rolled_back"), Some(&2));
    assert_eq!(
        h.store.get_task(&task_id).await.expect("task").status,
        TaskStatus::Cancelled
    );

    let again = h.orchestrator.cancel(&exec, "oncall").await.expect("repeat cancel is a no-op");
    assert_eq!(again.execution.status, ExecutionStatus::Cancelled);
    let err = h
        .orchestrator
        .pause(&exec, "oncall")
        .await
        .expect_err("a cancelled execution cannot be paused");
    assert!(matches!(err, OrchestrationError::InvalidTransition { .. }));
}

#[tokio::test]
async fn crashed_phase_resumes_without_reapplying_recorded_resources() {
    let dir = tempdir().expect("temp directory should create");
    let url = format!("sqlite://{}", dir.path().join("state.db").display());
    let store = Store::open(&url).await.expect("store should open");
    let clock = Arc::new(ManualClock::new(start()));

    let crashing = Orchestrator::builder(store.clone())
        .clock(clock.clone())
        .connector(Arc::new(CrashingConnector {
            crash_on: "web-02".to_string(),
        }))
        .executor_settings(ExecutorSettings {
            fan_out_limit: 1,
            ..ExecutorSettings::default()
        })
        .build();
    let submission = crashing
        .submit(submit_request("apply kernel patch to staging web fleet", context(&fleet(2))))
        .await
        .expect("submit");
    let err = crashing
        .approve(&submission.task.id, "bob", None)
        .await
        .expect_err("the connector crash surfaces as an error");
    assert!(matches!(err, OrchestrationError::Collaborator(_)));
    drop(crashing);

    let exec = store
        .executions_for_task(&submission.task.id)
        .await
        .expect("executions")
        .pop()
        .expect("execution should exist");
    assert_eq!(exec.status, ExecutionStatus::Running);
    let recorded = store.all_outcomes(&exec.id).await.expect("outcomes");
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].resource_id, "web-01");

    let healthy = Arc::new(SimulatedConnector::default());
    let restarted = Orchestrator::builder(store.clone())
        .clock(clock.clone())
        .connector(healthy.clone())
        .build();
    let report = restarted.sweep().await.expect("sweep after restart");
    assert_eq!(report.advanced.len(), 1);
    assert!(matches!(
        report.advanced[0].advance,
        Advance::Finished { status: ExecutionStatus::Completed, .. }
    ));
    assert_eq!(
        healthy.calls(),
        vec![("web-02".to_string(), "patch.apply_nonprod".to_string())]
    );
    assert_eq!(
        store.get_task(&submission.task.id).await.expect("task").status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn canary_only_holds_before_the_final_wave() {
    let (h, _connector) = simulated(SimulatedConnector::default(), |b| b).await;
    let submission = h
        .orchestrator
        .submit(submit_request("apply kernel patch to prod web fleet", context(&fleet(20))))
        .await
        .expect("submit");
    h.orchestrator.approve(&submission.task.id, "bob", None).await.expect("approve");
    let outcome = h
        .orchestrator
        .approve(&submission.task.id, "carol", None)
        .await
        .expect("approve");
    assert_eq!(outcome.advance, Some(Advance::AwaitingPromotion { phase: 2 }));

    let exec = execution_id(&h, &submission.task.id).await;
    let released = h
        .orchestrator
        .approve_phase(&exec, "dave", Some("canary and batch look healthy".to_string()))
        .await
        .expect("promotion approval");
    assert!(matches!(
        released.advance,
        Some(Advance::Finished { status: ExecutionStatus::Completed, .. })
    ));
    let records = h.store.approvals_for_task(&submission.task.id).await.expect("approvals");
    assert!(records.iter().any(|r| r.scope == ApprovalScope::Phase(2) && r.approver_id == "dave"));

    settle().await;
    assert!(sent_kinds(&h.notifier).contains(&NotificationKind::PromotionRequested));
}

#[tokio::test]
async fn supervised_rollout_needs_a_promotion_approval_per_wave() {
    let (h, _connector) = simulated(SimulatedConnector::default(), |b| {
        b.agent_overrides(autonomy(AgentKind::Patch, AutonomyMode::Supervised))
    })
    .await;
    let submission = h
        .orchestrator
        .submit(submit_request("apply kernel patch to prod web fleet", context(&fleet(20))))
        .await
        .expect("submit");
    h.orchestrator.approve(&submission.task.id, "bob", None).await.expect("approve");
    let outcome = h
        .orchestrator
        .approve(&submission.task.id, "carol", None)
        .await
        .expect("approve");
    assert_eq!(outcome.advance, Some(Advance::AwaitingPromotion { phase: 1 }));
    let exec = execution_id(&h, &submission.task.id).await;

    let resume = h
        .orchestrator
        .resume(&exec, "bob")
        .await
        .expect_err("a promotion hold is not released by resume");
    assert!(matches!(resume, OrchestrationError::InvalidTransition { .. }));
    let own = h
        .orchestrator
        .approve_phase(&exec, "alice", None)
        .await
        .expect_err("the submitter cannot release a promotion");
    assert!(matches!(own, OrchestrationError::IneligibleApprover { .. }));

    let batch = h.orchestrator.approve_phase(&exec, "bob", None).await.expect("promote");
    assert_eq!(batch.advance, Some(Advance::AwaitingPromotion { phase: 2 }));
    let full = h.orchestrator.approve_phase(&exec, "carol", None).await.expect("promote");
    assert!(matches!(
        full.advance,
        Some(Advance::Finished { status: ExecutionStatus::Completed, .. })
    ));

    let replay = h
        .orchestrator
        .approve_phase(&exec, "carol", None)
        .await
        .expect("a repeated promotion approval is a no-op");
    assert_eq!(replay.execution.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn unauthorized_capability_halts_the_task() {
    let overrides = AgentOverrides {
        autonomy: BTreeMap::new(),
        deny: BTreeMap::from([(AgentKind::Patch, vec!["*_prod".to_string()])]),
    };
    let (h, connector) = simulated(SimulatedConnector::default(), move |b| b.agent_overrides(overrides)).await;
    let err = h
        .orchestrator
        .submit(submit_request("apply kernel patch to prod web fleet", context(&fleet(4))))
        .await
        .expect_err("planning with a denied capability must fail");
    match &err {
        OrchestrationError::UnauthorizedCapability { agent, tool } => {
            assert_eq!(agent, "patch");
            assert_eq!(tool, "patch.apply_prod");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let halted = h
        .orchestrator
        .list_tasks(Some(TaskStatus::Halted), 10)
        .await
        .expect("list");
    assert_eq!(halted.len(), 1);
    assert!(connector.calls().is_empty());
    let trace = h.orchestrator.trace(&halted[0].id).await.expect("trace");
    assert!(trace.iter().any(|event| {
        event.kind == EventKind::TaskTransition && event.to_state.as_deref() == Some("halted")
    }));

    let staging = h
        .orchestrator
        .submit(submit_request("apply kernel patch to staging web fleet", context(&fleet(4))))
        .await
        .expect("non-production tools stay authorized");
    assert_eq!(staging.task.status, TaskStatus::PendingApproval);
}

#[tokio::test]
async fn policy_violation_leaves_the_task_in_draft_until_revised() {
    let mut facts = ContextMap::new();
    facts.insert("change_freeze".to_string(), json!(true));
    let (h, _connector) = simulated(SimulatedConnector::default(), move |b| {
        b.policy(Arc::new(RulePolicyEvaluator::new(vec![freeze_rule()])))
            .settings(OrchestratorSettings {
                facts,
                ..OrchestratorSettings::default()
            })
    })
    .await;
    let submission = h
        .orchestrator
        .submit(submit_request("apply kernel patch to prod web fleet", context(&fleet(4))))
        .await
        .expect("a policy violation is reported, not raised");
    assert_eq!(submission.task.status, TaskStatus::Draft);
    assert!(!submission.violations.is_empty());
    assert!(
        submission
            .task
            .status_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("prod-freeze")),
        "{:?}",
        submission.task.status_reason
    );
    assert!(!submission.plan.as_ref().expect("plan").validated);

    let mut patch = ContextMap::new();
    patch.insert("environment".to_string(), json!("staging"));
    let revised = h
        .orchestrator
        .revise(&submission.task.id, "alice", patch)
        .await
        .expect("revise");
    assert!(revised.violations.is_empty());
    assert_eq!(revised.task.status, TaskStatus::PendingApproval);
    assert_eq!(revised.task.risk_class, Some(RiskClass::StateChangeNonprod));
}

#[tokio::test]
async fn long_pause_is_revalidated_before_resume() {
    let switch = Arc::new(FreezeSwitch::default());
    let policy = switch.clone();
    let (h, _connector) = simulated(SimulatedConnector::default(), move |b| {
        b.agent_overrides(autonomy(AgentKind::Patch, AutonomyMode::FullAuto))
            .policy(policy)
            .settings(OrchestratorSettings {
                revalidate_after_pause_secs: Some(3600),
                ..OrchestratorSettings::default()
            })
    })
    .await;
    let (task_id, outcome) = staging_rollout(&h, 20, 600).await;
    assert!(matches!(outcome.advance, Some(Advance::Waiting { phase: 1, .. })));
    let exec = execution_id(&h, &task_id).await;

    let paused = h.orchestrator.pause(&exec, "oncall").await.expect("pause");
    assert_eq!(paused.advance, Some(Advance::Paused { phase: 1 }));

    h.clock.advance(seconds(7200));
    switch.frozen.store(true, Ordering::SeqCst);
    let err = h
        .orchestrator
        .resume(&exec, "oncall")
        .await
        .expect_err("the plan no longer passes policy");
    assert!(matches!(err, OrchestrationError::PolicyDenied { ref reasons } if !reasons.is_empty()));
    let still = h.orchestrator.execution_view(&exec).await.expect("view");
    assert_eq!(still.execution.status, ExecutionStatus::Paused);

    switch.frozen.store(false, Ordering::SeqCst);
    let resumed = h.orchestrator.resume(&exec, "oncall").await.expect("resume");
    assert!(matches!(resumed.advance, Some(Advance::Waiting { phase: 2, .. })));
}

#[tokio::test]
async fn short_pause_skips_revalidation() {
    let switch = Arc::new(FreezeSwitch::default());
    let policy = switch.clone();
    let (h, _connector) = simulated(SimulatedConnector::default(), move |b| {
        b.agent_overrides(autonomy(AgentKind::Patch, AutonomyMode::FullAuto))
            .policy(policy)
            .settings(OrchestratorSettings {
                revalidate_after_pause_secs: Some(3600),
                ..OrchestratorSettings::default()
            })
    })
    .await;
    let (task_id, _outcome) = staging_rollout(&h, 20, 0).await;
    let exec = execution_id(&h, &task_id).await;
    // Completed already: nothing to pause.
    let err = h.orchestrator.pause(&exec, "oncall").await.expect_err("terminal");
    assert!(matches!(err, OrchestrationError::InvalidTransition { .. }));

    let (task_id, _outcome) = staging_rollout(&h, 20, 600).await;
    let exec = execution_id(&h, &task_id).await;
    h.orchestrator.pause(&exec, "oncall").await.expect("pause");
    h.clock.advance(seconds(1800));
    switch.frozen.store(true, Ordering::SeqCst);
    let resumed = h
        .orchestrator
        .resume(&exec, "oncall")
        .await
        .expect("a short pause resumes without re-evaluation");
    assert!(matches!(resumed.advance, Some(Advance::Waiting { phase: 2, .. })));
}

#[tokio::test]
async fn audit_trace_is_ordered_and_complete() {
    let (h, _connector) = simulated(SimulatedConnector::default(), |b| {
        b.agent_overrides(autonomy(AgentKind::Patch, AutonomyMode::FullAuto))
    })
    .await;
    let (task_id, _outcome) = staging_rollout(&h, 3, 0).await;
    let trace = h.orchestrator.trace(&task_id).await.expect("trace");
    assert!(trace.windows(2).all(|pair| pair[0].seq < pair[1].seq));
    for kind in [
        EventKind::TaskSubmitted,
        EventKind::IntentResolved,
        EventKind::PlanCreated,
        EventKind::PlanValidated,
        EventKind::ApprovalRecorded,
        EventKind::ExecutionCreated,
        EventKind::PhaseTransition,
        EventKind::ResourceOutcome,
        EventKind::ToolInvoked,
    ] {
        assert!(trace.iter().any(|event| event.kind == kind), "missing {}", kind.as_str());
    }
    assert_eq!(trace.first().map(|e| e.kind), Some(EventKind::TaskSubmitted));
    assert_eq!(
        trace.last().and_then(|e| e.to_state.clone()).as_deref(),
        Some("completed")
    );

    let missing = h
        .orchestrator
        .trace("task-missing")
        .await
        .expect_err("unknown task");
    assert!(matches!(missing, OrchestrationError::NotFound { .. }));
}

// ---------------------------------------------------------------------------
// Configuration and CLI helpers
// ---------------------------------------------------------------------------

const OPS_PROFILE: &str = r#"
[profiles.ops]
approval_timeout_secs = 3600
fan_out_limit = 2
approvers = ["ops-*"]
notify_enabled = false
revalidate_after_pause_secs = 14400
intent_guardrail_mode = "block"
facts = { change_freeze = false }
agent_autonomy = { patch = "full_auto" }
agent_tool_deny = { cost = ["*_prod"] }

[[profiles.ops.policy_rules]]
name = "prod-freeze"
reason = "production changes are frozen"
operations = ["*_prod"]
when_fact = "change_freeze"

[[profiles.ops.simulated_faults]]
resource = "web-01"
effect = "fail"
"#;

fn write_config(dir: &TempDir, body: &str) -> String {
    let path = dir.path().join("config.toml");
    std::fs::write(&path, body).expect("config should write");
    path.to_string_lossy().to_string()
}

fn parse_cli(args: &[&str]) -> Cli {
    let mut argv = vec!["changegate"];
    argv.extend_from_slice(args);
    Cli::try_parse_from(argv).expect("cli should parse")
}

#[test]
fn runtime_config_layers_cli_over_profile_over_defaults() {
    let dir = tempdir().expect("temp directory should create");
    let path = write_config(&dir, OPS_PROFILE);
    let cli = parse_cli(&["--config-path", path.as_str(), "--profile", "ops", "--fan-out-limit", "8", "profiles", "show"]);
    assert_eq!(command_label(&cli.command), "profiles.show");

    let profiles = load_profiles(&cli.config_path).expect("profiles should load");
    let cfg = resolve_runtime_config(&cli, &profiles).expect("runtime config should resolve");

    assert_eq!(cfg.profile, "ops");
    assert_eq!(cfg.fan_out_limit, 8);
    assert_eq!(cfg.approval_timeout_secs, 3600);
    assert_eq!(cfg.approvers, vec!["ops-*".to_string()]);
    assert!(!cfg.notify_enabled);
    assert_eq!(cfg.revalidate_after_pause_secs, Some(14400));
    assert_eq!(cfg.intent_guardrail_mode, crate::guardrail::GuardrailMode::Block);
    assert_eq!(cfg.agent_autonomy.get(&AgentKind::Patch), Some(&AutonomyMode::FullAuto));
    assert_eq!(
        cfg.agent_tool_deny.get(&AgentKind::Cost),
        Some(&vec!["*_prod".to_string()])
    );
    assert_eq!(cfg.policy_rules.len(), 1);
    assert_eq!(cfg.simulated_faults.len(), 1);
    assert_eq!(cfg.simulated_faults[0].operation, "*");
    assert_eq!(cfg.facts.get("change_freeze"), Some(&json!(false)));

    assert_eq!(cfg.store_url, DEFAULT_STORE_URL);
    assert_eq!(cfg.sweep_interval_secs, DEFAULT_SWEEP_INTERVAL_SECS);
    assert_eq!(cfg.execution_timeout_secs, crate::executor::DEFAULT_EXECUTION_TIMEOUT_SECS);
    assert_eq!(cfg.connector, ConnectorKind::Simulated);
    assert!((cfg.auto_rollback_threshold - 0.05).abs() < 1e-9);
}

#[test]
fn cli_approvers_replace_the_profile_list() {
    let dir = tempdir().expect("temp directory should create");
    let path = write_config(&dir, OPS_PROFILE);
    let cli = parse_cli(&["--config-path", path.as_str(), "--profile", "ops", "--approver", "sre-lead", "doctor"]);
    let profiles = load_profiles(&cli.config_path).expect("profiles should load");
    let cfg = resolve_runtime_config(&cli, &profiles).expect("runtime config should resolve");
    assert_eq!(cfg.approvers, vec!["sre-lead".to_string()]);
}

#[test]
fn default_profile_is_implicit_and_open_to_every_approver() {
    let cli = parse_cli(&["--config-path", "/nonexistent/changegate.toml", "sweep"]);
    let profiles = load_profiles(&cli.config_path).expect("missing config should default");
    let cfg = resolve_runtime_config(&cli, &profiles).expect("runtime config should resolve");
    assert_eq!(cfg.profile, "default");
    assert_eq!(cfg.approvers, vec!["*".to_string()]);
    assert!(cfg.notify_enabled);
    assert_eq!(cfg.revalidate_after_pause_secs, None);
    assert!(cfg.guardrail_terms.iter().any(|term| term == "password"));
}

#[test]
fn runtime_config_reports_missing_profile() {
    let dir = tempdir().expect("temp directory should create");
    let path = write_config(&dir, OPS_PROFILE);
    let cli = parse_cli(&["--config-path", path.as_str(), "--profile", "prod", "sweep"]);
    let profiles = load_profiles(&cli.config_path).expect("profiles should load");
    let err = resolve_runtime_config(&cli, &profiles).expect_err("missing profile should fail");
    let msg = err.to_string();
    assert!(msg.contains("profile 'prod' not found"), "{msg}");
    assert!(msg.contains("Available profiles: ops"), "{msg}");
}

#[test]
fn runtime_config_rejects_bad_values() {
    let dir = tempdir().expect("temp directory should create");
    let path = write_config(&dir, OPS_PROFILE);
    let cli = parse_cli(&["--config-path", path.as_str(), "--profile", "ops", "--auto-rollback-threshold", "1.5", "sweep"]);
    let profiles = load_profiles(&cli.config_path).expect("profiles should load");
    let err = resolve_runtime_config(&cli, &profiles).expect_err("threshold above one should fail");
    assert!(err.to_string().contains("auto_rollback_threshold"));

    let path = write_config(&dir, "[profiles.ops]\nagent_autonomy = { patcher = \"full_auto\" }\n");
    let cli = parse_cli(&["--config-path", path.as_str(), "--profile", "ops", "sweep"]);
    let profiles = load_profiles(&cli.config_path).expect("profiles should load");
    let err = resolve_runtime_config(&cli, &profiles).expect_err("unknown agent should fail");
    assert!(err.to_string().contains("unknown agent 'patcher'"));

    let path = write_config(&dir, "[profiles.ops]\nfan_out = 3\n");
    let err = load_profiles(&path).expect_err("unknown fields should be rejected");
    assert!(err.to_string().contains("invalid profile configuration"));
}

#[tokio::test]
async fn command_connector_requires_an_apply_command() {
    let dir = tempdir().expect("temp directory should create");
    let store_url = format!("sqlite://{}", dir.path().join("state.db").display());
    let cli = parse_cli(&["--store-url", store_url.as_str(), "--connector", "command", "doctor"]);
    let cfg = resolve_runtime_config(&cli, &ProfilesFile::default()).expect("config");
    assert!(!connector_problems(&cfg).is_empty());
    let err = build_orchestrator(&cfg)
        .await
        .err()
        .expect("a command connector without a template should not build");
    assert!(err.to_string().contains("apply"), "{err}");
}

#[tokio::test]
async fn profile_faults_drive_the_simulated_connector() {
    let dir = tempdir().expect("temp directory should create");
    let store_url = format!("sqlite://{}", dir.path().join("state.db").display());
    let path = write_config(
        &dir,
        &format!(
            "[profiles.lab]\nstore_url = \"{store_url}\"\nnotify_enabled = false\n\n[[profiles.lab.simulated_faults]]\nresource = \"web-01\"\noperation = \"patch.apply_nonprod\"\neffect = \"fail\"\n"
        ),
    );
    let cli = parse_cli(&["--config-path", path.as_str(), "--profile", "lab", "sweep"]);
    let profiles = load_profiles(&cli.config_path).expect("profiles should load");
    let cfg = resolve_runtime_config(&cli, &profiles).expect("config");
    let orchestrator = build_orchestrator(&cfg).await.expect("orchestrator should build");

    let submission = orchestrator
        .submit(submit_request("apply kernel patch to staging web fleet", context(&fleet(2))))
        .await
        .expect("submit");
    let outcome = orchestrator
        .approve(&submission.task.id, "bob", None)
        .await
        .expect("approve");
    assert_eq!(outcome.task.status, TaskStatus::FailedWithRollback);
}

#[test]
fn context_args_keep_json_types_and_append_resources() {
    let context = parse_context_args(
        &[
            "bake_secs=0".to_string(),
            "environment=staging".to_string(),
            r#"params={"patch":"kb-5031"}"#.to_string(),
            r#"resources=["web-01"]"#.to_string(),
        ],
        &["web-02".to_string()],
    )
    .expect("context should parse");
    assert_eq!(context.get("bake_secs"), Some(&json!(0)));
    assert_eq!(context.get("environment"), Some(&json!("staging")));
    assert_eq!(context.get("params"), Some(&json!({ "patch": "kb-5031" })));
    assert_eq!(context.get("resources"), Some(&json!(["web-01", "web-02"])));
}

#[test]
fn context_args_reject_malformed_pairs() {
    let err = parse_context_args(&["novalue".to_string()], &[]).expect_err("missing '='");
    assert!(err.to_string().contains("expected KEY=VALUE"));
    let err = parse_context_args(&["=x".to_string()], &[]).expect_err("empty key");
    assert!(err.to_string().contains("empty key"));
    let err = parse_context_args(&["resources=web-01".to_string()], &["web-02".to_string()])
        .expect_err("scalar resources cannot be extended");
    assert!(err.to_string().contains("must be a JSON array"));
}

// ---------------------------------------------------------------------------
// HTTP surface
// ---------------------------------------------------------------------------

fn router(h: &Harness, auth_token: Option<&str>) -> Router {
    build_server_router(Arc::new(ServerState {
        orchestrator: Arc::clone(&h.orchestrator),
        profile: "test".to_string(),
        auth_token: auth_token.map(str::to_string),
    }))
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>, token: Option<&str>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if body.is_some() {
        builder = builder.header("content-type", "application/json");
    }
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let request = builder
        .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
        .expect("request should build");
    let response = app.clone().oneshot(request).await.expect("router should respond");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should read")
        .to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("body should be json")
    };
    (status, json)
}

#[tokio::test]
async fn server_health_reports_schema_version() {
    let (h, _connector) = simulated(SimulatedConnector::default(), |b| b).await;
    let app = router(&h, Some("s3cret"));
    let (status, body) = call(&app, "GET", "/healthz", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["profile"], "test");
    assert_eq!(body["schema_version"], json!(SCHEMA_VERSION));
}

#[tokio::test]
async fn server_submit_and_decide_round_trip() {
    let (h, _connector) = simulated(SimulatedConnector::default(), |b| b).await;
    let app = router(&h, None);

    let (status, body) = call(
        &app,
        "POST",
        "/v1/tasks",
        Some(json!({
            "intent": "show drift on prod",
            "context": { "resources": ["web-01"] },
            "submitter": "alice",
        })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["task"]["status"], "completed");

    let (status, body) = call(
        &app,
        "POST",
        "/v1/tasks",
        Some(json!({
            "intent": "apply kernel patch to prod web fleet",
            "context": { "resources": fleet(4), "bake_secs": 0 },
            "submitter": "alice",
        })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["task"]["status"], "pending_approval");
    let task_id = body["task"]["id"].as_str().expect("task id").to_string();

    let (status, body) = call(
        &app,
        "POST",
        &format!("/v1/tasks/{task_id}/approve"),
        Some(json!({ "principal": "alice" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "ineligible_approver");
    assert!(body["error"].as_str().is_some());

    let (status, body) = call(
        &app,
        "POST",
        &format!("/v1/tasks/{task_id}/approve"),
        Some(json!({ "principal": "bob", "notes": "looks fine" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["verdict"]["verdict"], "pending");
    assert_eq!(body["recorded"], json!(true));

    let (status, body) = call(&app, "GET", &format!("/v1/tasks/{task_id}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["verdict"], json!({ "verdict": "pending", "approvals": 1, "required": 2 }));

    let (status, body) = call(&app, "GET", &format!("/v1/tasks/{task_id}/audit"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["events"].as_array().is_some_and(|events| !events.is_empty()));

    let (status, body) = call(
        &app,
        "POST",
        &format!("/v1/tasks/{task_id}/reject"),
        Some(json!({ "principal": "carol" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task"]["status"], "rejected");

    let (status, body) = call(
        &app,
        "POST",
        &format!("/v1/tasks/{task_id}/approve"),
        Some(json!({ "principal": "dave" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "invalid_transition");
}

#[tokio::test]
async fn server_maps_errors_to_json_bodies() {
    let (h, _connector) = simulated(SimulatedConnector::default(), |b| {
        b.policy(Arc::new(RulePolicyEvaluator::new(vec![PolicyRule {
            name: "no-patching".to_string(),
            reason: "patching is paused".to_string(),
            operations: vec!["patch.*".to_string()],
            environments: Vec::new(),
            min_risk: None,
            when_fact: None,
            max_targets: None,
        }])))
    })
    .await;
    let app = router(&h, None);

    let (status, body) = call(&app, "GET", "/v1/tasks/task-missing", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, body) = call(&app, "GET", "/v1/executions/exec-missing", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, body) = call(
        &app,
        "POST",
        "/v1/tasks",
        Some(json!({ "intent": "brew some coffee", "submitter": "alice" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "no_matching_agent");

    let (status, body) = call(
        &app,
        "POST",
        "/v1/tasks",
        Some(json!({
            "intent": "apply kernel patch to staging web fleet",
            "context": { "resources": fleet(2) },
            "submitter": "alice",
        })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "validation_violation");
    assert_eq!(body["submission"]["task"]["status"], "draft");
    assert!(body["error"].as_str().is_some_and(|e| e.contains("no-patching")));
}

#[tokio::test]
async fn server_requires_the_bearer_token_when_configured() {
    let (h, _connector) = simulated(SimulatedConnector::default(), |b| b).await;
    let app = router(&h, Some("s3cret"));
    let body = json!({
        "intent": "show drift on prod",
        "context": { "resources": ["web-01"] },
        "submitter": "alice",
    });

    let (status, response) = call(&app, "POST", "/v1/tasks", Some(body.clone()), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["code"], "unauthorized");

    let (status, _) = call(&app, "POST", "/v1/tasks", Some(body.clone()), Some("wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, response) = call(&app, "POST", "/v1/tasks", Some(body), Some("s3cret")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(response["task"]["status"], "completed");
}

#[tokio::test]
async fn server_controls_executions() {
    let (h, _connector) = simulated(SimulatedConnector::default(), |b| {
        b.agent_overrides(autonomy(AgentKind::Patch, AutonomyMode::FullAuto))
    })
    .await;
    let (task_id, _outcome) = staging_rollout(&h, 20, 600).await;
    let exec = execution_id(&h, &task_id).await;
    let app = router(&h, None);

    let (status, body) = call(
        &app,
        "POST",
        &format!("/v1/executions/{exec}/pause"),
        Some(json!({ "actor": "oncall" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["execution"]["status"], "paused");
    assert_eq!(body["advance"], json!({ "state": "paused", "phase": 1 }));

    let (status, body) = call(
        &app,
        "POST",
        &format!("/v1/executions/{exec}/approve-phase"),
        Some(json!({ "principal": "bob" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "invalid_transition");

    let (status, body) = call(
        &app,
        "POST",
        &format!("/v1/executions/{exec}/cancel"),
        Some(json!({ "actor": "oncall" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["execution"]["status"], "cancelled");

    let (status, body) = call(&app, "GET", &format!("/v1/executions/{exec}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["phases"][0]["status"], "rolled_back");
}
