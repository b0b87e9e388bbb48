/// Agent Registry.
///
/// Every specialist is a variant of [`AgentKind`] backed by a static
/// [`catalog::AgentProfile`]: trigger terms for intent matching, the
/// capability patterns it may use, a decision-sequence template, and rollout
/// guardrails. Agents never call each other; cross-specialist work is
/// expressed by composing two drafted plans into one parent plan.
///
/// - `catalog`: profiles, trigger tokenizing, declared compositions
/// - `planners`: the shared `plan()` implementation and per-kind target selection
/// - `rollout`: canary / batch / full wave splitting
pub mod catalog;
pub mod planners;
pub mod rollout;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use crate::capabilities::{Capability, CapabilityRegistry};
use crate::clock::Clock;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::model::{
    AutonomyMode, ContextMap, Environment, InvocationOutcome, PhaseSpec, RiskClass,
    ToolInvocation, aggregate_risk, new_id,
};
use crate::tool_policy::expand_patterns;

pub use catalog::{AgentKind, AgentProfile, DecisionStep, Guardrails};
pub use planners::SpecialistAgent;

/// Shared contract of every specialist.
pub trait Agent: Send + Sync {
    fn kind(&self) -> AgentKind;
    fn describe(&self) -> AgentDescription;
    fn authorized_tools(&self) -> &BTreeSet<String>;
    fn autonomy(&self) -> AutonomyMode;
    /// Drafts a plan. Every capability must be reached through `toolbox`,
    /// which refuses anything outside [`Agent::authorized_tools`].
    fn plan(&self, request: &PlanRequest<'_>, toolbox: &mut Toolbox<'_>) -> OrchestrationResult<PlanDraft>;
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentDescription {
    pub name: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    pub triggers: Vec<&'static str>,
    pub tools: Vec<String>,
    pub autonomy: AutonomyMode,
    pub guardrails: Guardrails,
}

#[derive(Debug, Clone)]
pub struct PlanRequest<'a> {
    pub task_id: &'a str,
    pub intent: &'a str,
    pub context: &'a ContextMap,
    pub environment: Environment,
    pub resources: Vec<String>,
}

/// A plan before scoring and validation.
#[derive(Debug, Clone, Serialize)]
pub struct PlanDraft {
    pub agent: String,
    pub phases: Vec<PhaseSpec>,
    pub affected_resources: Vec<String>,
    pub risk_class: RiskClass,
    pub rationale: String,
    pub autonomy: AutonomyMode,
    #[serde(skip)]
    pub invocations: Vec<ToolInvocation>,
}

// ---------------------------------------------------------------------------
// Toolbox: the only path from an agent to the capability registry
// ---------------------------------------------------------------------------

pub struct Toolbox<'a> {
    agent: AgentKind,
    authorized: &'a BTreeSet<String>,
    registry: &'a CapabilityRegistry,
    clock: &'a dyn Clock,
    task_id: String,
    invocations: Vec<ToolInvocation>,
}

impl<'a> Toolbox<'a> {
    pub fn new(
        agent: AgentKind,
        authorized: &'a BTreeSet<String>,
        registry: &'a CapabilityRegistry,
        clock: &'a dyn Clock,
        task_id: &str,
    ) -> Self {
        Self {
            agent,
            authorized,
            registry,
            clock,
            task_id: task_id.to_string(),
            invocations: Vec::new(),
        }
    }

    /// Resolves a capability the agent is allowed to use.
    pub fn authorize(&self, tool: &str) -> OrchestrationResult<&'a Capability> {
        if !self.authorized.contains(tool) {
            tracing::error!(
                task_id = %self.task_id,
                agent = self.agent.as_str(),
                tool = tool,
                "agent invoked a capability outside its authorized set"
            );
            return Err(OrchestrationError::UnauthorizedCapability {
                agent: self.agent.as_str().to_string(),
                tool: tool.to_string(),
            });
        }
        self.registry.require(tool)
    }

    /// Runs a pure capability and records the invocation.
    pub fn invoke(&mut self, tool: &str, input: Value) -> OrchestrationResult<Value> {
        let capability = self.authorize(tool)?;
        let started = Instant::now();
        let result = self.registry.evaluate(tool, &input);
        let duration_ms = started.elapsed().as_millis() as u64;
        let (outcome, output) = match &result {
            Ok(output) => (InvocationOutcome::Success, output.clone()),
            Err(err) => (
                InvocationOutcome::Error,
                serde_json::json!({ "error": err.to_string() }),
            ),
        };
        tracing::debug!(
            task_id = %self.task_id,
            agent = self.agent.as_str(),
            tool = tool,
            duration_ms = duration_ms,
            ok = result.is_ok(),
            "capability invoked during planning"
        );
        self.invocations.push(ToolInvocation {
            id: new_id("inv"),
            task_id: self.task_id.clone(),
            execution_id: None,
            tool: tool.to_string(),
            risk_class: capability.risk_class,
            input,
            output,
            duration_ms,
            outcome,
            created_at: self.clock.now(),
        });
        result
    }

    pub fn into_invocations(self) -> Vec<ToolInvocation> {
        self.invocations
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Per-agent adjustments from configuration.
#[derive(Debug, Clone, Default)]
pub struct AgentOverrides {
    pub autonomy: BTreeMap<AgentKind, AutonomyMode>,
    pub deny: BTreeMap<AgentKind, Vec<String>>,
}

/// Read-only after construction.
pub struct AgentRegistry {
    agents: BTreeMap<AgentKind, SpecialistAgent>,
}

impl AgentRegistry {
    pub fn new(capabilities: &CapabilityRegistry, overrides: &AgentOverrides) -> Self {
        let agents = AgentKind::ALL
            .into_iter()
            .map(|kind| {
                let profile = kind.profile();
                let extra_deny = overrides.deny.get(&kind).cloned().unwrap_or_default();
                let deny = profile
                    .deny
                    .iter()
                    .copied()
                    .chain(extra_deny.iter().map(String::as_str))
                    .collect::<Vec<&str>>();
                let tools = expand_patterns(capabilities.names(), profile.allow, &deny);
                let autonomy = overrides
                    .autonomy
                    .get(&kind)
                    .copied()
                    .unwrap_or(profile.autonomy);
                (kind, SpecialistAgent::new(profile, tools, autonomy))
            })
            .collect();
        Self { agents }
    }

    pub fn get(&self, kind: AgentKind) -> &dyn Agent {
        // Every kind is populated in `new`.
        match self.agents.get(&kind) {
            Some(agent) => agent,
            None => unreachable!("agent registry is built over AgentKind::ALL"),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Agent> {
        self.agents.values().map(|agent| agent as &dyn Agent)
    }

    /// Decision steps that reference a capability the agent cannot use, or
    /// a rollback the agent cannot reach.
    pub fn consistency_problems(&self, capabilities: &CapabilityRegistry) -> Vec<String> {
        let mut problems = Vec::new();
        for agent in self.agents.values() {
            let kind = agent.kind();
            let tools = agent.authorized_tools();
            for tool in planners::referenced_tools(kind.profile()) {
                if !tools.contains(tool) {
                    problems.push(format!("agent '{kind}' references unauthorized tool '{tool}'"));
                    continue;
                }
                if let Some(rollback) = capabilities.get(tool).and_then(|cap| cap.rollback)
                    && !tools.contains(rollback)
                {
                    problems.push(format!(
                        "agent '{kind}' can apply '{tool}' but not its rollback '{rollback}'"
                    ));
                }
            }
        }
        problems
    }
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

fn strictness(mode: AutonomyMode) -> u8 {
    match mode {
        AutonomyMode::Supervised => 2,
        AutonomyMode::CanaryOnly => 1,
        AutonomyMode::FullAuto => 0,
    }
}

/// Concatenates drafts into one parent plan. Phase names are prefixed with
/// the owning agent, affected resources are merged in first-seen order, and
/// the parent takes the highest risk and the strictest autonomy.
pub fn compose(drafts: Vec<PlanDraft>) -> PlanDraft {
    let agent = drafts
        .iter()
        .map(|draft| draft.agent.as_str())
        .collect::<Vec<&str>>()
        .join("+");
    let risk_class = aggregate_risk(drafts.iter().map(|draft| draft.risk_class));
    let autonomy = drafts
        .iter()
        .map(|draft| draft.autonomy)
        .max_by_key(|mode| strictness(*mode))
        .unwrap_or(AutonomyMode::Supervised);
    let rationale = drafts
        .iter()
        .map(|draft| format!("[{}] {}", draft.agent, draft.rationale))
        .collect::<Vec<String>>()
        .join("\n");

    let mut seen = BTreeSet::new();
    let mut affected_resources = Vec::new();
    let mut phases = Vec::new();
    let mut invocations = Vec::new();
    for draft in drafts {
        for resource in draft.affected_resources {
            if seen.insert(resource.clone()) {
                affected_resources.push(resource);
            }
        }
        for mut phase in draft.phases {
            phase.name = format!("{}/{}", draft.agent, phase.name);
            phases.push(phase);
        }
        invocations.extend(draft.invocations);
    }

    PlanDraft {
        agent,
        phases,
        affected_resources,
        risk_class,
        rationale,
        autonomy,
        invocations,
    }
}
