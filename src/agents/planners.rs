use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value, json};

use super::catalog::{AgentKind, AgentProfile, DecisionStep, tokenize};
use super::rollout::split_rollout;
use super::{Agent, AgentDescription, PlanDraft, PlanRequest, Toolbox};
use crate::error::OrchestrationResult;
use crate::model::{AutonomyMode, Environment, PhaseSpec, RiskClass, aggregate_risk};

pub struct SpecialistAgent {
    profile: &'static AgentProfile,
    tools: BTreeSet<String>,
    autonomy: AutonomyMode,
}

impl SpecialistAgent {
    pub fn new(profile: &'static AgentProfile, tools: BTreeSet<String>, autonomy: AutonomyMode) -> Self {
        Self {
            profile,
            tools,
            autonomy,
        }
    }
}

/// Every capability name a profile's decision template can reach.
pub fn referenced_tools(profile: &AgentProfile) -> Vec<&'static str> {
    profile
        .steps
        .iter()
        .flat_map(|step| match step {
            DecisionStep::Evaluate { tool, .. } | DecisionStep::Draft { tool, .. } => vec![*tool],
            DecisionStep::Rollout { nonprod, prod, .. } => vec![*nonprod, *prod],
        })
        .collect()
}

impl Agent for SpecialistAgent {
    fn kind(&self) -> AgentKind {
        self.profile.kind
    }

    fn describe(&self) -> AgentDescription {
        AgentDescription {
            name: self.profile.kind.as_str(),
            version: self.profile.version,
            description: self.profile.description,
            triggers: self.profile.triggers.to_vec(),
            tools: self.tools.iter().cloned().collect(),
            autonomy: self.autonomy,
            guardrails: self.profile.guardrails,
        }
    }

    fn authorized_tools(&self) -> &BTreeSet<String> {
        &self.tools
    }

    fn autonomy(&self) -> AutonomyMode {
        self.autonomy
    }

    fn plan(&self, request: &PlanRequest<'_>, toolbox: &mut Toolbox<'_>) -> OrchestrationResult<PlanDraft> {
        let kind = self.profile.kind;
        let tokens = tokenize(request.intent);
        let input = evaluation_input(request);

        let mut outputs = BTreeMap::<&'static str, Value>::new();
        let mut used = Vec::<RiskClass>::new();
        let mut last_evaluated = None;
        for step in self.profile.steps {
            if let DecisionStep::Evaluate { tool, when } = step
                && when.holds(&tokens)
            {
                let output = toolbox.invoke(tool, input.clone())?;
                used.push(toolbox.authorize(tool)?.risk_class);
                outputs.insert(*tool, output);
                last_evaluated = Some(*tool);
            }
        }

        let targets = select_targets(kind, request, &outputs);
        let params = phase_params(kind, request);
        let guardrails = self.profile.guardrails;
        let bake_secs = request
            .context
            .get("bake_secs")
            .and_then(Value::as_u64)
            .unwrap_or(guardrails.bake_secs);

        let rollout = self.profile.steps.iter().find_map(|step| match step {
            DecisionStep::Rollout { nonprod, prod, when } if when.holds(&tokens) => {
                Some(match request.environment {
                    Environment::Prod => *prod,
                    Environment::Nonprod => *nonprod,
                })
            }
            _ => None,
        });
        let draft = self.profile.steps.iter().find_map(|step| match step {
            DecisionStep::Draft { tool, when } if when.holds(&tokens) => Some(*tool),
            _ => None,
        });

        let mut phases = Vec::new();
        let rationale;
        if let Some(tool) = rollout.filter(|_| !targets.is_empty()) {
            let capability = toolbox.authorize(tool)?;
            let rollback = match capability.rollback {
                Some(rollback) => Some(toolbox.authorize(rollback)?.name.to_string()),
                None => None,
            };
            used.push(capability.risk_class);
            let waves = split_rollout(&targets, guardrails.canary_size, guardrails.max_batch_fraction);
            let wave_count = waves.len();
            for (index, wave) in waves.into_iter().enumerate() {
                phases.push(PhaseSpec {
                    name: wave.name.to_string(),
                    targets: wave.targets,
                    target_percentage: wave.percentage,
                    wait_secs: if index + 1 == wave_count { 0 } else { bake_secs },
                    operation: tool.to_string(),
                    params: params.clone(),
                    rollback_operation: rollback.clone(),
                    risk_class: capability.risk_class,
                });
            }
            rationale = format!(
                "{} {} resource(s) in {} {} wave(s) via {}; each wave is health-gated and reverted with {} on failure.",
                capability.description.trim_end_matches('.'),
                targets.len(),
                wave_count,
                request.environment.as_str(),
                tool,
                rollback.as_deref().unwrap_or("no rollback"),
            );
        } else if let Some(tool) = draft.filter(|_| !targets.is_empty()) {
            let mut draft_input = input.clone();
            if let Some(object) = draft_input.as_object_mut() {
                object.insert("resources".to_string(), json!(targets));
            }
            toolbox.invoke(tool, draft_input)?;
            let capability = toolbox.authorize(tool)?;
            used.push(capability.risk_class);
            phases.push(single_phase("draft", tool, &targets, params, capability.risk_class));
            rationale = format!(
                "{} for {} resource(s); no resource is changed.",
                capability.description.trim_end_matches('.'),
                targets.len()
            );
        } else {
            let tool = last_evaluated.unwrap_or("inventory.list_assets");
            let risk_class = toolbox.authorize(tool)?.risk_class;
            let report_targets = if request.resources.is_empty() {
                targets
            } else {
                request.resources.clone()
            };
            phases.push(single_phase("report", tool, &report_targets, params, risk_class));
            rationale = if rollout.is_some() {
                format!(
                    "Nothing to change: {} found no eligible resources; reporting current state.",
                    tool
                )
            } else {
                format!(
                    "Read-only report via {} over {} resource(s).",
                    tool,
                    report_targets.len()
                )
            };
        }

        let affected_resources = {
            let mut seen = BTreeSet::new();
            phases
                .iter()
                .flat_map(|phase| phase.targets.iter())
                .filter(|resource| seen.insert(resource.as_str()))
                .cloned()
                .collect::<Vec<String>>()
        };

        Ok(PlanDraft {
            agent: kind.as_str().to_string(),
            phases,
            affected_resources,
            risk_class: aggregate_risk(used),
            rationale,
            autonomy: self.autonomy,
            invocations: Vec::new(),
        })
    }
}

fn single_phase(name: &str, tool: &str, targets: &[String], params: Value, risk_class: RiskClass) -> PhaseSpec {
    PhaseSpec {
        name: name.to_string(),
        targets: targets.to_vec(),
        target_percentage: 100,
        wait_secs: 0,
        operation: tool.to_string(),
        params,
        rollback_operation: None,
        risk_class,
    }
}

/// Input for pure capabilities: the context, plus the resource list and
/// defaults for the keys some capabilities require.
pub fn evaluation_input(request: &PlanRequest<'_>) -> Value {
    let mut object = request
        .context
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect::<Map<String, Value>>();
    object.insert("resources".to_string(), json!(request.resources));
    object.insert("environment".to_string(), json!(request.environment.as_str()));
    object
        .entry("topic".to_string())
        .or_insert_with(|| json!(request.intent));
    object
        .entry("platform".to_string())
        .or_insert_with(|| json!("generic"));
    Value::Object(object)
}

fn phase_params(kind: AgentKind, request: &PlanRequest<'_>) -> Value {
    let mut params = request
        .context
        .get("params")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    params.insert("agent".to_string(), json!(kind.as_str()));
    params.insert("environment".to_string(), json!(request.environment.as_str()));
    Value::Object(params)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    item.as_str()
                        .or_else(|| item.get("resource").and_then(Value::as_str))
                        .map(str::to_string)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Narrows the request's resources to the ones the agent's evaluations found
/// actionable. Without observation data in the context, every in-scope
/// resource is a target.
fn select_targets(kind: AgentKind, request: &PlanRequest<'_>, outputs: &BTreeMap<&'static str, Value>) -> Vec<String> {
    let pick = |tool: &str, key: &str, evidence: &str| -> Vec<String> {
        if !request.context.contains_key(evidence) {
            return request.resources.clone();
        }
        string_list(outputs.get(tool).and_then(|output| output.get(key)))
    };
    match kind {
        AgentKind::Drift => pick("drift.detect", "drifted", "baseline"),
        AgentKind::Patch => string_list(
            outputs
                .get("patch.assess")
                .and_then(|output| output.get("candidates")),
        ),
        AgentKind::Compliance => pick("compliance.scan", "non_compliant", "findings"),
        AgentKind::Incident => pick("incident.collect_signals", "alerting", "alerts"),
        AgentKind::Dr => string_list(
            outputs
                .get("dr.check_readiness")
                .and_then(|output| output.get("ready")),
        ),
        AgentKind::Cost => pick("cost.analyze", "underutilized", "utilization"),
        AgentKind::Security => pick("security.scan_vulnerabilities", "affected", "vulnerabilities"),
        AgentKind::Image | AgentKind::Sop | AgentKind::Adapter => request.resources.clone(),
    }
}
