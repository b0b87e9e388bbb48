//! Validation Pipeline: structural check plus policy evaluation.
use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capabilities::CapabilityRegistry;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::model::{ContextMap, Environment, Plan, RiskClass};
use crate::tool_policy::any_pattern_matches;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSource {
    Structural,
    Policy,
}

impl ViolationSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationSource::Structural => "structural",
            ViolationSource::Policy => "policy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub source: ViolationSource,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl Violation {
    fn structural(message: impl Into<String>, phase: Option<&str>) -> Self {
        Self {
            source: ViolationSource::Structural,
            message: message.into(),
            phase: phase.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub violations: Vec<Violation>,
}

impl ValidationResult {
    /// The error a failed result maps to: structural problems take
    /// precedence, a clean structure with policy denials is `PolicyDenied`.
    pub fn into_error(self) -> Option<OrchestrationError> {
        if self.passed {
            return None;
        }
        if self
            .violations
            .iter()
            .any(|violation| violation.source == ViolationSource::Structural)
        {
            return Some(OrchestrationError::ValidationViolation {
                violations: self.violations,
            });
        }
        Some(OrchestrationError::PolicyDenied {
            reasons: self
                .violations
                .into_iter()
                .map(|violation| violation.message)
                .collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Policy collaborator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allow: bool,
    pub reasons: Vec<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allow: true,
            reasons: Vec::new(),
        }
    }
}

/// Pure decision function over a plan and environment facts.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn evaluate(&self, plan: &Plan, facts: &ContextMap) -> OrchestrationResult<PolicyDecision>;
}

/// A deny rule. Every condition that is set must hold for the rule to fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyRule {
    pub name: String,
    pub reason: String,
    /// Wildcard patterns matched against phase operations.
    #[serde(default)]
    pub operations: Vec<String>,
    #[serde(default)]
    pub environments: Vec<Environment>,
    #[serde(default)]
    pub min_risk: Option<RiskClass>,
    /// Fact that must be truthy, e.g. `change_freeze`.
    #[serde(default)]
    pub when_fact: Option<String>,
    /// Fires when the plan touches more resources than this.
    #[serde(default)]
    pub max_targets: Option<usize>,
}

impl PolicyRule {
    pub fn denies(&self, plan: &Plan, facts: &ContextMap) -> bool {
        if !self.operations.is_empty()
            && !plan
                .phases
                .iter()
                .any(|phase| any_pattern_matches(&self.operations, &phase.operation))
        {
            return false;
        }
        if !self.environments.is_empty() {
            let environment = facts
                .get("environment")
                .and_then(Value::as_str)
                .and_then(Environment::parse);
            if !environment.is_some_and(|env| self.environments.contains(&env)) {
                return false;
            }
        }
        if let Some(min_risk) = self.min_risk
            && plan.risk_class < min_risk
        {
            return false;
        }
        if let Some(fact) = &self.when_fact
            && !facts.get(fact).is_some_and(is_truthy)
        {
            return false;
        }
        if let Some(max_targets) = self.max_targets
            && plan.affected_resources.len() <= max_targets
        {
            return false;
        }
        true
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => {
            let text = text.trim().to_ascii_lowercase();
            !text.is_empty() && text != "false" && text != "0" && text != "no"
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Null => false,
    }
}

#[derive(Debug, Clone, Default)]
pub struct RulePolicyEvaluator {
    pub rules: Vec<PolicyRule>,
}

impl RulePolicyEvaluator {
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl PolicyEvaluator for RulePolicyEvaluator {
    async fn evaluate(&self, plan: &Plan, facts: &ContextMap) -> OrchestrationResult<PolicyDecision> {
        let reasons = self
            .rules
            .iter()
            .filter(|rule| rule.denies(plan, facts))
            .map(|rule| format!("{}: {}", rule.name, rule.reason))
            .collect::<Vec<String>>();
        Ok(PolicyDecision {
            allow: reasons.is_empty(),
            reasons,
        })
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub fn structural_check(plan: &Plan, capabilities: &CapabilityRegistry) -> Vec<Violation> {
    let mut violations = Vec::new();
    if plan.phases.is_empty() {
        violations.push(Violation::structural("plan has no phases", None));
    }
    let mut names = BTreeSet::new();
    for phase in &plan.phases {
        let name = Some(phase.name.as_str());
        if !names.insert(phase.name.as_str()) {
            violations.push(Violation::structural(
                format!("phase name '{}' is used more than once", phase.name),
                name,
            ));
        }
        if phase.targets.is_empty() {
            violations.push(Violation::structural(
                format!("phase '{}' has an empty target set", phase.name),
                name,
            ));
        }
        if capabilities.get(&phase.operation).is_none() {
            violations.push(Violation::structural(
                format!("phase '{}' uses unknown operation '{}'", phase.name, phase.operation),
                name,
            ));
        }
        if phase.risk_class.is_state_change() {
            match phase.rollback_operation.as_deref() {
                None => violations.push(Violation::structural(
                    format!(
                        "phase '{}' is {} but declares no rollback operation",
                        phase.name, phase.risk_class
                    ),
                    name,
                )),
                Some(rollback) if capabilities.get(rollback).is_none() => {
                    violations.push(Violation::structural(
                        format!(
                            "phase '{}' references unknown rollback operation '{}'",
                            phase.name, rollback
                        ),
                        name,
                    ))
                }
                Some(_) => {}
            }
        }
    }
    violations
}

pub struct ValidationPipeline<'a> {
    pub capabilities: &'a CapabilityRegistry,
    pub policy: &'a dyn PolicyEvaluator,
}

impl ValidationPipeline<'_> {
    /// Runs the structural check, then the policy check. Both always run so
    /// the reviewer sees every violation at once.
    pub async fn validate(&self, plan: &Plan, facts: &ContextMap) -> OrchestrationResult<ValidationResult> {
        let mut violations = structural_check(plan, self.capabilities);
        let decision = self.policy.evaluate(plan, facts).await?;
        if !decision.allow {
            let reasons = if decision.reasons.is_empty() {
                vec!["policy evaluator denied the plan without a reason".to_string()]
            } else {
                decision.reasons
            };
            violations.extend(reasons.into_iter().map(|reason| Violation {
                source: ViolationSource::Policy,
                message: reason,
                phase: None,
            }));
        }
        tracing::debug!(
            plan_id = %plan.id,
            task_id = %plan.task_id,
            violations = violations.len(),
            "plan validated"
        );
        Ok(ValidationResult {
            passed: violations.is_empty(),
            violations,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::model::{AutonomyMode, PhaseSpec};
    use crate::quality::QualityScore;

    fn plan(phases: Vec<PhaseSpec>, risk_class: RiskClass) -> Plan {
        let affected = phases
            .iter()
            .flat_map(|phase| phase.targets.clone())
            .collect::<Vec<String>>();
        Plan {
            id: "plan-1".to_string(),
            task_id: "task-1".to_string(),
            agent: "patch".to_string(),
            phases,
            affected_resources: affected,
            risk_class,
            risk_score: 0,
            quality: QualityScore::uniform(90),
            rationale: "test".to_string(),
            autonomy: AutonomyMode::FullAuto,
            digest: String::new(),
            active: true,
            validated: false,
            created_at: Utc::now(),
        }
    }

    fn phase(name: &str, targets: &[&str], rollback: Option<&str>) -> PhaseSpec {
        PhaseSpec {
            name: name.to_string(),
            targets: targets.iter().map(|t| t.to_string()).collect(),
            target_percentage: 100,
            wait_secs: 0,
            operation: "patch.apply_prod".to_string(),
            params: Value::Null,
            rollback_operation: rollback.map(str::to_string),
            risk_class: RiskClass::StateChangeProd,
        }
    }

    fn pipeline_eval(rules: Vec<PolicyRule>) -> RulePolicyEvaluator {
        RulePolicyEvaluator::new(rules)
    }

    #[tokio::test]
    async fn structural_violations_cover_empty_targets_and_missing_rollback() {
        let capabilities = CapabilityRegistry::builtin();
        let policy = pipeline_eval(Vec::new());
        let pipeline = ValidationPipeline {
            capabilities: &capabilities,
            policy: &policy,
        };
        let candidate = plan(
            vec![phase("canary", &[], Some("patch.rollback")), phase("full", &["a"], None)],
            RiskClass::StateChangeProd,
        );
        let result = pipeline
            .validate(&candidate, &ContextMap::new())
            .await
            .expect("validation runs");
        assert!(!result.passed);
        assert_eq!(result.violations.len(), 2);
        assert!(matches!(
            result.into_error(),
            Some(OrchestrationError::ValidationViolation { .. })
        ));
    }

    #[tokio::test]
    async fn empty_plan_is_rejected() {
        let capabilities = CapabilityRegistry::builtin();
        let policy = pipeline_eval(Vec::new());
        let pipeline = ValidationPipeline {
            capabilities: &capabilities,
            policy: &policy,
        };
        let result = pipeline
            .validate(&plan(Vec::new(), RiskClass::ReadOnly), &ContextMap::new())
            .await
            .expect("validation runs");
        assert_eq!(result.violations[0].message, "plan has no phases");
    }

    #[tokio::test]
    async fn freeze_rule_denies_prod_changes_only_while_the_fact_is_set() {
        let capabilities = CapabilityRegistry::builtin();
        let policy = pipeline_eval(vec![PolicyRule {
            name: "change-freeze".to_string(),
            reason: "production changes are frozen".to_string(),
            operations: vec!["*_prod".to_string()],
            environments: vec![Environment::Prod],
            min_risk: Some(RiskClass::StateChangeNonprod),
            when_fact: Some("change_freeze".to_string()),
            max_targets: None,
        }]);
        let pipeline = ValidationPipeline {
            capabilities: &capabilities,
            policy: &policy,
        };
        let candidate = plan(
            vec![phase("full", &["a"], Some("patch.rollback"))],
            RiskClass::StateChangeProd,
        );
        let mut facts = ContextMap::new();
        facts.insert("environment".to_string(), json!("prod"));

        let open = pipeline.validate(&candidate, &facts).await.expect("runs");
        assert!(open.passed);

        facts.insert("change_freeze".to_string(), json!(true));
        let frozen = pipeline.validate(&candidate, &facts).await.expect("runs");
        assert!(!frozen.passed);
        match frozen.into_error() {
            Some(OrchestrationError::PolicyDenied { reasons }) => {
                assert_eq!(reasons, vec!["change-freeze: production changes are frozen".to_string()]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rules_parse_from_toml() {
        let rule: PolicyRule = toml::from_str(
            r#"
name = "blast-radius"
reason = "too many hosts in one change"
max_targets = 50
environments = ["prod"]
"#,
        )
        .expect("rule should parse");
        assert_eq!(rule.max_targets, Some(50));
        assert_eq!(rule.environments, vec![Environment::Prod]);
    }
}
