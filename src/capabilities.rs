//! Capability Registry: the closed catalog of named operations.
//!
//! Every capability declares a risk class and an input contract. Read-only and
//! plan-only capabilities carry a pure planning handler (input in, output out,
//! no side effects); state-changing capabilities are only ever applied to
//! resources through a [`crate::connector::Connector`] by the execution engine.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::{Value, json};

use crate::agents::rollout::split_rollout;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::model::RiskClass;
use crate::tool_policy::any_pattern_matches;

pub type PlanningHandler = fn(&Value) -> Result<Value, String>;

#[derive(Clone, Serialize)]
pub struct Capability {
    pub name: &'static str,
    pub risk_class: RiskClass,
    pub description: &'static str,
    pub required_inputs: &'static [&'static str],
    /// Capability that reverts this one, required for state-changing entries.
    pub rollback: Option<&'static str>,
    #[serde(skip)]
    pub handler: Option<PlanningHandler>,
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name)
            .field("risk_class", &self.risk_class)
            .field("rollback", &self.rollback)
            .finish()
    }
}

impl Capability {
    pub fn contract(&self) -> Value {
        json!({
            "name": self.name,
            "risk_class": self.risk_class,
            "required_inputs": self.required_inputs,
            "rollback": self.rollback,
            "pure": self.handler.is_some(),
        })
    }
}

const fn read(
    name: &'static str,
    description: &'static str,
    required_inputs: &'static [&'static str],
    handler: PlanningHandler,
) -> Capability {
    Capability {
        name,
        risk_class: RiskClass::ReadOnly,
        description,
        required_inputs,
        rollback: None,
        handler: Some(handler),
    }
}

const fn plan(
    name: &'static str,
    description: &'static str,
    handler: PlanningHandler,
) -> Capability {
    Capability {
        name,
        risk_class: RiskClass::PlanOnly,
        description,
        required_inputs: &["resources"],
        rollback: None,
        handler: Some(handler),
    }
}

const fn change(
    name: &'static str,
    risk_class: RiskClass,
    description: &'static str,
    rollback: Option<&'static str>,
) -> Capability {
    Capability {
        name,
        risk_class,
        description,
        required_inputs: &[],
        rollback,
        handler: None,
    }
}

use RiskClass::{StateChangeNonprod as NONPROD, StateChangeProd as PROD};

pub const BUILTIN_CAPABILITIES: &[Capability] = &[
    read("inventory.list_assets", "Lists in-scope resources, optionally filtered by a wildcard selector.", &["resources"], list_assets),
    read("drift.detect", "Compares observed configuration with the recorded baseline per resource.", &["resources"], detect_drift),
    change("drift.remediate_nonprod", NONPROD, "Reconciles drifted non-production resources to baseline.", Some("drift.restore_snapshot")),
    change("drift.remediate_prod", PROD, "Reconciles drifted production resources to baseline.", Some("drift.restore_snapshot")),
    change("drift.restore_snapshot", PROD, "Restores the pre-remediation configuration snapshot.", None),
    read("patch.assess", "Determines which resources are missing the requested patch.", &["resources"], assess_patch),
    plan("patch.plan_rollout", "Splits candidate resources into canary and batch waves.", plan_patch_rollout),
    change("patch.apply_nonprod", NONPROD, "Installs the patch on non-production resources.", Some("patch.rollback")),
    change("patch.apply_prod", PROD, "Installs the patch on production resources.", Some("patch.rollback")),
    change("patch.rollback", PROD, "Uninstalls the patch and restores the previous package set.", None),
    read("compliance.scan", "Evaluates resources against configured controls.", &["resources"], scan_compliance),
    plan("compliance.plan_remediation", "Drafts remediation steps for failed controls.", echo_plan),
    change("compliance.remediate_nonprod", NONPROD, "Applies control remediations to non-production resources.", Some("compliance.revert_remediation")),
    change("compliance.remediate_prod", PROD, "Applies control remediations to production resources.", Some("compliance.revert_remediation")),
    change("compliance.revert_remediation", PROD, "Reverts a control remediation.", None),
    read("incident.collect_signals", "Collects alerts and health signals for affected resources.", &["resources"], collect_signals),
    change("incident.restart_service_nonprod", NONPROD, "Restarts the failing service on non-production resources.", Some("incident.restore_service")),
    change("incident.restart_service_prod", PROD, "Restarts the failing service on production resources.", Some("incident.restore_service")),
    change("incident.restore_service", PROD, "Restores the service to its pre-restart state.", None),
    read("dr.check_readiness", "Checks replica and backup readiness for failover.", &["resources"], check_dr_readiness),
    plan("dr.plan_failover_drill", "Drafts a failover drill sequence.", echo_plan),
    change("dr.failover_nonprod", NONPROD, "Fails non-production workloads over to the standby site.", Some("dr.failback")),
    change("dr.failover_prod", PROD, "Fails production workloads over to the standby site.", Some("dr.failback")),
    change("dr.failback", PROD, "Returns workloads to the primary site.", None),
    read("cost.analyze", "Finds underutilized resources from utilization samples.", &["resources"], analyze_cost),
    plan("cost.plan_rightsizing", "Drafts rightsizing targets.", echo_plan),
    change("cost.resize_nonprod", NONPROD, "Resizes non-production resources.", Some("cost.restore_size")),
    change("cost.resize_prod", PROD, "Resizes production resources.", Some("cost.restore_size")),
    change("cost.restore_size", PROD, "Restores the previous resource size.", None),
    read("security.scan_vulnerabilities", "Lists known vulnerabilities per resource.", &["resources"], scan_vulnerabilities),
    change("security.rotate_credentials_nonprod", NONPROD, "Rotates credentials on non-production resources.", Some("security.restore_credentials")),
    change("security.rotate_credentials_prod", PROD, "Rotates credentials on production resources.", Some("security.restore_credentials")),
    change("security.restore_credentials", PROD, "Restores the previous credential version.", None),
    read("image.inspect", "Reports base image and age for each resource.", &["resources"], inspect_images),
    plan("image.plan_rebuild", "Drafts image rebuild targets.", echo_plan),
    change("image.rebuild_nonprod", NONPROD, "Rolls non-production resources onto a rebuilt image.", Some("image.restore_previous")),
    change("image.rebuild_prod", PROD, "Rolls production resources onto a rebuilt image.", Some("image.restore_previous")),
    change("image.restore_previous", PROD, "Rolls resources back to the previous image.", None),
    read("sop.lookup", "Finds the standard operating procedure for a topic.", &["topic"], lookup_sop),
    plan("sop.draft_runbook", "Drafts a runbook for the in-scope resources.", echo_plan),
    change("sop.execute_runbook_nonprod", NONPROD, "Executes a runbook against non-production resources.", Some("sop.revert_runbook")),
    change("sop.execute_runbook_prod", PROD, "Executes a runbook against production resources.", Some("sop.revert_runbook")),
    change("sop.revert_runbook", PROD, "Executes the runbook's documented revert steps.", None),
    read("adapter.describe_platform", "Describes the connector contract for a platform.", &["platform"], describe_platform),
    plan("adapter.plan_onboarding", "Drafts onboarding steps for a new platform connector.", echo_plan),
];

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Read-only after construction.
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    by_name: BTreeMap<&'static str, Capability>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl CapabilityRegistry {
    pub fn builtin() -> Self {
        Self::from_capabilities(BUILTIN_CAPABILITIES.iter().cloned())
    }

    pub fn from_capabilities(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            by_name: capabilities
                .into_iter()
                .map(|capability| (capability.name, capability))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.by_name.get(name)
    }

    pub fn require(&self, name: &str) -> OrchestrationResult<&Capability> {
        self.get(name).ok_or_else(|| OrchestrationError::NotFound {
            kind: "capability",
            id: name.to_string(),
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.by_name.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.by_name.values()
    }

    /// Every rollback reference points at a registered capability and every
    /// state-changing capability has one (directly or by being a revert).
    pub fn consistency_problems(&self) -> Vec<String> {
        let reverts = self
            .by_name
            .values()
            .filter_map(|capability| capability.rollback)
            .collect::<BTreeSet<&str>>();
        let mut problems = Vec::new();
        for capability in self.by_name.values() {
            if let Some(rollback) = capability.rollback
                && !self.by_name.contains_key(rollback)
            {
                problems.push(format!(
                    "capability '{}' references unknown rollback '{}'",
                    capability.name, rollback
                ));
            }
            if capability.risk_class.is_state_change()
                && capability.rollback.is_none()
                && !reverts.contains(capability.name)
            {
                problems.push(format!(
                    "state-changing capability '{}' has no rollback",
                    capability.name
                ));
            }
        }
        problems
    }

    pub fn check_input(&self, name: &str, input: &Value) -> OrchestrationResult<()> {
        let capability = self.require(name)?;
        let missing = capability
            .required_inputs
            .iter()
            .filter(|key| input.get(**key).is_none_or(Value::is_null))
            .copied()
            .collect::<Vec<&str>>();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(OrchestrationError::InvalidInput(format!(
                "capability '{}' is missing required input(s): {}",
                name,
                missing.join(", ")
            )))
        }
    }

    /// Runs a pure planning handler. State-changing capabilities have none.
    pub fn evaluate(&self, name: &str, input: &Value) -> OrchestrationResult<Value> {
        self.check_input(name, input)?;
        let capability = self.require(name)?;
        let handler = capability.handler.ok_or_else(|| {
            OrchestrationError::InvalidInput(format!(
                "capability '{name}' is state-changing and can only be applied through a connector"
            ))
        })?;
        handler(input).map_err(OrchestrationError::InvalidInput)
    }
}

// ---------------------------------------------------------------------------
// Pure planning handlers
// ---------------------------------------------------------------------------

fn resources_arg(input: &Value) -> Result<Vec<String>, String> {
    let Some(items) = input.get("resources").and_then(Value::as_array) else {
        return Err("'resources' must be an array of resource ids".to_string());
    };
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| "'resources' entries must be strings".to_string())
        })
        .collect()
}

fn per_resource<'a>(input: &'a Value, key: &str, resource: &str) -> Option<&'a Value> {
    input.get(key).and_then(|map| map.get(resource))
}

fn list_assets(input: &Value) -> Result<Value, String> {
    let resources = resources_arg(input)?;
    let selected = match input.get("selector").and_then(Value::as_str) {
        Some(selector) if !selector.trim().is_empty() => resources
            .into_iter()
            .filter(|id| any_pattern_matches(&[selector], id))
            .collect::<Vec<String>>(),
        _ => resources,
    };
    Ok(json!({ "resources": selected, "count": selected.len() }))
}

fn detect_drift(input: &Value) -> Result<Value, String> {
    let resources = resources_arg(input)?;
    let mut drifted = Vec::new();
    for resource in &resources {
        let baseline = per_resource(input, "baseline", resource);
        let observed = per_resource(input, "observed", resource);
        if let (Some(baseline), Some(observed)) = (baseline, observed)
            && baseline != observed
        {
            drifted.push(resource.clone());
        }
    }
    Ok(json!({ "checked": resources.len(), "drifted": drifted }))
}

fn assess_patch(input: &Value) -> Result<Value, String> {
    let resources = resources_arg(input)?;
    let patch = input
        .get("patch")
        .and_then(Value::as_str)
        .unwrap_or("latest-security-baseline");
    let candidates = resources
        .iter()
        .filter(|resource| {
            per_resource(input, "installed", resource)
                .and_then(Value::as_str)
                .is_none_or(|installed| installed != patch)
        })
        .cloned()
        .collect::<Vec<String>>();
    Ok(json!({ "patch": patch, "candidates": candidates }))
}

fn plan_patch_rollout(input: &Value) -> Result<Value, String> {
    let resources = resources_arg(input)?;
    let canary_size = input
        .get("canary_size")
        .and_then(Value::as_u64)
        .unwrap_or(1) as usize;
    let max_batch_fraction = input
        .get("max_batch_fraction")
        .and_then(Value::as_f64)
        .unwrap_or(0.25);
    let waves = split_rollout(&resources, canary_size, max_batch_fraction)
        .into_iter()
        .map(|wave| json!({ "name": wave.name, "targets": wave.targets, "percentage": wave.percentage }))
        .collect::<Vec<Value>>();
    Ok(json!({ "waves": waves }))
}

fn scan_compliance(input: &Value) -> Result<Value, String> {
    let resources = resources_arg(input)?;
    let failing = resources
        .iter()
        .filter(|resource| {
            per_resource(input, "findings", resource)
                .and_then(Value::as_array)
                .is_some_and(|findings| !findings.is_empty())
        })
        .cloned()
        .collect::<Vec<String>>();
    Ok(json!({ "checked": resources.len(), "non_compliant": failing }))
}

fn collect_signals(input: &Value) -> Result<Value, String> {
    let resources = resources_arg(input)?;
    let alerting = resources
        .iter()
        .filter(|resource| per_resource(input, "alerts", resource).is_some())
        .cloned()
        .collect::<Vec<String>>();
    Ok(json!({ "observed": resources.len(), "alerting": alerting }))
}

fn check_dr_readiness(input: &Value) -> Result<Value, String> {
    let resources = resources_arg(input)?;
    let (ready, not_ready): (Vec<String>, Vec<String>) = resources.into_iter().partition(|resource| {
        per_resource(input, "replica_lag_secs", resource)
            .and_then(Value::as_u64)
            .is_none_or(|lag| lag <= 60)
    });
    Ok(json!({ "ready": ready, "not_ready": not_ready }))
}

fn analyze_cost(input: &Value) -> Result<Value, String> {
    let resources = resources_arg(input)?;
    let underutilized = resources
        .iter()
        .filter(|resource| {
            per_resource(input, "utilization", resource)
                .and_then(Value::as_f64)
                .is_some_and(|pct| pct < 20.0)
        })
        .cloned()
        .collect::<Vec<String>>();
    Ok(json!({ "analyzed": resources.len(), "underutilized": underutilized }))
}

fn scan_vulnerabilities(input: &Value) -> Result<Value, String> {
    let resources = resources_arg(input)?;
    let affected = resources
        .iter()
        .filter_map(|resource| {
            per_resource(input, "vulnerabilities", resource)
                .and_then(Value::as_array)
                .filter(|cves| !cves.is_empty())
                .map(|cves| json!({ "resource": resource, "cves": cves }))
        })
        .collect::<Vec<Value>>();
    Ok(json!({ "scanned": resources.len(), "affected": affected }))
}

fn inspect_images(input: &Value) -> Result<Value, String> {
    let resources = resources_arg(input)?;
    let images = resources
        .iter()
        .map(|resource| {
            let image = per_resource(input, "images", resource)
                .cloned()
                .unwrap_or(Value::Null);
            json!({ "resource": resource, "image": image })
        })
        .collect::<Vec<Value>>();
    Ok(json!({ "images": images }))
}

fn lookup_sop(input: &Value) -> Result<Value, String> {
    let topic = input
        .get("topic")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|topic| !topic.is_empty())
        .ok_or_else(|| "'topic' must be a non-empty string".to_string())?;
    Ok(json!({ "topic": topic, "procedure": format!("sop/{}", topic.replace(' ', "-")) }))
}

fn describe_platform(input: &Value) -> Result<Value, String> {
    let platform = input
        .get("platform")
        .and_then(Value::as_str)
        .unwrap_or("generic");
    Ok(json!({
        "platform": platform,
        "contract": "apply(resource_id, operation, params) -> outcome",
        "health": "check(resource_id) -> healthy|unhealthy",
    }))
}

fn echo_plan(input: &Value) -> Result<Value, String> {
    let resources = resources_arg(input)?;
    Ok(json!({ "planned": resources, "steps": resources.len() }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_is_consistent() {
        let registry = CapabilityRegistry::builtin();
        assert!(
            registry.consistency_problems().is_empty(),
            "{:?}",
            registry.consistency_problems()
        );
    }

    #[test]
    fn state_changing_capabilities_have_no_pure_handler() {
        let registry = CapabilityRegistry::builtin();
        for capability in registry.iter() {
            assert_eq!(
                capability.handler.is_none(),
                capability.risk_class.is_state_change(),
                "{}",
                capability.name
            );
        }
    }

    #[test]
    fn missing_required_input_is_reported() {
        let registry = CapabilityRegistry::builtin();
        let err = registry
            .evaluate("drift.detect", &json!({}))
            .expect_err("resources are required");
        assert!(err.to_string().contains("resources"));
    }

    #[test]
    fn drift_detection_compares_baseline_and_observed() {
        let registry = CapabilityRegistry::builtin();
        let output = registry
            .evaluate(
                "drift.detect",
                &json!({
                    "resources": ["web-1", "web-2"],
                    "baseline": { "web-1": {"port": 443}, "web-2": {"port": 443} },
                    "observed": { "web-1": {"port": 443}, "web-2": {"port": 80} }
                }),
            )
            .expect("drift detection should succeed");
        assert_eq!(output["drifted"], json!(["web-2"]));
    }

    #[test]
    fn applying_state_change_through_registry_is_refused() {
        let registry = CapabilityRegistry::builtin();
        assert!(
            registry
                .evaluate("patch.apply_prod", &json!({ "resources": [] }))
                .is_err()
        );
    }
}
