/// Static agent profiles: trigger terms, tool patterns, decision templates
/// and rollout guardrails for each specialist.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::AutonomyMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Drift,
    Patch,
    Compliance,
    Incident,
    Dr,
    Cost,
    Security,
    Image,
    Sop,
    Adapter,
}

impl AgentKind {
    pub const ALL: [AgentKind; 10] = [
        AgentKind::Drift,
        AgentKind::Patch,
        AgentKind::Compliance,
        AgentKind::Incident,
        AgentKind::Dr,
        AgentKind::Cost,
        AgentKind::Security,
        AgentKind::Image,
        AgentKind::Sop,
        AgentKind::Adapter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Drift => "drift",
            AgentKind::Patch => "patch",
            AgentKind::Compliance => "compliance",
            AgentKind::Incident => "incident",
            AgentKind::Dr => "dr",
            AgentKind::Cost => "cost",
            AgentKind::Security => "security",
            AgentKind::Image => "image",
            AgentKind::Sop => "sop",
            AgentKind::Adapter => "adapter",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        AgentKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
    }

    pub fn profile(self) -> &'static AgentProfile {
        match self {
            AgentKind::Drift => &DRIFT,
            AgentKind::Patch => &PATCH,
            AgentKind::Compliance => &COMPLIANCE,
            AgentKind::Incident => &INCIDENT,
            AgentKind::Dr => &DR,
            AgentKind::Cost => &COST,
            AgentKind::Security => &SECURITY,
            AgentKind::Image => &IMAGE,
            AgentKind::Sop => &SOP,
            AgentKind::Adapter => &ADAPTER,
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent pairs that may be composed into one parent plan when an intent
/// matches both equally. The first member's phases run first.
pub const COMPOSITIONS: &[(AgentKind, AgentKind)] = &[
    (AgentKind::Drift, AgentKind::Patch),
    (AgentKind::Security, AgentKind::Patch),
    (AgentKind::Compliance, AgentKind::Patch),
];

pub fn composition_for(a: AgentKind, b: AgentKind) -> Option<(AgentKind, AgentKind)> {
    COMPOSITIONS
        .iter()
        .copied()
        .find(|(first, second)| (*first == a && *second == b) || (*first == b && *second == a))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Guardrails {
    pub canary_size: usize,
    pub max_batch_fraction: f64,
    /// Default bake time after each non-final wave.
    pub bake_secs: u64,
}

const STANDARD: Guardrails = Guardrails {
    canary_size: 2,
    max_batch_fraction: 0.25,
    bake_secs: 300,
};

/// Intent-term condition on a decision step. Empty `any_of` always holds.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct When {
    pub any_of: &'static [&'static str],
    pub none_of: &'static [&'static str],
}

pub const ALWAYS: When = When {
    any_of: &[],
    none_of: &[],
};

const fn when(any_of: &'static [&'static str], none_of: &'static [&'static str]) -> When {
    When { any_of, none_of }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum DecisionStep {
    /// Call a pure read-only or plan-only capability while planning.
    Evaluate { tool: &'static str, when: When },
    /// Author state-changing waves using the environment's capability.
    Rollout {
        nonprod: &'static str,
        prod: &'static str,
        when: When,
    },
    /// Author a single plan-only phase.
    Draft { tool: &'static str, when: When },
}

#[derive(Debug, Serialize)]
pub struct AgentProfile {
    pub kind: AgentKind,
    pub version: &'static str,
    pub description: &'static str,
    pub triggers: &'static [&'static str],
    pub allow: &'static [&'static str],
    pub deny: &'static [&'static str],
    pub steps: &'static [DecisionStep],
    pub guardrails: Guardrails,
    pub autonomy: AutonomyMode,
}

const REPORT_ONLY: &[&str] = &["show", "list", "report", "check", "assess", "which", "what"];

pub static DRIFT: AgentProfile = AgentProfile {
    kind: AgentKind::Drift,
    version: "1.2.0",
    description: "Detects configuration drift against the recorded baseline and reconciles it.",
    triggers: &["drift", "drifted", "baseline", "configuration drift", "out of sync"],
    allow: &["inventory.*", "drift.*"],
    deny: &[],
    steps: &[
        DecisionStep::Evaluate { tool: "inventory.list_assets", when: ALWAYS },
        DecisionStep::Evaluate { tool: "drift.detect", when: ALWAYS },
        DecisionStep::Rollout {
            nonprod: "drift.remediate_nonprod",
            prod: "drift.remediate_prod",
            when: when(&["fix", "remediate", "reconcile", "correct", "restore"], REPORT_ONLY),
        },
    ],
    guardrails: STANDARD,
    autonomy: AutonomyMode::CanaryOnly,
};

pub static PATCH: AgentProfile = AgentProfile {
    kind: AgentKind::Patch,
    version: "2.0.1",
    description: "Assesses missing patches and rolls them out in canary-first waves.",
    triggers: &["patch", "patches", "patching", "hotfix", "kernel", "upgrade", "update"],
    allow: &["inventory.*", "patch.*"],
    deny: &[],
    steps: &[
        DecisionStep::Evaluate { tool: "inventory.list_assets", when: ALWAYS },
        DecisionStep::Evaluate { tool: "patch.assess", when: ALWAYS },
        DecisionStep::Rollout {
            nonprod: "patch.apply_nonprod",
            prod: "patch.apply_prod",
            when: when(&[], &["plan", "schedule", "show", "list", "report", "check", "assess", "which"]),
        },
        DecisionStep::Draft {
            tool: "patch.plan_rollout",
            when: when(&["plan", "schedule"], &[]),
        },
    ],
    guardrails: STANDARD,
    autonomy: AutonomyMode::CanaryOnly,
};

pub static COMPLIANCE: AgentProfile = AgentProfile {
    kind: AgentKind::Compliance,
    version: "1.4.0",
    description: "Scans resources against configured controls and remediates failures.",
    triggers: &["compliance", "compliant", "cis", "control", "controls", "benchmark", "hardening"],
    allow: &["inventory.*", "compliance.*"],
    deny: &[],
    steps: &[
        DecisionStep::Evaluate { tool: "compliance.scan", when: ALWAYS },
        DecisionStep::Rollout {
            nonprod: "compliance.remediate_nonprod",
            prod: "compliance.remediate_prod",
            when: when(&["remediate", "fix", "enforce"], &["plan"]),
        },
        DecisionStep::Draft {
            tool: "compliance.plan_remediation",
            when: when(&["plan"], &[]),
        },
    ],
    guardrails: STANDARD,
    autonomy: AutonomyMode::CanaryOnly,
};

pub static INCIDENT: AgentProfile = AgentProfile {
    kind: AgentKind::Incident,
    version: "1.1.0",
    description: "Collects incident signals and restarts failing services.",
    triggers: &["incident", "outage", "alert", "alerts", "degraded", "restart"],
    allow: &["inventory.*", "incident.*"],
    deny: &[],
    steps: &[
        DecisionStep::Evaluate { tool: "incident.collect_signals", when: ALWAYS },
        DecisionStep::Rollout {
            nonprod: "incident.restart_service_nonprod",
            prod: "incident.restart_service_prod",
            when: when(&["restart", "recover", "mitigate"], REPORT_ONLY),
        },
    ],
    guardrails: Guardrails {
        canary_size: 1,
        max_batch_fraction: 0.5,
        bake_secs: 120,
    },
    autonomy: AutonomyMode::CanaryOnly,
};

pub static DR: AgentProfile = AgentProfile {
    kind: AgentKind::Dr,
    version: "1.0.3",
    description: "Checks disaster-recovery readiness and drives failover drills.",
    triggers: &["disaster", "failover", "failback", "recovery", "standby", "dr"],
    allow: &["inventory.*", "dr.*"],
    deny: &[],
    steps: &[
        DecisionStep::Evaluate { tool: "dr.check_readiness", when: ALWAYS },
        DecisionStep::Rollout {
            nonprod: "dr.failover_nonprod",
            prod: "dr.failover_prod",
            when: when(&["failover", "fail over"], &["drill", "plan", "check", "readiness"]),
        },
        DecisionStep::Draft {
            tool: "dr.plan_failover_drill",
            when: when(&["drill", "plan"], &[]),
        },
    ],
    guardrails: Guardrails {
        canary_size: 1,
        max_batch_fraction: 0.25,
        bake_secs: 900,
    },
    autonomy: AutonomyMode::Supervised,
};

pub static COST: AgentProfile = AgentProfile {
    kind: AgentKind::Cost,
    version: "1.3.0",
    description: "Finds underutilized resources and rightsizes them.",
    triggers: &["cost", "costs", "spend", "rightsize", "rightsizing", "underutilized", "savings"],
    allow: &["inventory.*", "cost.*"],
    deny: &[],
    steps: &[
        DecisionStep::Evaluate { tool: "cost.analyze", when: ALWAYS },
        DecisionStep::Rollout {
            nonprod: "cost.resize_nonprod",
            prod: "cost.resize_prod",
            when: when(&["resize", "rightsize", "downsize"], &["plan", "recommend"]),
        },
        DecisionStep::Draft {
            tool: "cost.plan_rightsizing",
            when: when(&["plan", "recommend", "savings"], &[]),
        },
    ],
    guardrails: STANDARD,
    autonomy: AutonomyMode::CanaryOnly,
};

pub static SECURITY: AgentProfile = AgentProfile {
    kind: AgentKind::Security,
    version: "1.5.2",
    description: "Scans for vulnerabilities and rotates exposed credentials.",
    triggers: &["security", "vulnerability", "vulnerabilities", "cve", "credential", "credentials", "exposure"],
    allow: &["inventory.*", "security.*"],
    deny: &[],
    steps: &[
        DecisionStep::Evaluate { tool: "security.scan_vulnerabilities", when: ALWAYS },
        DecisionStep::Rollout {
            nonprod: "security.rotate_credentials_nonprod",
            prod: "security.rotate_credentials_prod",
            when: when(&["rotate"], REPORT_ONLY),
        },
    ],
    guardrails: STANDARD,
    autonomy: AutonomyMode::CanaryOnly,
};

pub static IMAGE: AgentProfile = AgentProfile {
    kind: AgentKind::Image,
    version: "1.0.0",
    description: "Inspects base images and rolls resources onto rebuilt images.",
    triggers: &["image", "images", "ami", "golden image", "base image", "rebuild"],
    allow: &["inventory.*", "image.*"],
    deny: &[],
    steps: &[
        DecisionStep::Evaluate { tool: "image.inspect", when: ALWAYS },
        DecisionStep::Rollout {
            nonprod: "image.rebuild_nonprod",
            prod: "image.rebuild_prod",
            when: when(&["rebuild", "refresh", "roll"], &["plan"]),
        },
        DecisionStep::Draft {
            tool: "image.plan_rebuild",
            when: when(&["plan"], &[]),
        },
    ],
    guardrails: STANDARD,
    autonomy: AutonomyMode::CanaryOnly,
};

pub static SOP: AgentProfile = AgentProfile {
    kind: AgentKind::Sop,
    version: "1.0.0",
    description: "Looks up standard operating procedures and executes runbooks.",
    triggers: &["sop", "runbook", "runbooks", "procedure", "playbook"],
    allow: &["inventory.*", "sop.*"],
    deny: &[],
    steps: &[
        DecisionStep::Evaluate { tool: "sop.lookup", when: ALWAYS },
        DecisionStep::Rollout {
            nonprod: "sop.execute_runbook_nonprod",
            prod: "sop.execute_runbook_prod",
            when: when(&["execute", "run"], &["draft", "write"]),
        },
        DecisionStep::Draft {
            tool: "sop.draft_runbook",
            when: when(&["draft", "write", "create"], &[]),
        },
    ],
    guardrails: STANDARD,
    autonomy: AutonomyMode::Supervised,
};

pub static ADAPTER: AgentProfile = AgentProfile {
    kind: AgentKind::Adapter,
    version: "0.9.0",
    description: "Describes platform connector contracts and plans onboarding of new platforms.",
    triggers: &["adapter", "connector", "onboard", "integration", "platform"],
    allow: &["inventory.*", "adapter.*"],
    deny: &[],
    steps: &[
        DecisionStep::Evaluate { tool: "adapter.describe_platform", when: ALWAYS },
        DecisionStep::Draft {
            tool: "adapter.plan_onboarding",
            when: when(&["onboard", "add", "integrate"], &[]),
        },
    ],
    guardrails: STANDARD,
    autonomy: AutonomyMode::Supervised,
};

/// Lowercase alphanumeric tokens of `text`.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_ascii_lowercase())
        .collect()
}

/// Whether `phrase` (one or more words) occurs as a contiguous token run.
pub fn mentions(tokens: &[String], phrase: &str) -> bool {
    let words = tokenize(phrase);
    if words.is_empty() || words.len() > tokens.len() {
        return false;
    }
    tokens.windows(words.len()).any(|window| window == words.as_slice())
}

impl When {
    pub fn holds(&self, tokens: &[String]) -> bool {
        let wanted = self.any_of.is_empty() || self.any_of.iter().any(|term| mentions(tokens, term));
        wanted && !self.none_of.iter().any(|term| mentions(tokens, term))
    }
}
