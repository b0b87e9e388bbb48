use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::agents::{AgentKind, AgentOverrides};
use crate::approval::ApprovalPolicy;
use crate::cli::{Cli, ConnectorKind};
use crate::clock::SystemClock;
use crate::connector::{
    COMMAND_DEFAULT_RETRY_ATTEMPTS, COMMAND_DEFAULT_RETRY_DELAY_MS, COMMAND_DEFAULT_TIMEOUT_SECS,
    CommandConnector, SimulatedConnector, SimulatedFault,
};
use crate::executor::{
    DEFAULT_AUTO_ROLLBACK_THRESHOLD, DEFAULT_EXECUTION_TIMEOUT_SECS, DEFAULT_FAN_OUT_LIMIT,
    ExecutorSettings,
};
use crate::guardrail::{DEFAULT_REDACT_REPLACEMENT, GuardrailMode, IntentGuardrail, default_guardrail_terms};
use crate::itsm::{ChangeRecords, JournalChangeRecords, NoopChangeRecords};
use crate::model::{AutonomyMode, ContextMap};
use crate::notify::build_notifier;
use crate::orchestrator::{DEFAULT_APPROVAL_TIMEOUT_SECS, Orchestrator, OrchestratorSettings};
use crate::store::Store;
use crate::validation::{PolicyRule, RulePolicyEvaluator};

pub const DEFAULT_STORE_URL: &str = "sqlite://.changegate/state.db";
pub const DEFAULT_NOTIFY_PATH: &str = ".changegate/notifications.jsonl";
pub const DEFAULT_MAX_INTENT_CHARS: usize = 8000;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub profile: String,
    pub config_path: String,
    pub store_url: String,
    pub show_sensitive_config: bool,
    pub approval_timeout_secs: u64,
    pub execution_timeout_secs: u64,
    pub auto_rollback_threshold: f64,
    pub fan_out_limit: usize,
    pub plan_only_min_quality: u32,
    pub prod_min_quality: u32,
    pub approvers: Vec<String>,
    pub revalidate_after_pause_secs: Option<u64>,
    pub max_intent_chars: usize,
    pub intent_guardrail_mode: GuardrailMode,
    pub guardrail_terms: Vec<String>,
    pub notify_enabled: bool,
    pub notify_path: String,
    pub connector: ConnectorKind,
    pub apply_command: Option<String>,
    pub health_command: Option<String>,
    pub command_timeout_secs: u64,
    pub command_retry_attempts: u32,
    pub command_retry_delay_ms: u64,
    pub simulated_faults: Vec<SimulatedFault>,
    pub itsm_journal_path: Option<String>,
    pub sweep_interval_secs: u64,
    pub policy_rules: Vec<PolicyRule>,
    pub facts: ContextMap,
    pub agent_autonomy: BTreeMap<AgentKind, AutonomyMode>,
    pub agent_tool_deny: BTreeMap<AgentKind, Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub store_url: Option<String>,
    pub approval_timeout_secs: Option<u64>,
    pub execution_timeout_secs: Option<u64>,
    pub auto_rollback_threshold: Option<f64>,
    pub fan_out_limit: Option<usize>,
    pub plan_only_min_quality: Option<u32>,
    pub prod_min_quality: Option<u32>,
    #[serde(default)]
    pub approvers: Vec<String>,
    pub revalidate_after_pause_secs: Option<u64>,
    pub max_intent_chars: Option<usize>,
    pub intent_guardrail_mode: Option<GuardrailMode>,
    #[serde(default)]
    pub guardrail_terms: Vec<String>,
    pub notify_enabled: Option<bool>,
    pub notify_path: Option<String>,
    pub connector: Option<ConnectorKind>,
    pub apply_command: Option<String>,
    pub health_command: Option<String>,
    pub command_timeout_secs: Option<u64>,
    pub command_retry_attempts: Option<u32>,
    pub command_retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub simulated_faults: Vec<SimulatedFault>,
    pub itsm_journal_path: Option<String>,
    pub sweep_interval_secs: Option<u64>,
    #[serde(default)]
    pub policy_rules: Vec<PolicyRule>,
    #[serde(default)]
    pub facts: ContextMap,
    #[serde(default)]
    pub agent_autonomy: BTreeMap<String, AutonomyMode>,
    #[serde(default)]
    pub agent_tool_deny: BTreeMap<String, Vec<String>>,
}

pub fn load_profiles(config_path: &str) -> Result<ProfilesFile> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(ProfilesFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile config file at '{}'", path.display()))?;
    toml::from_str::<ProfilesFile>(&content).with_context(|| {
        format!(
            "invalid profile configuration in '{}'. Check connector/guardrail values, policy rule tables and field names.",
            path.display()
        )
    })
}

fn merge_unique_names(first: &[String], second: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::<String>::new();
    let mut merged = Vec::<String>::new();
    for name in first.iter().chain(second.iter()) {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            merged.push(trimmed.to_string());
        }
    }
    merged
}

fn keyed_by_agent<T: Clone>(entries: &BTreeMap<String, T>) -> Result<BTreeMap<AgentKind, T>> {
    entries
        .iter()
        .map(|(name, value)| {
            let kind = AgentKind::parse(name).ok_or_else(|| {
                let known = AgentKind::ALL.map(AgentKind::as_str).join(", ");
                anyhow::anyhow!("unknown agent '{name}' in profile. Known agents: {known}")
            })?;
            Ok((kind, value.clone()))
        })
        .collect()
}

pub fn resolve_runtime_config(cli: &Cli, profiles: &ProfilesFile) -> Result<RuntimeConfig> {
    let selected = cli.profile.trim();
    if selected.is_empty() {
        return Err(anyhow::anyhow!(
            "profile name cannot be empty. Set --profile <name>."
        ));
    }

    let profile = if selected == "default" && !profiles.profiles.contains_key("default") {
        ProfileConfig::default()
    } else {
        profiles.profiles.get(selected).cloned().ok_or_else(|| {
            let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
            names.sort();
            if names.is_empty() {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. No profiles are defined yet.",
                    selected,
                    cli.config_path
                )
            } else {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. Available profiles: {}",
                    selected,
                    cli.config_path,
                    names.join(", ")
                )
            }
        })?
    };

    // CLI approvers replace the profile list rather than extending it.
    let approvers = if cli.approver.is_empty() {
        merge_unique_names(&profile.approvers, &[])
    } else {
        merge_unique_names(&cli.approver, &[])
    };
    let approvers = if approvers.is_empty() {
        vec!["*".to_string()]
    } else {
        approvers
    };

    let guardrail_terms = {
        let merged = merge_unique_names(&profile.guardrail_terms, &cli.guardrail_term);
        if merged.is_empty() {
            default_guardrail_terms()
        } else {
            merged
        }
    };

    let auto_rollback_threshold = cli
        .auto_rollback_threshold
        .or(profile.auto_rollback_threshold)
        .unwrap_or(DEFAULT_AUTO_ROLLBACK_THRESHOLD);
    if !(auto_rollback_threshold > 0.0 && auto_rollback_threshold <= 1.0) {
        return Err(anyhow::anyhow!(
            "auto_rollback_threshold must be in (0, 1], got {auto_rollback_threshold}"
        ));
    }

    let agent_autonomy = keyed_by_agent(&profile.agent_autonomy)?;
    let agent_tool_deny = keyed_by_agent(&profile.agent_tool_deny)?;

    Ok(RuntimeConfig {
        profile: selected.to_string(),
        config_path: cli.config_path.clone(),
        store_url: cli
            .store_url
            .clone()
            .or(profile.store_url)
            .unwrap_or_else(|| DEFAULT_STORE_URL.to_string()),
        show_sensitive_config: cli.show_sensitive_config,
        approval_timeout_secs: cli
            .approval_timeout_secs
            .or(profile.approval_timeout_secs)
            .unwrap_or(DEFAULT_APPROVAL_TIMEOUT_SECS)
            .max(1),
        execution_timeout_secs: cli
            .execution_timeout_secs
            .or(profile.execution_timeout_secs)
            .unwrap_or(DEFAULT_EXECUTION_TIMEOUT_SECS)
            .max(1),
        auto_rollback_threshold,
        fan_out_limit: cli
            .fan_out_limit
            .or(profile.fan_out_limit)
            .unwrap_or(DEFAULT_FAN_OUT_LIMIT)
            .max(1),
        plan_only_min_quality: cli
            .plan_only_min_quality
            .or(profile.plan_only_min_quality)
            .unwrap_or(60)
            .min(100),
        prod_min_quality: cli
            .prod_min_quality
            .or(profile.prod_min_quality)
            .unwrap_or(80)
            .min(100),
        approvers,
        revalidate_after_pause_secs: cli
            .revalidate_after_pause_secs
            .or(profile.revalidate_after_pause_secs),
        max_intent_chars: cli
            .max_intent_chars
            .or(profile.max_intent_chars)
            .unwrap_or(DEFAULT_MAX_INTENT_CHARS)
            .max(1),
        intent_guardrail_mode: cli
            .intent_guardrail_mode
            .or(profile.intent_guardrail_mode)
            .unwrap_or(GuardrailMode::Observe),
        guardrail_terms,
        notify_enabled: cli
            .notify_enabled
            .or(profile.notify_enabled)
            .unwrap_or(true),
        notify_path: cli
            .notify_path
            .clone()
            .or(profile.notify_path)
            .unwrap_or_else(|| DEFAULT_NOTIFY_PATH.to_string()),
        connector: cli
            .connector
            .or(profile.connector)
            .unwrap_or(ConnectorKind::Simulated),
        apply_command: cli.apply_command.clone().or(profile.apply_command),
        health_command: cli.health_command.clone().or(profile.health_command),
        command_timeout_secs: cli
            .command_timeout_secs
            .or(profile.command_timeout_secs)
            .unwrap_or(COMMAND_DEFAULT_TIMEOUT_SECS)
            .max(1),
        command_retry_attempts: cli
            .command_retry_attempts
            .or(profile.command_retry_attempts)
            .unwrap_or(COMMAND_DEFAULT_RETRY_ATTEMPTS)
            .max(1),
        command_retry_delay_ms: cli
            .command_retry_delay_ms
            .or(profile.command_retry_delay_ms)
            .unwrap_or(COMMAND_DEFAULT_RETRY_DELAY_MS),
        simulated_faults: profile.simulated_faults,
        itsm_journal_path: cli.itsm_journal_path.clone().or(profile.itsm_journal_path),
        sweep_interval_secs: cli
            .sweep_interval_secs
            .or(profile.sweep_interval_secs)
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS)
            .max(1),
        policy_rules: profile.policy_rules,
        facts: profile.facts,
        agent_autonomy,
        agent_tool_deny,
    })
}

pub fn display_store_url(cfg: &RuntimeConfig) -> String {
    if cfg.show_sensitive_config {
        cfg.store_url.clone()
    } else {
        format!(
            "{} (set --show-sensitive-config to reveal)",
            crate::error::redact_sqlite_url_value(&cfg.store_url)
        )
    }
}

/// Problems that keep the configured connector from running.
pub fn connector_problems(cfg: &RuntimeConfig) -> Vec<String> {
    let mut problems = Vec::new();
    if cfg.connector != ConnectorKind::Command {
        return problems;
    }
    match cfg.apply_command.as_deref().map(str::trim) {
        None | Some("") => {
            problems.push("connector 'command' requires apply_command".to_string());
        }
        Some(template) => {
            if let Err(err) = crate::connector::render_command(template, "probe", "probe", &serde_json::Value::Null) {
                problems.push(format!("apply_command is not a valid template: {err}"));
            }
        }
    }
    if let Some(template) = cfg.health_command.as_deref()
        && let Err(err) = crate::connector::render_command(template, "probe", "probe", &serde_json::Value::Null)
    {
        problems.push(format!("health_command is not a valid template: {err}"));
    }
    problems
}

pub fn build_change_records(cfg: &RuntimeConfig) -> Arc<dyn ChangeRecords> {
    match cfg.itsm_journal_path.as_deref() {
        Some(path) if !path.trim().is_empty() => Arc::new(JournalChangeRecords::new(path)),
        _ => Arc::new(NoopChangeRecords),
    }
}

pub fn build_agent_overrides(cfg: &RuntimeConfig) -> AgentOverrides {
    AgentOverrides {
        autonomy: cfg.agent_autonomy.clone(),
        deny: cfg.agent_tool_deny.clone(),
    }
}

/// Opens the store (applying migrations) and wires every collaborator the
/// configuration names.
pub async fn build_orchestrator(cfg: &RuntimeConfig) -> Result<Orchestrator> {
    let problems = connector_problems(cfg);
    if !problems.is_empty() {
        return Err(anyhow::anyhow!(
            "invalid connector configuration: {}",
            problems.join("; ")
        ));
    }

    let store = Store::open(&cfg.store_url)
        .await
        .with_context(|| format!("failed to open store at {}", cfg.store_url))?;

    let builder = Orchestrator::builder(store)
        .clock(Arc::new(SystemClock))
        .agent_overrides(build_agent_overrides(cfg))
        .policy(Arc::new(RulePolicyEvaluator::new(cfg.policy_rules.clone())))
        .guardrail(IntentGuardrail {
            mode: cfg.intent_guardrail_mode,
            terms: cfg.guardrail_terms.clone(),
            replacement: DEFAULT_REDACT_REPLACEMENT.to_string(),
            max_chars: cfg.max_intent_chars,
        })
        .approvals(ApprovalPolicy {
            plan_only_min_quality: cfg.plan_only_min_quality,
            prod_min_quality: cfg.prod_min_quality,
            approvers: cfg.approvers.clone(),
        })
        .notifier(build_notifier(cfg))
        .change_records(build_change_records(cfg))
        .executor_settings(ExecutorSettings {
            fan_out_limit: cfg.fan_out_limit,
            auto_rollback_threshold: cfg.auto_rollback_threshold,
            execution_timeout_secs: cfg.execution_timeout_secs,
        })
        .settings(OrchestratorSettings {
            approval_timeout_secs: cfg.approval_timeout_secs,
            revalidate_after_pause_secs: cfg.revalidate_after_pause_secs,
            facts: cfg.facts.clone(),
        });

    let builder = match cfg.connector {
        ConnectorKind::Simulated => {
            builder.connector(Arc::new(SimulatedConnector::new(cfg.simulated_faults.clone())))
        }
        ConnectorKind::Command => {
            let mut connector = CommandConnector::new(cfg.apply_command.clone().unwrap_or_default());
            connector.health_command = cfg.health_command.clone();
            connector.timeout_secs = cfg.command_timeout_secs;
            connector.retry_attempts = cfg.command_retry_attempts;
            connector.retry_delay_ms = cfg.command_retry_delay_ms;
            builder.connector(Arc::new(connector))
        }
    };

    tracing::debug!(
        profile = %cfg.profile,
        connector = cfg.connector.as_str(),
        policy_rules = cfg.policy_rules.len(),
        "orchestrator configured"
    );
    Ok(builder.build())
}
