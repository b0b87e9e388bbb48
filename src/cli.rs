use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use serde_json::Value;

use crate::guardrail::GuardrailMode;
use crate::model::ContextMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorKind {
    Simulated,
    Command,
}

impl ConnectorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectorKind::Simulated => "simulated",
            ConnectorKind::Command => "command",
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommands {
    #[command(about = "List configured profiles and highlight the active profile")]
    List,
    #[command(about = "Show the active profile's resolved runtime settings")]
    Show,
}

#[derive(Debug, Subcommand)]
pub enum TaskCommands {
    #[command(about = "List recent tasks, newest first")]
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    #[command(about = "Show a task with its active plan, approvals and executions")]
    Show {
        task_id: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    #[command(about = "Print the ordered audit trace of a task")]
    Trace {
        task_id: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum ExecutionCommands {
    #[command(about = "Show an execution with per-phase resource outcomes")]
    Show {
        execution_id: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    #[command(about = "Drive an execution until it waits, pauses or finishes")]
    Advance { execution_id: String },
    #[command(about = "Request a pause at the next phase boundary")]
    Pause { execution_id: String },
    #[command(about = "Resume a paused execution")]
    Resume { execution_id: String },
    #[command(about = "Cancel an execution and roll back completed phases")]
    Cancel { execution_id: String },
    #[command(about = "Approve promotion into the next rollout phase")]
    ApprovePhase {
        execution_id: String,
        #[arg(long)]
        notes: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum RegistryCommands {
    #[command(about = "List registered capabilities with risk class and rollback pairing")]
    Tools,
    #[command(about = "List specialist agents with their resolved tool sets")]
    Agents,
}

#[derive(Debug, Subcommand)]
pub enum NotificationCommands {
    #[command(about = "Summarize notifications from the JSONL outbox")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  changegate submit \"show drift on prod\" --resource web-01 --resource web-02\n\
  changegate --principal alice submit \"apply kernel patch to prod web fleet\" --context bake_secs=600\n\
  changegate tasks list --status pending_approval\n\
  changegate --principal bob approve task-0f3c... --notes \"reviewed canary scope\"\n\
  changegate --principal carol reject task-0f3c...\n\
  changegate revise task-0f3c... --context environment=staging\n\
  changegate executions show exec-91ab...\n\
  changegate --principal bob executions approve-phase exec-91ab...\n\
  changegate tasks trace task-0f3c...\n\
  changegate --connector command --apply-command \"ops-apply {resource} {operation} {params}\" serve --port 8787\n\
  changegate --profile prod doctor\n\
  changegate notifications report --limit 2000\n\
\n\
Context values:\n\
  - --context KEY=VALUE parses VALUE as JSON when it is valid JSON, otherwise as a string.\n\
  - --resource may repeat; it fills context.resources.\n\
  - --principal identifies the submitter or approver for the call.";

#[derive(Debug, Parser)]
#[command(name = "changegate")]
#[command(about = "Approval-gated change orchestration for infrastructure operations")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "CHANGEGATE_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "CHANGEGATE_CONFIG", default_value = ".changegate/config.toml")]
    pub config_path: String,

    #[arg(long, env = "CHANGEGATE_PRINCIPAL", default_value = "local-operator")]
    pub principal: String,

    #[arg(long, env = "CHANGEGATE_STORE_URL")]
    pub store_url: Option<String>,

    #[arg(long, env = "CHANGEGATE_SHOW_SENSITIVE_CONFIG", default_value_t = false)]
    pub show_sensitive_config: bool,

    #[arg(long, env = "CHANGEGATE_APPROVAL_TIMEOUT_SECS")]
    pub approval_timeout_secs: Option<u64>,

    #[arg(long, env = "CHANGEGATE_EXECUTION_TIMEOUT_SECS")]
    pub execution_timeout_secs: Option<u64>,

    #[arg(long, env = "CHANGEGATE_AUTO_ROLLBACK_THRESHOLD")]
    pub auto_rollback_threshold: Option<f64>,

    #[arg(long, env = "CHANGEGATE_FAN_OUT_LIMIT")]
    pub fan_out_limit: Option<usize>,

    #[arg(long, env = "CHANGEGATE_PLAN_ONLY_MIN_QUALITY")]
    pub plan_only_min_quality: Option<u32>,

    #[arg(long, env = "CHANGEGATE_PROD_MIN_QUALITY")]
    pub prod_min_quality: Option<u32>,

    #[arg(long, env = "CHANGEGATE_APPROVER")]
    pub approver: Vec<String>,

    #[arg(long, env = "CHANGEGATE_REVALIDATE_AFTER_PAUSE_SECS")]
    pub revalidate_after_pause_secs: Option<u64>,

    #[arg(long, env = "CHANGEGATE_MAX_INTENT_CHARS")]
    pub max_intent_chars: Option<usize>,

    #[arg(long, env = "CHANGEGATE_INTENT_GUARDRAIL_MODE", value_enum)]
    pub intent_guardrail_mode: Option<GuardrailMode>,

    #[arg(long, env = "CHANGEGATE_GUARDRAIL_TERM")]
    pub guardrail_term: Vec<String>,

    #[arg(long, env = "CHANGEGATE_NOTIFY_ENABLED", action = clap::ArgAction::Set)]
    pub notify_enabled: Option<bool>,

    #[arg(long, env = "CHANGEGATE_NOTIFY_PATH")]
    pub notify_path: Option<String>,

    #[arg(long, env = "CHANGEGATE_CONNECTOR", value_enum)]
    pub connector: Option<ConnectorKind>,

    #[arg(long, env = "CHANGEGATE_APPLY_COMMAND")]
    pub apply_command: Option<String>,

    #[arg(long, env = "CHANGEGATE_HEALTH_COMMAND")]
    pub health_command: Option<String>,

    #[arg(long, env = "CHANGEGATE_COMMAND_TIMEOUT_SECS")]
    pub command_timeout_secs: Option<u64>,

    #[arg(long, env = "CHANGEGATE_COMMAND_RETRY_ATTEMPTS")]
    pub command_retry_attempts: Option<u32>,

    #[arg(long, env = "CHANGEGATE_COMMAND_RETRY_DELAY_MS")]
    pub command_retry_delay_ms: Option<u64>,

    #[arg(long, env = "CHANGEGATE_ITSM_JOURNAL_PATH")]
    pub itsm_journal_path: Option<String>,

    #[arg(long, env = "CHANGEGATE_SWEEP_INTERVAL_SECS")]
    pub sweep_interval_secs: Option<u64>,

    #[arg(long, env = "RUST_LOG", default_value = "error")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Submit an operational intent and print the drafted plan")]
    Submit {
        #[arg(required = true)]
        intent: Vec<String>,
        #[arg(long = "context", value_name = "KEY=VALUE")]
        context: Vec<String>,
        #[arg(long = "resource")]
        resources: Vec<String>,
        #[arg(long)]
        idempotency_key: Option<String>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    #[command(about = "Inspect tasks, plans and audit traces")]
    Tasks {
        #[command(subcommand)]
        command: TaskCommands,
    },
    #[command(about = "Approve the active plan of a task")]
    Approve {
        task_id: String,
        #[arg(long)]
        notes: Option<String>,
    },
    #[command(about = "Reject the active plan of a task")]
    Reject {
        task_id: String,
        #[arg(long)]
        notes: Option<String>,
    },
    #[command(about = "Send a task back to draft for modification")]
    Modify {
        task_id: String,
        #[arg(long)]
        notes: Option<String>,
    },
    #[command(about = "Re-plan a draft task with a context patch (KEY=null removes a key)")]
    Revise {
        task_id: String,
        #[arg(long = "context", value_name = "KEY=VALUE")]
        context: Vec<String>,
        #[arg(long = "resource")]
        resources: Vec<String>,
    },
    #[command(about = "Inspect and control executions")]
    Executions {
        #[command(subcommand)]
        command: ExecutionCommands,
    },
    #[command(about = "Expire overdue approvals and advance due executions once")]
    Sweep,
    #[command(about = "Run the HTTP server with a background sweeper")]
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8787)]
        port: u16,
    },
    #[command(about = "Validate store, registry, connector and notification configuration")]
    Doctor,
    #[command(about = "Run store migrations")]
    Migrate,
    #[command(about = "Inspect the capability and agent registries")]
    Registry {
        #[command(subcommand)]
        command: RegistryCommands,
    },
    #[command(about = "Notification outbox utilities")]
    Notifications {
        #[command(subcommand)]
        command: NotificationCommands,
    },
    #[command(about = "Inspect profile configuration and active resolved profile state")]
    Profiles {
        #[command(subcommand)]
        command: ProfileCommands,
    },
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Submit { .. } => "submit".to_string(),
        Commands::Tasks { command } => match command {
            TaskCommands::List { .. } => "tasks.list".to_string(),
            TaskCommands::Show { .. } => "tasks.show".to_string(),
            TaskCommands::Trace { .. } => "tasks.trace".to_string(),
        },
        Commands::Approve { .. } => "approve".to_string(),
        Commands::Reject { .. } => "reject".to_string(),
        Commands::Modify { .. } => "modify".to_string(),
        Commands::Revise { .. } => "revise".to_string(),
        Commands::Executions { command } => match command {
            ExecutionCommands::Show { .. } => "executions.show".to_string(),
            ExecutionCommands::Advance { .. } => "executions.advance".to_string(),
            ExecutionCommands::Pause { .. } => "executions.pause".to_string(),
            ExecutionCommands::Resume { .. } => "executions.resume".to_string(),
            ExecutionCommands::Cancel { .. } => "executions.cancel".to_string(),
            ExecutionCommands::ApprovePhase { .. } => "executions.approve-phase".to_string(),
        },
        Commands::Sweep => "sweep".to_string(),
        Commands::Serve { .. } => "serve".to_string(),
        Commands::Doctor => "doctor".to_string(),
        Commands::Migrate => "migrate".to_string(),
        Commands::Registry { command } => match command {
            RegistryCommands::Tools => "registry.tools".to_string(),
            RegistryCommands::Agents => "registry.agents".to_string(),
        },
        Commands::Notifications { command } => match command {
            NotificationCommands::Report { .. } => "notifications.report".to_string(),
        },
        Commands::Profiles { command } => match command {
            ProfileCommands::List => "profiles.list".to_string(),
            ProfileCommands::Show => "profiles.show".to_string(),
        },
    }
}

/// Builds a context map from `KEY=VALUE` pairs. A value that parses as JSON
/// keeps its type, anything else is a string. `resources` are appended to
/// `context.resources`.
pub fn parse_context_args(pairs: &[String], resources: &[String]) -> Result<ContextMap> {
    let mut context = ContextMap::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            return Err(anyhow::anyhow!(
                "invalid --context '{pair}': expected KEY=VALUE"
            ));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow::anyhow!("invalid --context '{pair}': empty key"));
        }
        let value = serde_json::from_str::<Value>(raw.trim())
            .unwrap_or_else(|_| Value::String(raw.to_string()));
        context.insert(key.to_string(), value);
    }
    if !resources.is_empty() {
        let mut merged = match context.remove("resources") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(anyhow::anyhow!(
                    "--context resources must be a JSON array when combined with --resource, got {other}"
                ));
            }
            None => Vec::new(),
        };
        merged.extend(resources.iter().map(|id| Value::String(id.clone())));
        context.insert("resources".to_string(), Value::Array(merged));
    }
    Ok(context)
}
