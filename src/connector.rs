//! Outbound platform contracts used by the execution engine.
//!
//! The engine only ever sees `apply(resource_id, operation, params)` and a
//! per-resource health check; it never branches on platform type.
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tool_policy::matches_wildcard;

pub const COMMAND_DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const COMMAND_DEFAULT_RETRY_ATTEMPTS: u32 = 1;
pub const COMMAND_DEFAULT_RETRY_DELAY_MS: u64 = 500;
const COMMAND_DETAIL_MAX_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Succeeded { detail: Option<String> },
    Failed { reason: String },
}

impl ApplyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ApplyOutcome::Succeeded { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Unhealthy { reason: String },
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Applies `operation` to one resource. Never panics on platform errors;
    /// they come back as `Failed`.
    async fn apply(&self, resource_id: &str, operation: &str, params: &Value) -> ApplyOutcome;
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, resource_id: &str) -> Health;
}

// ---------------------------------------------------------------------------
// Command connector
// ---------------------------------------------------------------------------

/// Runs an operator-supplied command template per resource. Templates are
/// split into words first and placeholders substituted per word, so resource
/// ids and params never pass through a shell. Placeholders: `{resource}`,
/// `{operation}`, `{params}` (compact JSON).
#[derive(Debug, Clone)]
pub struct CommandConnector {
    pub apply_command: String,
    pub health_command: Option<String>,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl CommandConnector {
    pub fn new(apply_command: impl Into<String>) -> Self {
        Self {
            apply_command: apply_command.into(),
            health_command: None,
            timeout_secs: COMMAND_DEFAULT_TIMEOUT_SECS,
            retry_attempts: COMMAND_DEFAULT_RETRY_ATTEMPTS,
            retry_delay_ms: COMMAND_DEFAULT_RETRY_DELAY_MS,
        }
    }

    async fn run(&self, template: &str, resource_id: &str, operation: &str, params: &Value) -> Result<String, String> {
        let argv = render_command(template, resource_id, operation, params)?;
        let attempts = self.retry_attempts.max(1);
        let mut last_error = String::from("command was not attempted");
        for attempt in 1..=attempts {
            match run_command_once(&argv, self.timeout_secs).await {
                Ok(output) if output.status.success() => {
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    return Ok(truncate_text(stdout.trim(), COMMAND_DETAIL_MAX_CHARS));
                }
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    last_error = format!(
                        "command exited with {}: {}",
                        output.status,
                        truncate_text(stderr.trim(), COMMAND_DETAIL_MAX_CHARS)
                    );
                }
                Err(err) => last_error = err,
            }
            tracing::debug!(
                resource = resource_id,
                operation = operation,
                attempt = attempt,
                error = %last_error,
                "connector command attempt failed"
            );
            if attempt < attempts && self.retry_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.retry_delay_ms)).await;
            }
        }
        Err(last_error)
    }
}

pub fn render_command(template: &str, resource_id: &str, operation: &str, params: &Value) -> Result<Vec<String>, String> {
    let Some(words) = shlex::split(template.trim()) else {
        return Err(format!("command template is not valid shell syntax: {template}"));
    };
    if words.is_empty() {
        return Err("command template is empty".to_string());
    }
    let params = params.to_string();
    Ok(words
        .into_iter()
        .map(|word| {
            word.replace("{resource}", resource_id)
                .replace("{operation}", operation)
                .replace("{params}", &params)
        })
        .collect())
}

async fn run_command_once(argv: &[String], timeout_secs: u64) -> Result<std::process::Output, String> {
    let Some((program, args)) = argv.split_first() else {
        return Err("empty command".to_string());
    };
    let child = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(Duration::from_secs(timeout_secs.max(1)), child).await {
        Ok(result) => result.map_err(|err| format!("failed to launch '{program}': {err}")),
        Err(_) => Err(format!("command timed out after {timeout_secs}s")),
    }
}

pub fn truncate_text(text: &str, max_chars: usize) -> String {
    let mut iter = text.chars();
    let truncated = iter.by_ref().take(max_chars).collect::<String>();
    if iter.next().is_some() {
        format!("{truncated}...")
    } else {
        truncated
    }
}

#[async_trait]
impl Connector for CommandConnector {
    async fn apply(&self, resource_id: &str, operation: &str, params: &Value) -> ApplyOutcome {
        match self.run(&self.apply_command, resource_id, operation, params).await {
            Ok(stdout) => ApplyOutcome::Succeeded {
                detail: (!stdout.is_empty()).then_some(stdout),
            },
            Err(reason) => ApplyOutcome::Failed { reason },
        }
    }
}

#[async_trait]
impl HealthProbe for CommandConnector {
    async fn check(&self, resource_id: &str) -> Health {
        let Some(template) = self.health_command.as_deref() else {
            return Health::Healthy;
        };
        match self.run(template, resource_id, "health", &Value::Null).await {
            Ok(_) => Health::Healthy,
            Err(reason) => Health::Unhealthy { reason },
        }
    }
}

// ---------------------------------------------------------------------------
// Simulated connector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulatedEffect {
    /// `apply` returns Failed and the resource is left untouched.
    Fail,
    /// `apply` succeeds but the resource reports unhealthy afterwards.
    Unhealthy,
}

/// One scripted fault. Resource and operation are wildcard patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulatedFault {
    pub resource: String,
    #[serde(default = "any_operation")]
    pub operation: String,
    pub effect: SimulatedEffect,
}

fn any_operation() -> String {
    "*".to_string()
}

/// In-process connector for dry runs and tests. Every call succeeds unless a
/// scripted fault matches; health reflects the last operation applied.
#[derive(Debug, Default)]
pub struct SimulatedConnector {
    faults: Vec<SimulatedFault>,
    delay: Option<Duration>,
    state: Mutex<SimulatedState>,
}

#[derive(Debug, Default)]
struct SimulatedState {
    last_operation: BTreeMap<String, String>,
    calls: Vec<(String, String)>,
}

impl SimulatedConnector {
    pub fn new(faults: Vec<SimulatedFault>) -> Self {
        Self {
            faults,
            ..Self::default()
        }
    }

    pub fn fail(mut self, resource: &str, operation: &str) -> Self {
        self.faults.push(SimulatedFault {
            resource: resource.to_string(),
            operation: operation.to_string(),
            effect: SimulatedEffect::Fail,
        });
        self
    }

    pub fn unhealthy(mut self, resource: &str, operation: &str) -> Self {
        self.faults.push(SimulatedFault {
            resource: resource.to_string(),
            operation: operation.to_string(),
            effect: SimulatedEffect::Unhealthy,
        });
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every `(resource, operation)` applied so far, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fault(&self, resource_id: &str, operation: &str, effect: SimulatedEffect) -> bool {
        self.faults.iter().any(|fault| {
            fault.effect == effect
                && matches_wildcard(&fault.resource, resource_id)
                && matches_wildcard(&fault.operation, operation)
        })
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn apply(&self, resource_id: &str, operation: &str, _params: &Value) -> ApplyOutcome {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        state
            .calls
            .push((resource_id.to_string(), operation.to_string()));
        if self.fault(resource_id, operation, SimulatedEffect::Fail) {
            return ApplyOutcome::Failed {
                reason: format!("simulated failure applying {operation}"),
            };
        }
        state
            .last_operation
            .insert(resource_id.to_string(), operation.to_string());
        ApplyOutcome::Succeeded { detail: None }
    }
}

#[async_trait]
impl HealthProbe for SimulatedConnector {
    async fn check(&self, resource_id: &str) -> Health {
        let last = self.lock().last_operation.get(resource_id).cloned();
        match last {
            Some(operation) if self.fault(resource_id, &operation, SimulatedEffect::Unhealthy) => {
                Health::Unhealthy {
                    reason: format!("simulated unhealthy after {operation}"),
                }
            }
            _ => Health::Healthy,
        }
    }
}
