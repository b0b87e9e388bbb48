use thiserror::Error;

use crate::validation::Violation;

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("intent is ambiguous between agents: {}", candidates.join(", "))]
    AmbiguousIntent { candidates: Vec<String> },

    #[error("no agent matches the intent{}", render_suggestions(suggestions))]
    NoMatchingAgent { suggestions: Vec<String> },

    #[error("agent '{agent}' invoked unauthorized capability '{tool}'")]
    UnauthorizedCapability { agent: String, tool: String },

    #[error("plan failed validation: {}", render_violations(violations))]
    ValidationViolation { violations: Vec<Violation> },

    #[error("task '{task_id}' expired waiting for approval")]
    ApprovalTimeout { task_id: String },

    #[error("policy denied the plan: {}", reasons.join("; "))]
    PolicyDenied { reasons: Vec<String> },

    #[error("phase '{phase}' failed health gating (failure fraction {failure_fraction:.3})")]
    PhaseHealthCheckFailed { phase: String, failure_fraction: f64 },

    #[error("rollback left resources needing manual intervention: {}", resources.join(", "))]
    RollbackPartialFailure { resources: Vec<String> },

    #[error("execution '{execution_id}' exceeded its global timeout")]
    ExecutionTimeout { execution_id: String },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("cannot {action} while {subject} is '{state}'")]
    InvalidTransition {
        subject: String,
        state: String,
        action: String,
    },

    #[error("principal '{principal}' cannot approve: {reason}")]
    IneligibleApprover { principal: String, reason: String },

    #[error(
        "quality score {score} is below the required {required} (deficient: {})",
        deficient.join(", ")
    )]
    QualityBelowThreshold {
        score: u32,
        required: u32,
        deficient: Vec<String>,
    },

    #[error("execution '{execution_id}' was modified concurrently")]
    ConcurrentModification { execution_id: String },

    #[error("task '{task_id}' already has an active plan")]
    ActivePlanExists { task_id: String },

    #[error("task '{task_id}' already has an active execution")]
    ActiveExecutionExists { task_id: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("collaborator failure: {0}")]
    Collaborator(String),
}

pub type OrchestrationResult<T> = std::result::Result<T, OrchestrationError>;

fn render_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean: {})", suggestions.join(", "))
    }
}

fn render_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|violation| format!("[{}] {}", violation.source.as_str(), violation.message))
        .collect::<Vec<String>>()
        .join("; ")
}

impl OrchestrationError {
    pub fn code(&self) -> &'static str {
        match self {
            OrchestrationError::AmbiguousIntent { .. } => "ambiguous_intent",
            OrchestrationError::NoMatchingAgent { .. } => "no_matching_agent",
            OrchestrationError::UnauthorizedCapability { .. } => "unauthorized_capability",
            OrchestrationError::ValidationViolation { .. } => "validation_violation",
            OrchestrationError::ApprovalTimeout { .. } => "approval_timeout",
            OrchestrationError::PolicyDenied { .. } => "policy_denied",
            OrchestrationError::PhaseHealthCheckFailed { .. } => "phase_health_check_failed",
            OrchestrationError::RollbackPartialFailure { .. } => "rollback_partial_failure",
            OrchestrationError::ExecutionTimeout { .. } => "execution_timeout",
            OrchestrationError::NotFound { .. } => "not_found",
            OrchestrationError::InvalidTransition { .. } => "invalid_transition",
            OrchestrationError::IneligibleApprover { .. } => "ineligible_approver",
            OrchestrationError::QualityBelowThreshold { .. } => "quality_below_threshold",
            OrchestrationError::ConcurrentModification { .. } => "concurrent_modification",
            OrchestrationError::ActivePlanExists { .. } => "active_plan_exists",
            OrchestrationError::ActiveExecutionExists { .. } => "active_execution_exists",
            OrchestrationError::InvalidInput(_) => "invalid_input",
            OrchestrationError::Store(_) => "store",
            OrchestrationError::Serialization(_) => "serialization",
            OrchestrationError::Collaborator(_) => "collaborator",
        }
    }

    /// Recoverable errors go back to the human reviewer with full detail and
    /// are never retried automatically.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OrchestrationError::AmbiguousIntent { .. }
                | OrchestrationError::NoMatchingAgent { .. }
                | OrchestrationError::ValidationViolation { .. }
                | OrchestrationError::PolicyDenied { .. }
                | OrchestrationError::QualityBelowThreshold { .. }
                | OrchestrationError::IneligibleApprover { .. }
        )
    }

    /// Programming or configuration errors that halt the task.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OrchestrationError::UnauthorizedCapability { .. })
    }
}

// ---------------------------------------------------------------------------
// CLI rendering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Intent,
    Approval,
    Validation,
    Execution,
    Store,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Intent => "INTENT",
            ErrorCategory::Approval => "APPROVAL",
            ErrorCategory::Validation => "VALIDATION",
            ErrorCategory::Execution => "EXECUTION",
            ErrorCategory::Store => "STORE",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Intent => {
                "Rephrase the request or pass --context agent=<name> to pick one of the candidates."
            }
            ErrorCategory::Approval => {
                "Check the approver list in the active profile and the task's current status with `tasks show`."
            }
            ErrorCategory::Validation => {
                "Inspect the violations, adjust the context and run `revise` on the task."
            }
            ErrorCategory::Execution => {
                "Inspect `executions show` and the audit trace with `tasks trace` before retrying."
            }
            ErrorCategory::Store => {
                "Check --store-url and run `changegate migrate` for new sqlite databases."
            }
            ErrorCategory::Input => "Run changegate --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    if let Some(domain) = err.downcast_ref::<OrchestrationError>() {
        return match domain {
            OrchestrationError::AmbiguousIntent { .. }
            | OrchestrationError::NoMatchingAgent { .. }
            | OrchestrationError::UnauthorizedCapability { .. } => ErrorCategory::Intent,
            OrchestrationError::ApprovalTimeout { .. }
            | OrchestrationError::IneligibleApprover { .. }
            | OrchestrationError::QualityBelowThreshold { .. } => ErrorCategory::Approval,
            OrchestrationError::ValidationViolation { .. }
            | OrchestrationError::PolicyDenied { .. } => ErrorCategory::Validation,
            OrchestrationError::PhaseHealthCheckFailed { .. }
            | OrchestrationError::RollbackPartialFailure { .. }
            | OrchestrationError::ExecutionTimeout { .. }
            | OrchestrationError::ConcurrentModification { .. }
            | OrchestrationError::ActiveExecutionExists { .. } => ErrorCategory::Execution,
            OrchestrationError::Store(_) => ErrorCategory::Store,
            OrchestrationError::NotFound { .. }
            | OrchestrationError::InvalidTransition { .. }
            | OrchestrationError::ActivePlanExists { .. }
            | OrchestrationError::InvalidInput(_) => ErrorCategory::Input,
            OrchestrationError::Serialization(_) | OrchestrationError::Collaborator(_) => {
                ErrorCategory::Internal
            }
        };
    }

    let msg = format!("{err:#}").to_ascii_lowercase();
    if msg.contains("sqlite") || msg.contains("migrat") || msg.contains("store") {
        return ErrorCategory::Store;
    }
    if msg.contains("invalid value")
        || msg.contains("unknown argument")
        || msg.contains("profile")
        || msg.contains("--context")
    {
        return ErrorCategory::Input;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let category = categorize_error(err);
    let rendered_error = render_error_message(err, show_sensitive_config);
    format!(
        "[{}] {}\nHint: {}",
        category.code(),
        rendered_error,
        category.hint()
    )
}

pub fn render_error_message(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let rendered = format!("{err:#}");
    if show_sensitive_config {
        rendered
    } else {
        redact_sqlite_urls(&rendered)
    }
}

pub fn redact_sqlite_urls(text: &str) -> String {
    const SQLITE_PREFIX: &str = "sqlite:";
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;

    while let Some(offset) = text[cursor..].find(SQLITE_PREFIX) {
        let start = cursor + offset;
        out.push_str(&text[cursor..start]);

        let remainder = &text[start..];
        let end = remainder
            .find(|ch: char| {
                ch.is_whitespace()
                    || matches!(
                        ch,
                        '"' | '\'' | '(' | ')' | '[' | ']' | '{' | '}' | ',' | ';'
                    )
            })
            .unwrap_or(remainder.len());
        out.push_str(&redact_sqlite_url_value(&remainder[..end]));
        cursor = start + end;
    }

    out.push_str(&text[cursor..]);
    out
}

pub fn redact_sqlite_url_value(value: &str) -> String {
    if value.starts_with("sqlite://") {
        "sqlite://[REDACTED]".to_string()
    } else if value.starts_with("sqlite:") {
        "sqlite:[REDACTED]".to_string()
    } else {
        value.to_string()
    }
}
