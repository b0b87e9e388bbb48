use std::collections::BTreeSet;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestrationError, OrchestrationResult};

pub const DEFAULT_GUARDRAIL_TERMS: &[&str] = &[
    "password",
    "secret",
    "api key",
    "api_key",
    "private key",
    "access token",
    "bearer",
    "aws_secret_access_key",
];

pub const DEFAULT_REDACT_REPLACEMENT: &str = "[REDACTED]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailMode {
    Disabled,
    #[default]
    Observe,
    Block,
    Redact,
}

impl GuardrailMode {
    pub fn as_str(self) -> &'static str {
        match self {
            GuardrailMode::Disabled => "disabled",
            GuardrailMode::Observe => "observe",
            GuardrailMode::Block => "block",
            GuardrailMode::Redact => "redact",
        }
    }
}

pub fn default_guardrail_terms() -> Vec<String> {
    DEFAULT_GUARDRAIL_TERMS
        .iter()
        .map(|term| term.to_string())
        .collect::<Vec<String>>()
}

pub fn contains_guardrail_terms(text: &str, terms: &[String]) -> Vec<String> {
    let lower = text.to_ascii_lowercase();
    terms
        .iter()
        .map(|term| term.trim().to_ascii_lowercase())
        .filter(|term| !term.is_empty() && lower.contains(term.as_str()))
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

pub fn replace_case_insensitive(input: &str, needle: &str, replacement: &str) -> String {
    if needle.is_empty() {
        return input.to_string();
    }

    let input_lower = input.to_ascii_lowercase();
    let needle_lower = needle.to_ascii_lowercase();
    let mut out = String::new();
    let mut last_idx = 0usize;
    let mut search_idx = 0usize;

    while let Some(relative) = input_lower[search_idx..].find(&needle_lower) {
        let start = search_idx + relative;
        let end = start + needle.len();
        out.push_str(&input[last_idx..start]);
        out.push_str(replacement);
        last_idx = end;
        search_idx = end;
    }

    out.push_str(&input[last_idx..]);
    out
}

/// What the guardrail did with a submitted intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Screened {
    pub text: String,
    pub hits: Vec<String>,
    pub mode: GuardrailMode,
}

/// Screens intent text before it is persisted or handed to the oracle.
#[derive(Debug, Clone)]
pub struct IntentGuardrail {
    pub mode: GuardrailMode,
    pub terms: Vec<String>,
    pub replacement: String,
    pub max_chars: usize,
}

impl Default for IntentGuardrail {
    fn default() -> Self {
        Self {
            mode: GuardrailMode::Observe,
            terms: default_guardrail_terms(),
            replacement: DEFAULT_REDACT_REPLACEMENT.to_string(),
            max_chars: 8000,
        }
    }
}

impl IntentGuardrail {
    pub fn screen(&self, text: &str) -> OrchestrationResult<Screened> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(OrchestrationError::InvalidInput(
                "intent text must not be empty".to_string(),
            ));
        }
        if self.max_chars > 0 && trimmed.chars().count() > self.max_chars {
            return Err(OrchestrationError::InvalidInput(format!(
                "intent exceeds maximum length ({} chars > {} limit)",
                trimmed.chars().count(),
                self.max_chars
            )));
        }

        let hits = if matches!(self.mode, GuardrailMode::Disabled) {
            Vec::new()
        } else {
            contains_guardrail_terms(trimmed, &self.terms)
        };
        if hits.is_empty() {
            return Ok(Screened {
                text: trimmed.to_string(),
                hits,
                mode: self.mode,
            });
        }

        tracing::warn!(
            mode = self.mode.as_str(),
            hit_count = hits.len(),
            "intent guardrail matched sensitive terms"
        );
        match self.mode {
            GuardrailMode::Block => Err(OrchestrationError::InvalidInput(format!(
                "intent blocked by guardrail (matched: {})",
                hits.join(", ")
            ))),
            GuardrailMode::Redact => {
                let mut redacted = trimmed.to_string();
                for hit in &hits {
                    redacted = replace_case_insensitive(&redacted, hit, &self.replacement);
                }
                Ok(Screened {
                    text: redacted,
                    hits,
                    mode: self.mode,
                })
            }
            GuardrailMode::Observe | GuardrailMode::Disabled => Ok(Screened {
                text: trimmed.to_string(),
                hits,
                mode: self.mode,
            }),
        }
    }
}
