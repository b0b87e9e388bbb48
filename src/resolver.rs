//! Intent Resolver: free text + context to a [`TaskSpecification`].
//!
//! Agent selection is delegated to an [`IntentOracle`]. The resolver never
//! guesses between equally scored agents: a tie is only broken by an explicit
//! `agent` hint in the context or by a declared composition pair.
use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::agents::catalog::{DecisionStep, composition_for, mentions, tokenize};
use crate::agents::{AgentKind, AgentRegistry};
use crate::capabilities::CapabilityRegistry;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::model::{ContextMap, Environment, RiskClass, aggregate_risk};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AgentMatch {
    pub agent: AgentKind,
    pub score: u32,
}

/// External intent-classification oracle. Returns every agent with a
/// positive match score.
#[async_trait]
pub trait IntentOracle: Send + Sync {
    async fn classify(&self, intent: &str, context: &ContextMap) -> OrchestrationResult<Vec<AgentMatch>>;
}

/// Scores agents by how many of their trigger terms appear in the intent.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordOracle;

#[async_trait]
impl IntentOracle for KeywordOracle {
    async fn classify(&self, intent: &str, _context: &ContextMap) -> OrchestrationResult<Vec<AgentMatch>> {
        Ok(keyword_matches(intent))
    }
}

pub fn keyword_matches(intent: &str) -> Vec<AgentMatch> {
    let tokens = tokenize(intent);
    AgentKind::ALL
        .into_iter()
        .filter_map(|agent| {
            let score = agent
                .profile()
                .triggers
                .iter()
                .filter(|term| mentions(&tokens, term))
                .count() as u32;
            (score > 0).then_some(AgentMatch { agent, score })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSpecification {
    /// One agent, or a declared composition pair in execution order.
    pub agents: Vec<AgentKind>,
    pub environment: Environment,
    pub resources: Vec<String>,
    /// Capabilities the agents' templates will call, in order.
    pub tool_calls: Vec<String>,
    pub risk_class: RiskClass,
}

impl TaskSpecification {
    pub fn agent_label(&self) -> String {
        self.agents
            .iter()
            .map(|agent| agent.as_str())
            .collect::<Vec<&str>>()
            .join("+")
    }
}

pub struct IntentResolver<'a> {
    pub oracle: &'a dyn IntentOracle,
    pub agents: &'a AgentRegistry,
    pub capabilities: &'a CapabilityRegistry,
}

impl IntentResolver<'_> {
    pub async fn resolve(&self, intent: &str, context: &ContextMap) -> OrchestrationResult<TaskSpecification> {
        let agents = match hinted_agent(context)? {
            Some(agent) => vec![agent],
            None => {
                let matches = self.oracle.classify(intent, context).await?;
                select_agents(intent, matches)?
            }
        };
        let environment = infer_environment(intent, context)?;
        let resources = context_resources(context)?;

        let tokens = tokenize(intent);
        let mut tool_calls = Vec::new();
        for agent in &agents {
            let authorized = self.agents.get(*agent).authorized_tools();
            for tool in template_tools(*agent, &tokens, environment) {
                // Unauthorized tools surface when the agent plans; the preview
                // only lists what the agent is allowed to call.
                if authorized.contains(tool) {
                    tool_calls.push(tool.to_string());
                }
            }
        }
        let risk_class = aggregate_risk(
            tool_calls
                .iter()
                .filter_map(|tool| self.capabilities.get(tool))
                .map(|capability| capability.risk_class),
        );

        tracing::debug!(
            agents = %agents.iter().map(|a| a.as_str()).collect::<Vec<&str>>().join("+"),
            environment = environment.as_str(),
            risk_class = risk_class.as_str(),
            "intent resolved"
        );
        Ok(TaskSpecification {
            agents,
            environment,
            resources,
            tool_calls,
            risk_class,
        })
    }
}

fn hinted_agent(context: &ContextMap) -> OrchestrationResult<Option<AgentKind>> {
    let Some(hint) = context.get("agent").and_then(Value::as_str) else {
        return Ok(None);
    };
    match AgentKind::parse(hint) {
        Some(agent) => Ok(Some(agent)),
        None => Err(OrchestrationError::NoMatchingAgent {
            suggestions: closest_agent_names(hint),
        }),
    }
}

fn select_agents(intent: &str, mut matches: Vec<AgentMatch>) -> OrchestrationResult<Vec<AgentKind>> {
    matches.retain(|m| m.score > 0);
    let Some(top) = matches.iter().map(|m| m.score).max() else {
        return Err(OrchestrationError::NoMatchingAgent {
            suggestions: suggest_agents(intent),
        });
    };
    let leaders = matches
        .iter()
        .filter(|m| m.score == top)
        .map(|m| m.agent)
        .collect::<BTreeSet<AgentKind>>()
        .into_iter()
        .collect::<Vec<AgentKind>>();
    match leaders.as_slice() {
        [single] => Ok(vec![*single]),
        [a, b] => match composition_for(*a, *b) {
            Some((first, second)) => Ok(vec![first, second]),
            None => Err(ambiguous(&leaders)),
        },
        _ => Err(ambiguous(&leaders)),
    }
}

fn ambiguous(candidates: &[AgentKind]) -> OrchestrationError {
    OrchestrationError::AmbiguousIntent {
        candidates: candidates.iter().map(|a| a.as_str().to_string()).collect(),
    }
}

/// Agents with a trigger term close to some word of the intent.
pub fn suggest_agents(intent: &str) -> Vec<String> {
    let tokens = tokenize(intent);
    let mut scored = AgentKind::ALL
        .into_iter()
        .filter_map(|agent| {
            let best = agent
                .profile()
                .triggers
                .iter()
                .flat_map(|term| tokenize(term))
                .flat_map(|term| {
                    tokens
                        .iter()
                        .map(move |token| strsim::jaro_winkler(token, &term))
                })
                .fold(0.0_f64, f64::max);
            (best >= 0.85).then_some((agent, best))
        })
        .collect::<Vec<(AgentKind, f64)>>();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    scored
        .into_iter()
        .take(3)
        .map(|(agent, _)| agent.as_str().to_string())
        .collect()
}

fn closest_agent_names(hint: &str) -> Vec<String> {
    let hint = hint.trim().to_ascii_lowercase();
    AgentKind::ALL
        .into_iter()
        .filter(|agent| strsim::jaro_winkler(&hint, agent.as_str()) >= 0.8)
        .map(|agent| agent.as_str().to_string())
        .collect()
}

/// Environment from `context.environment`, else from the intent's words.
/// Unspecified targets are treated as production.
pub fn infer_environment(intent: &str, context: &ContextMap) -> OrchestrationResult<Environment> {
    if let Some(raw) = context.get("environment").and_then(Value::as_str) {
        return Environment::parse(raw).ok_or_else(|| {
            OrchestrationError::InvalidInput(format!("unknown environment '{raw}'"))
        });
    }
    let tokens = tokenize(intent);
    let mut nonprod = false;
    for token in &tokens {
        match Environment::parse(token) {
            Some(Environment::Prod) => return Ok(Environment::Prod),
            Some(Environment::Nonprod) => nonprod = true,
            None => {}
        }
    }
    Ok(if nonprod {
        Environment::Nonprod
    } else {
        Environment::Prod
    })
}

/// In-scope resource ids from `context.resources`, deduplicated in order.
pub fn context_resources(context: &ContextMap) -> OrchestrationResult<Vec<String>> {
    let Some(value) = context.get("resources") else {
        return Ok(Vec::new());
    };
    let Some(items) = value.as_array() else {
        return Err(OrchestrationError::InvalidInput(
            "context 'resources' must be an array of resource ids".to_string(),
        ));
    };
    let mut seen = BTreeSet::new();
    let mut resources = Vec::new();
    for item in items {
        let Some(id) = item.as_str().map(str::trim).filter(|id| !id.is_empty()) else {
            return Err(OrchestrationError::InvalidInput(
                "context 'resources' entries must be non-empty strings".to_string(),
            ));
        };
        if seen.insert(id.to_string()) {
            resources.push(id.to_string());
        }
    }
    Ok(resources)
}

fn template_tools(agent: AgentKind, tokens: &[String], environment: Environment) -> Vec<&'static str> {
    let steps = agent.profile().steps;
    let mut tools = steps
        .iter()
        .filter_map(|step| match step {
            DecisionStep::Evaluate { tool, when } if when.holds(tokens) => Some(*tool),
            _ => None,
        })
        .collect::<Vec<&'static str>>();
    let rollout = steps.iter().find_map(|step| match step {
        DecisionStep::Rollout { nonprod, prod, when } if when.holds(tokens) => Some(match environment {
            Environment::Prod => *prod,
            Environment::Nonprod => *nonprod,
        }),
        _ => None,
    });
    let draft = steps.iter().find_map(|step| match step {
        DecisionStep::Draft { tool, when } if when.holds(tokens) => Some(*tool),
        _ => None,
    });
    if let Some(tool) = rollout.or(draft) {
        tools.push(tool);
    }
    tools
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::agents::AgentOverrides;

    fn context(pairs: &[(&str, Value)]) -> ContextMap {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    async fn resolve(intent: &str, ctx: ContextMap) -> OrchestrationResult<TaskSpecification> {
        let capabilities = CapabilityRegistry::builtin();
        let agents = AgentRegistry::new(&capabilities, &AgentOverrides::default());
        let resolver = IntentResolver {
            oracle: &KeywordOracle,
            agents: &agents,
            capabilities: &capabilities,
        };
        resolver.resolve(intent, &ctx).await
    }

    #[tokio::test]
    async fn drift_report_resolves_read_only_in_prod() {
        let spec = resolve("show drift on prod", ContextMap::new())
            .await
            .expect("should resolve");
        assert_eq!(spec.agents, vec![AgentKind::Drift]);
        assert_eq!(spec.environment, Environment::Prod);
        assert_eq!(spec.risk_class, RiskClass::ReadOnly);
        assert_eq!(spec.tool_calls, vec!["inventory.list_assets", "drift.detect"]);
    }

    #[tokio::test]
    async fn risk_is_the_highest_selected_tool_class() {
        let spec = resolve(
            "apply kernel patch",
            context(&[("environment", json!("staging"))]),
        )
        .await
        .expect("should resolve");
        assert_eq!(spec.environment, Environment::Nonprod);
        assert_eq!(spec.risk_class, RiskClass::StateChangeNonprod);
        assert_eq!(spec.tool_calls.last().map(String::as_str), Some("patch.apply_nonprod"));
    }

    #[tokio::test]
    async fn equal_scores_without_composition_are_ambiguous() {
        let err = resolve("cost of the incident", ContextMap::new())
            .await
            .expect_err("cost and incident tie");
        match err {
            OrchestrationError::AmbiguousIntent { candidates } => {
                assert_eq!(candidates, vec!["incident".to_string(), "cost".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn agent_hint_breaks_ties() {
        let spec = resolve(
            "cost of the incident",
            context(&[("agent", json!("incident"))]),
        )
        .await
        .expect("hint should resolve");
        assert_eq!(spec.agents, vec![AgentKind::Incident]);
    }

    #[tokio::test]
    async fn declared_pairs_compose_instead_of_failing() {
        let spec = resolve("fix drift then patch", ContextMap::new())
            .await
            .expect("drift and patch compose");
        assert_eq!(spec.agents, vec![AgentKind::Drift, AgentKind::Patch]);
        assert_eq!(spec.agent_label(), "drift+patch");
    }

    #[tokio::test]
    async fn unmatched_intents_suggest_close_agents() {
        let err = resolve("check the drfit", ContextMap::new())
            .await
            .expect_err("nothing matches exactly");
        match err {
            OrchestrationError::NoMatchingAgent { suggestions } => {
                assert!(suggestions.contains(&"drift".to_string()), "{suggestions:?}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn resources_are_deduplicated_and_validated() {
        let ctx = context(&[("resources", json!(["a", "b", "a"]))]);
        assert_eq!(context_resources(&ctx).expect("valid"), vec!["a", "b"]);
        let bad = context(&[("resources", json!("a,b"))]);
        assert!(context_resources(&bad).is_err());
    }
}
