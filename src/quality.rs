//! Plan quality scoring.
use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agents::PlanDraft;
use crate::error::OrchestrationResult;

pub const COMPLETENESS_WEIGHT: u32 = 25;
pub const SAFETY_WEIGHT: u32 = 30;
pub const FEASIBILITY_WEIGHT: u32 = 20;
pub const EFFICIENCY_WEIGHT: u32 = 10;
pub const CLARITY_WEIGHT: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityScore {
    pub completeness: u32,
    pub safety: u32,
    pub feasibility: u32,
    pub efficiency: u32,
    pub clarity: u32,
}

impl QualityScore {
    pub fn uniform(score: u32) -> Self {
        Self {
            completeness: score,
            safety: score,
            feasibility: score,
            efficiency: score,
            clarity: score,
        }
    }

    fn dimensions(&self) -> [(&'static str, u32, u32); 5] {
        [
            ("completeness", self.completeness.min(100), COMPLETENESS_WEIGHT),
            ("safety", self.safety.min(100), SAFETY_WEIGHT),
            ("feasibility", self.feasibility.min(100), FEASIBILITY_WEIGHT),
            ("efficiency", self.efficiency.min(100), EFFICIENCY_WEIGHT),
            ("clarity", self.clarity.min(100), CLARITY_WEIGHT),
        ]
    }

    /// Weighted total in 0..=100, rounded down.
    pub fn total(&self) -> u32 {
        let weighted: u32 = self
            .dimensions()
            .iter()
            .map(|(_, score, weight)| score * weight)
            .sum();
        weighted / 100
    }

    /// Dimensions scoring under `required`, lowest first. A total below
    /// `required` always has at least one such dimension.
    pub fn deficient_dimensions(&self, required: u32) -> Vec<String> {
        let mut dims = self.dimensions().to_vec();
        dims.sort_by_key(|(name, score, _)| (*score, *name));
        dims.iter()
            .filter(|(_, score, _)| *score < required)
            .map(|(name, score, _)| format!("{name}={score}"))
            .collect()
    }
}

/// Scores a drafted plan. Implementations may call out to an external reviewer;
/// the default is a deterministic heuristic.
#[async_trait]
pub trait PlanReviewer: Send + Sync {
    async fn review(&self, draft: &PlanDraft) -> OrchestrationResult<QualityScore>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicReviewer;

#[async_trait]
impl PlanReviewer for HeuristicReviewer {
    async fn review(&self, draft: &PlanDraft) -> OrchestrationResult<QualityScore> {
        Ok(heuristic_score(draft))
    }
}

/// Returns the same score for every plan.
#[derive(Debug, Clone, Copy)]
pub struct FixedReviewer(pub QualityScore);

#[async_trait]
impl PlanReviewer for FixedReviewer {
    async fn review(&self, _draft: &PlanDraft) -> OrchestrationResult<QualityScore> {
        Ok(self.0)
    }
}

pub fn heuristic_score(draft: &PlanDraft) -> QualityScore {
    let empty_phases = draft
        .phases
        .iter()
        .filter(|phase| phase.targets.is_empty())
        .count() as u32;
    let mut completeness = 100u32.saturating_sub(empty_phases * 25);
    if draft.phases.is_empty() {
        completeness = 0;
    }
    let covered = draft
        .phases
        .iter()
        .flat_map(|phase| phase.targets.iter())
        .collect::<BTreeSet<&String>>();
    if draft
        .affected_resources
        .iter()
        .any(|resource| !covered.contains(resource))
    {
        completeness = completeness.saturating_sub(20);
    }

    let mut safety = 100u32;
    if draft.risk_class.is_state_change() {
        let unpaired = draft
            .phases
            .iter()
            .filter(|phase| phase.risk_class.is_state_change() && phase.rollback_operation.is_none())
            .count() as u32;
        safety = safety.saturating_sub(unpaired * 40);
        // A single state-changing wave over several resources has no canary.
        if draft.phases.len() == 1 && draft.affected_resources.len() > 1 {
            safety = safety.saturating_sub(20);
        }
    }

    let total_targets = draft.phases.iter().map(|phase| phase.targets.len()).sum::<usize>();
    let feasibility = if total_targets > 500 { 70 } else { 100 };

    let duplicates = total_targets.saturating_sub(covered.len()) as u32;
    let efficiency = 100u32.saturating_sub(duplicates * 25);

    let rationale = draft.rationale.trim();
    let clarity = if rationale.len() >= 40 {
        100
    } else if rationale.is_empty() {
        30
    } else {
        70
    };

    QualityScore {
        completeness,
        safety,
        feasibility,
        efficiency,
        clarity,
    }
}
