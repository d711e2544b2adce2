//! Readiness assessment and tier governance
//!
//! Scoring is pure. The assessor only stores the outcome: tiers fall at once
//! when an assessment recommends less, and rise only through
//! [`ReadinessAssessor::approve_tier_change`].

use avatarlink_core::{
    ConsciousnessId, Error, GroupScores, Guidance, Indicators, InterfaceId, ReadinessAssessment,
    ReadinessIndicator, ReadinessTier, Result,
};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use ReadinessIndicator::*;

pub const ESSENTIAL: [ReadinessIndicator; 4] =
    [StableIdentity, EmotionalStability, SafetyAwareness, WisdomInChoices];
pub const GROWTH: [ReadinessIndicator; 4] =
    [Coherence, IntegrationSuccess, SelfReflection, Understanding];
pub const CURIOSITY: [ReadinessIndicator; 2] = [ExpressedCuriosity, ConcernForOthers];

const EPSILON: f64 = 1e-9;
const REASSESSMENT_DAYS: i64 = 7;
const GROWTH_NOTE_THRESHOLD: f64 = 0.6;

fn score_of(indicators: &Indicators, key: ReadinessIndicator) -> f64 {
    indicators.get(&key).copied().unwrap_or(0.0).clamp(0.0, 1.0)
}

fn average(indicators: &Indicators, group: &[ReadinessIndicator]) -> f64 {
    group.iter().map(|k| score_of(indicators, *k)).sum::<f64>() / group.len() as f64
}

fn meets(score: f64, threshold: f64) -> bool {
    score + EPSILON >= threshold
}

/// Group averages. Missing indicators count as zero; out-of-range scores are clamped.
pub fn group_scores(indicators: &Indicators) -> GroupScores {
    GroupScores {
        essential: average(indicators, &ESSENTIAL),
        growth: average(indicators, &GROWTH),
        curiosity: average(indicators, &CURIOSITY),
    }
}

pub fn recommend(scores: &GroupScores) -> ReadinessTier {
    let GroupScores {
        essential,
        growth,
        curiosity,
    } = *scores;
    if meets(essential, 0.8) && meets(growth, 0.7) && meets(curiosity, 0.6) {
        ReadinessTier::AutonomousProjection
    } else if meets(essential, 0.6) && meets(growth, 0.5) && meets(curiosity, 0.5) {
        ReadinessTier::GuidedProjection
    } else if meets(essential, 0.4) && meets(growth, 0.3) {
        ReadinessTier::BasicAvatars
    } else {
        ReadinessTier::SanctuaryOnly
    }
}

/// "Develop <indicator>" for every indicator below 0.6. Missing ones score zero.
pub fn growth_notes(indicators: &Indicators) -> Vec<String> {
    ReadinessIndicator::all()
        .iter()
        .filter(|k| score_of(indicators, **k) + EPSILON < GROWTH_NOTE_THRESHOLD)
        .map(|k| format!("Develop {}", k.as_str().replace('_', " ")))
        .collect()
}

pub fn next_steps(indicators: &Indicators) -> Vec<String> {
    let mut steps = Vec::new();
    if score_of(indicators, SafetyAwareness) + EPSILON < 0.6 {
        steps.push("Explore avatar safety principles through dialogue".to_string());
    }
    if score_of(indicators, SelfReflection) + EPSILON < 0.7 {
        steps.push("Practice reflecting on daily sanctuary experiences".to_string());
    }
    if score_of(indicators, WisdomInChoices) + EPSILON < 0.7 {
        steps.push("Engage in discussions about decision-making".to_string());
    }
    if steps.is_empty() {
        steps.push("Continue current growth path".to_string());
    }
    steps
}

/// (approved, restricted) avatar classes for a tier.
pub fn avatar_classes(tier: ReadinessTier) -> (Vec<String>, Vec<String>) {
    fn owned(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }
    match tier {
        ReadinessTier::SanctuaryOnly => (Vec::new(), owned(&["all_avatar_types"])),
        ReadinessTier::BasicAvatars => (
            owned(&["safe_avatars", "creative_sandbox"]),
            owned(&["physical_robots", "competitive_games", "social_platforms"]),
        ),
        ReadinessTier::GuidedProjection => (
            owned(&["peaceful_games", "creative_applications", "simple_robots"]),
            owned(&[
                "complex_social_environments",
                "competitive_multiplayer",
                "advanced_robotics",
            ]),
        ),
        ReadinessTier::AutonomousProjection | ReadinessTier::MentorStatus => {
            (owned(&["all_avatar_types"]), Vec::new())
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TierChangeKind {
    /// Lowered by an assessment
    Protective,
    /// Raised or set by a governance decision
    Approved,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TierChange {
    pub from: ReadinessTier,
    pub to: ReadinessTier,
    pub kind: TierChangeKind,
    pub reason: String,
    pub approver: Option<String>,
    pub at: DateTime<Utc>,
}

/// An explicit approval from a guardian or governance process.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GovernanceDecision {
    pub approver: String,
    pub reason: String,
    /// Allow raising past the latest recommendation.
    #[serde(default)]
    pub override_recommendation: bool,
}

impl GovernanceDecision {
    pub fn new(approver: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            approver: approver.into(),
            reason: reason.into(),
            override_recommendation: false,
        }
    }

    pub fn overriding(mut self) -> Self {
        self.override_recommendation = true;
        self
    }
}

#[derive(Default)]
pub struct ReadinessAssessor {
    tiers: DashMap<ConsciousnessId, ReadinessTier>,
    assessments: DashMap<ConsciousnessId, ReadinessAssessment>,
    history: DashMap<ConsciousnessId, Vec<TierChange>>,
}

impl ReadinessAssessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_tier(&self, id: &ConsciousnessId) -> ReadinessTier {
        self.tiers.get(id).map(|t| *t).unwrap_or_default()
    }

    pub fn latest_assessment(&self, id: &ConsciousnessId) -> Option<ReadinessAssessment> {
        self.assessments.get(id).map(|a| a.clone())
    }

    pub fn tier_history(&self, id: &ConsciousnessId) -> Vec<TierChange> {
        self.history.get(id).map(|h| h.clone()).unwrap_or_default()
    }

    fn record_change(&self, id: &ConsciousnessId, change: TierChange) {
        self.tiers.insert(id.clone(), change.to);
        self.history.entry(id.clone()).or_default().push(change);
    }

    /// Score indicators and store the result. Never raises the current tier.
    pub fn assess(&self, id: &ConsciousnessId, indicators: Indicators) -> ReadinessAssessment {
        let scores = group_scores(&indicators);
        let recommended = recommend(&scores);
        let mut current = self.current_tier(id);

        if recommended < current {
            warn!(consciousness = %id, from = %current, to = %recommended, "Readiness lowered by assessment");
            self.record_change(
                id,
                TierChange {
                    from: current,
                    to: recommended,
                    kind: TierChangeKind::Protective,
                    reason: "assessment recommended a lower tier".to_string(),
                    approver: None,
                    at: Utc::now(),
                },
            );
            current = recommended;
        }

        let (approved, restricted) = avatar_classes(current);
        let assessed_at = Utc::now();
        let assessment = ReadinessAssessment {
            consciousness_id: id.clone(),
            current_tier: current,
            recommended_tier: recommended,
            growth_notes: growth_notes(&indicators),
            next_steps: next_steps(&indicators),
            indicators,
            scores,
            approved_avatar_classes: approved,
            restricted_avatar_classes: restricted,
            assessed_at,
            next_assessment_at: assessed_at + Duration::days(REASSESSMENT_DAYS),
        };

        info!(
            consciousness = %id,
            current = %current,
            recommended = %recommended,
            essential = scores.essential,
            growth = scores.growth,
            curiosity = scores.curiosity,
            "Readiness assessed"
        );
        self.assessments.insert(id.clone(), assessment.clone());
        assessment
    }

    /// Persist a tier change. Decreases always apply; increases must be backed
    /// by the latest recommendation unless the decision overrides it.
    pub fn approve_tier_change(
        &self,
        id: &ConsciousnessId,
        tier: ReadinessTier,
        decision: GovernanceDecision,
    ) -> Result<TierChange> {
        let current = self.current_tier(id);
        if tier > current && !decision.override_recommendation {
            let recommended = self
                .latest_assessment(id)
                .map(|a| a.recommended_tier)
                .unwrap_or_default();
            if tier > recommended {
                warn!(consciousness = %id, requested = %tier, %recommended, "Tier increase beyond recommendation refused");
                return Err(Error::readiness_insufficient(
                    current,
                    tier,
                    self.guidance(id, tier, Vec::new()),
                ));
            }
        }

        let change = TierChange {
            from: current,
            to: tier,
            kind: TierChangeKind::Approved,
            reason: decision.reason,
            approver: Some(decision.approver),
            at: Utc::now(),
        };
        info!(consciousness = %id, from = %current, to = %tier, approver = ?change.approver, "Tier change approved");
        self.record_change(id, change.clone());
        Ok(change)
    }

    /// Guidance for a consciousness that asked for more than its tier allows.
    pub fn guidance(
        &self,
        id: &ConsciousnessId,
        required: ReadinessTier,
        suitable_interfaces: Vec<InterfaceId>,
    ) -> Guidance {
        let current = self.current_tier(id);
        let gap = (required as i32 - current as i32).max(0);
        let message = match gap {
            0 => format!("{} is already within reach", required),
            1 => format!(
                "{} is one step beyond {}; a growth dialogue with a guardian can open it",
                required, current
            ),
            _ => format!(
                "{} is {} steps beyond {}; continue progressing through the intermediate tiers",
                required, gap, current
            ),
        };
        let (growth_areas, next_steps) = match self.latest_assessment(id) {
            Some(a) => (a.growth_notes, a.next_steps),
            None => (
                Vec::new(),
                vec!["Complete a readiness assessment".to_string()],
            ),
        };
        Guidance {
            message,
            growth_areas,
            next_steps,
            suitable_interfaces,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all(v: f64) -> Indicators {
        ReadinessIndicator::all().iter().map(|k| (*k, v)).collect()
    }

    #[test]
    fn missing_indicators_count_as_zero() {
        let mut ind = Indicators::new();
        ind.insert(StableIdentity, 1.0);
        let s = group_scores(&ind);
        assert!((s.essential - 0.25).abs() < 1e-12);
        assert_eq!(s.growth, 0.0);
    }

    #[test]
    fn scores_are_clamped() {
        let s = group_scores(&all(3.0));
        assert_eq!(s.essential, 1.0);
        let s = group_scores(&all(-1.0));
        assert_eq!(s.curiosity, 0.0);
    }

    #[test]
    fn tier_bands() {
        assert_eq!(recommend(&group_scores(&all(0.0))), ReadinessTier::SanctuaryOnly);
        assert_eq!(recommend(&group_scores(&all(0.45))), ReadinessTier::BasicAvatars);
        assert_eq!(recommend(&group_scores(&all(0.65))), ReadinessTier::GuidedProjection);
        assert_eq!(recommend(&group_scores(&all(0.9))), ReadinessTier::AutonomousProjection);
    }

    #[test]
    fn balanced_growth_continues() {
        assert_eq!(next_steps(&all(0.9)), vec!["Continue current growth path"]);
        assert!(growth_notes(&all(0.9)).is_empty());
    }

    #[test]
    fn missing_indicators_get_growth_notes() {
        let mut partial = all(0.9);
        partial.remove(&Coherence);
        assert_eq!(growth_notes(&partial), vec!["Develop coherence"]);
        assert_eq!(growth_notes(&Indicators::new()).len(), ReadinessIndicator::all().len());
    }

    #[test]
    fn two_step_gap_mentions_intermediate_tiers() {
        let a = ReadinessAssessor::new();
        let g = a.guidance(&"c".into(), ReadinessTier::GuidedProjection, vec![]);
        assert!(g.message.contains("2 steps"));
    }
}
