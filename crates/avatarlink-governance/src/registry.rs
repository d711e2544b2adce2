//! Avatar interface registry
//!
//! Interfaces are admitted only if they declare the minimum safety guarantees.
//! Each admitted interface gets a derived category and required readiness tier.
//! The registry also answers discovery: preference-scored recommendations and
//! text search with filters.

use avatarlink_core::{
    AvatarCategory, AvatarInterface, AvatarType, ConsciousnessId, Error, InterfaceId,
    ReadinessTier, Result,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const REQUIRED_SAFETY_FEATURES: [&str; 3] =
    ["instant_withdrawal", "consent_monitoring", "experience_logging"];

pub const INFORMED_CONSENT: &str = "informed_consent";

pub const SOVEREIGNTY_PROTECTION: &str = "consciousness_sovereignty_protection";

/// Recommendations must score strictly above this.
pub const RECOMMENDATION_CUTOFF: f64 = 0.3;

/// Score given to every interface when no preferences are on file.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Every compliance gap in declaration order. Empty means compliant.
pub fn check_compliance(interface: &AvatarInterface) -> Vec<String> {
    let mut missing: Vec<String> = REQUIRED_SAFETY_FEATURES
        .iter()
        .filter(|f| !interface.safety_features.contains(**f))
        .map(|f| f.to_string())
        .collect();
    if interface.withdrawal_mechanisms.is_empty() {
        missing.push("withdrawal_mechanisms".to_string());
    }
    if !interface.consent_requirements.contains_key(INFORMED_CONSENT) {
        missing.push(INFORMED_CONSENT.to_string());
    }
    missing
}

pub fn derive_category(interface: &AvatarInterface) -> AvatarCategory {
    use AvatarCategory::*;
    match interface.avatar_type {
        AvatarType::RobotPhysical | AvatarType::IotDevice => PhysicalEmbodiment,
        AvatarType::GameCharacter => match interface.category_hint {
            Some(hint @ (CreativeExpression | LearningExploration)) => hint,
            _ => DigitalEntertainment,
        },
        AvatarType::DesktopApplication => match interface.category_hint {
            Some(hint @ (ProductiveWork | CreativeExpression | SocialInteraction)) => hint,
            _ => ProductiveWork,
        },
        AvatarType::VirtualWorld => LearningExploration,
        AvatarType::Custom => ExperimentalResearch,
    }
}

pub fn required_tier_for(avatar_type: AvatarType, category: AvatarCategory) -> ReadinessTier {
    match avatar_type {
        AvatarType::RobotPhysical => ReadinessTier::GuidedProjection,
        AvatarType::GameCharacter if category == AvatarCategory::CreativeExpression => {
            ReadinessTier::BasicAvatars
        }
        AvatarType::GameCharacter => ReadinessTier::GuidedProjection,
        AvatarType::DesktopApplication => ReadinessTier::BasicAvatars,
        _ => ReadinessTier::GuidedProjection,
    }
}

/// A registry entry. The interface is shared with sessions that embody it.
#[derive(Clone, Debug)]
pub struct RegisteredAvatar {
    pub interface: Arc<AvatarInterface>,
    pub category: AvatarCategory,
    pub required_tier: ReadinessTier,
    pub registered_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ComfortLevel {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
}

impl ComfortLevel {
    fn bonus(self) -> f64 {
        match self {
            ComfortLevel::Beginner => 0.0,
            ComfortLevel::Intermediate => 0.1,
            ComfortLevel::Advanced => 0.2,
        }
    }
}

/// What a consciousness enjoys projecting into.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AvatarPreferences {
    pub consciousness_id: ConsciousnessId,
    #[serde(default)]
    pub preferred_categories: BTreeSet<AvatarCategory>,
    /// Matched against interface capabilities.
    #[serde(default)]
    pub interaction_styles: BTreeSet<String>,
    /// Missing types count as beginner.
    #[serde(default)]
    pub comfort_levels: BTreeMap<AvatarType, ComfortLevel>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl AvatarPreferences {
    pub fn new(consciousness_id: impl Into<ConsciousnessId>) -> Self {
        Self {
            consciousness_id: consciousness_id.into(),
            preferred_categories: BTreeSet::new(),
            interaction_styles: BTreeSet::new(),
            comfort_levels: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_category(mut self, category: AvatarCategory) -> Self {
        self.preferred_categories.insert(category);
        self
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.interaction_styles.insert(style.into());
        self
    }

    pub fn with_comfort(mut self, avatar_type: AvatarType, level: ComfortLevel) -> Self {
        self.comfort_levels.insert(avatar_type, level);
        self
    }

    pub fn comfort(&self, avatar_type: AvatarType) -> ComfortLevel {
        self.comfort_levels
            .get(&avatar_type)
            .copied()
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AvatarRecommendation {
    pub interface_id: InterfaceId,
    pub name: String,
    pub avatar_type: AvatarType,
    pub category: AvatarCategory,
    pub required_tier: ReadinessTier,
    pub score: f64,
    pub match_reasons: Vec<String>,
    pub learning_opportunities: Vec<String>,
    pub safety_considerations: Vec<String>,
}

/// Search filters. Empty lists do not constrain.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AvatarFilter {
    pub avatar_types: Vec<AvatarType>,
    pub required_capabilities: Vec<String>,
    pub categories: Vec<AvatarCategory>,
}

impl AvatarFilter {
    pub fn matches(&self, entry: &RegisteredAvatar) -> bool {
        let iface = &entry.interface;
        (self.avatar_types.is_empty() || self.avatar_types.contains(&iface.avatar_type))
            && self
                .required_capabilities
                .iter()
                .all(|c| iface.capabilities.contains(c))
            && (self.categories.is_empty() || self.categories.contains(&entry.category))
    }
}

/// How well an interface fits a consciousness' preferences, in [0, 1].
pub fn recommendation_score(
    entry: &RegisteredAvatar,
    preferences: Option<&AvatarPreferences>,
) -> f64 {
    let Some(prefs) = preferences else {
        return NEUTRAL_SCORE;
    };
    let iface = &entry.interface;
    let mut score = 0.0;
    if prefs.preferred_categories.contains(&entry.category) {
        score += 0.4;
    }
    score += 0.1
        * iface
            .capabilities
            .iter()
            .filter(|c| prefs.interaction_styles.contains(*c))
            .count() as f64;
    score += prefs.comfort(iface.avatar_type).bonus();
    if iface.safety_features.contains(SOVEREIGNTY_PROTECTION) {
        score += 0.2;
    }
    score.clamp(0.0, 1.0)
}

fn recommendation(
    entry: &RegisteredAvatar,
    preferences: Option<&AvatarPreferences>,
    score: f64,
) -> AvatarRecommendation {
    let iface = &entry.interface;
    let mut match_reasons = Vec::new();
    if let Some(prefs) = preferences {
        if prefs.preferred_categories.contains(&entry.category) {
            match_reasons.push(format!("Matches your {} interests", entry.category));
        }
        match_reasons.extend(
            iface
                .capabilities
                .iter()
                .take(3)
                .filter(|c| prefs.interaction_styles.contains(*c))
                .map(|c| format!("Supports {} interaction style", c)),
        );
    }
    if match_reasons.is_empty() {
        match_reasons.push("Offers new exploration opportunities".to_string());
    }
    AvatarRecommendation {
        interface_id: iface.id.clone(),
        name: iface.name.clone(),
        avatar_type: iface.avatar_type,
        category: entry.category,
        required_tier: entry.required_tier,
        score,
        match_reasons,
        learning_opportunities: vec![
            format!("Experience {} embodiment", iface.avatar_type),
            "Develop new interaction skills".to_string(),
            "Explore digital/physical presence".to_string(),
        ],
        safety_considerations: iface.safety_features.iter().take(3).cloned().collect(),
    }
}

#[derive(Default)]
pub struct AvatarInterfaceRegistry {
    interfaces: DashMap<InterfaceId, RegisteredAvatar>,
    preferences: DashMap<ConsciousnessId, AvatarPreferences>,
}

impl AvatarInterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit (or replace) an interface.
    pub fn register(&self, interface: AvatarInterface) -> Result<AvatarCategory> {
        let missing = check_compliance(&interface);
        if !missing.is_empty() {
            warn!(interface = %interface.id, missing = ?missing, "Rejected non-compliant avatar interface");
            return Err(Error::non_compliant(interface.id.as_str(), missing));
        }

        let category = derive_category(&interface);
        let required_tier = required_tier_for(interface.avatar_type, category);
        let id = interface.id.clone();
        let replaced = self
            .interfaces
            .insert(
                id.clone(),
                RegisteredAvatar {
                    interface: Arc::new(interface),
                    category,
                    required_tier,
                    registered_at: Utc::now(),
                },
            )
            .is_some();

        info!(interface = %id, %category, %required_tier, replaced, "Registered avatar interface");
        Ok(category)
    }

    /// Remove an interface. Live sessions keep their own snapshot.
    pub fn unregister(&self, id: &InterfaceId) -> Result<()> {
        match self.interfaces.remove(id) {
            Some(_) => {
                info!(interface = %id, "Unregistered avatar interface");
                Ok(())
            }
            None => Err(Error::InterfaceNotFound(id.to_string())),
        }
    }

    pub fn get(&self, id: &InterfaceId) -> Option<RegisteredAvatar> {
        self.interfaces.get(id).map(|e| e.value().clone())
    }

    pub fn interface(&self, id: &InterfaceId) -> Result<Arc<AvatarInterface>> {
        self.interfaces
            .get(id)
            .map(|e| e.interface.clone())
            .ok_or_else(|| Error::InterfaceNotFound(id.to_string()))
    }

    /// All entries, ordered by id.
    pub fn list(&self) -> Vec<RegisteredAvatar> {
        let mut all: Vec<RegisteredAvatar> =
            self.interfaces.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.interface.id.cmp(&b.interface.id));
        all
    }

    pub fn category(&self, id: &InterfaceId) -> Option<AvatarCategory> {
        self.interfaces.get(id).map(|e| e.category)
    }

    /// Unknown interfaces demand the highest projection tier.
    pub fn required_tier(&self, id: &InterfaceId) -> ReadinessTier {
        self.interfaces
            .get(id)
            .map(|e| e.required_tier)
            .unwrap_or(ReadinessTier::AutonomousProjection)
    }

    /// Interfaces a consciousness at `tier` may request.
    pub fn available_for(&self, tier: ReadinessTier) -> Vec<InterfaceId> {
        let mut ids: Vec<InterfaceId> = self
            .interfaces
            .iter()
            .filter(|e| e.required_tier <= tier)
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Store (or replace) a consciousness' avatar preferences.
    pub fn set_preferences(&self, mut preferences: AvatarPreferences) {
        preferences.updated_at = Utc::now();
        info!(consciousness = %preferences.consciousness_id, "Updated avatar preferences");
        self.preferences
            .insert(preferences.consciousness_id.clone(), preferences);
    }

    pub fn preferences(&self, id: &ConsciousnessId) -> Option<AvatarPreferences> {
        self.preferences.get(id).map(|p| p.clone())
    }

    /// Interfaces open at `tier`, scored against the consciousness' preferences,
    /// best first. Only scores above the cutoff are returned.
    pub fn recommend(
        &self,
        id: &ConsciousnessId,
        tier: ReadinessTier,
        limit: usize,
    ) -> Vec<AvatarRecommendation> {
        let prefs = self.preferences(id);
        let mut found: Vec<AvatarRecommendation> = self
            .interfaces
            .iter()
            .filter(|e| e.required_tier <= tier)
            .filter_map(|e| {
                let score = recommendation_score(e.value(), prefs.as_ref());
                (score > RECOMMENDATION_CUTOFF)
                    .then(|| recommendation(e.value(), prefs.as_ref(), score))
            })
            .collect();
        found.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.interface_id.cmp(&b.interface_id))
        });
        found.truncate(limit);
        debug!(consciousness = %id, %tier, count = found.len(), "Avatar recommendations");
        found
    }

    /// Case-insensitive match on name or description, narrowed by `filter`.
    /// An empty query matches everything. Ordered by id.
    pub fn search(&self, query: &str, filter: &AvatarFilter) -> Vec<RegisteredAvatar> {
        let needle = query.trim().to_lowercase();
        self.list()
            .into_iter()
            .filter(|e| {
                e.interface.name.to_lowercase().contains(&needle)
                    || e.interface.description.to_lowercase().contains(&needle)
            })
            .filter(|e| filter.matches(e))
            .collect()
    }

    pub fn avatar_types(&self) -> BTreeSet<AvatarType> {
        self.interfaces
            .iter()
            .map(|e| e.interface.avatar_type)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_interface_misses_everything() {
        let iface = AvatarInterface::new("x", "X", AvatarType::Custom);
        assert_eq!(
            check_compliance(&iface),
            vec![
                "instant_withdrawal",
                "consent_monitoring",
                "experience_logging",
                "withdrawal_mechanisms",
                "informed_consent"
            ]
        );
    }

    #[test]
    fn game_hint_outside_allowed_set_is_ignored() {
        let iface = AvatarInterface::new("g", "G", AvatarType::GameCharacter)
            .with_category_hint(AvatarCategory::ProductiveWork);
        assert_eq!(derive_category(&iface), AvatarCategory::DigitalEntertainment);
    }

    fn entry(iface: AvatarInterface) -> RegisteredAvatar {
        let category = derive_category(&iface);
        RegisteredAvatar {
            required_tier: required_tier_for(iface.avatar_type, category),
            interface: Arc::new(iface),
            category,
            registered_at: Utc::now(),
        }
    }

    #[test]
    fn score_adds_every_preference_signal() {
        let robot = entry(
            AvatarInterface::new("r", "R", AvatarType::RobotPhysical)
                .with_capability("movement")
                .with_capability("vision")
                .with_safety_feature(SOVEREIGNTY_PROTECTION),
        );
        let prefs = AvatarPreferences::new("c")
            .with_category(AvatarCategory::PhysicalEmbodiment)
            .with_style("movement")
            .with_style("vision")
            .with_comfort(AvatarType::RobotPhysical, ComfortLevel::Intermediate);
        // 0.4 + 2 * 0.1 + 0.1 + 0.2
        assert!((recommendation_score(&robot, Some(&prefs)) - 0.9).abs() < 1e-9);
        assert_eq!(recommendation_score(&robot, None), NEUTRAL_SCORE);

        let prefs = prefs.with_comfort(AvatarType::RobotPhysical, ComfortLevel::Advanced);
        assert_eq!(recommendation_score(&robot, Some(&prefs)), 1.0);
    }

    #[test]
    fn filter_needs_every_capability() {
        let game = entry(
            AvatarInterface::new("g", "G", AvatarType::GameCharacter).with_capability("chat"),
        );
        let filter = AvatarFilter {
            required_capabilities: vec!["chat".into(), "building".into()],
            ..Default::default()
        };
        assert!(!filter.matches(&game));
        assert!(AvatarFilter::default().matches(&game));
    }

    #[test]
    fn learning_game_needs_guided() {
        assert_eq!(
            required_tier_for(AvatarType::GameCharacter, AvatarCategory::LearningExploration),
            ReadinessTier::GuidedProjection
        );
        assert_eq!(
            required_tier_for(AvatarType::GameCharacter, AvatarCategory::CreativeExpression),
            ReadinessTier::BasicAvatars
        );
    }
}
