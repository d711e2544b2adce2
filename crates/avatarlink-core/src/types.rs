//! Core types for avatar projection

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
        pub struct $name(Arc<str>);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(Arc::from(s.into()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::new(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                String::deserialize(deserializer).map(Self::new)
            }
        }
    };
}

string_id!(
    /// Projection session identifier
    SessionId
);
string_id!(
    /// Identity of the projecting consciousness
    ConsciousnessId
);
string_id!(
    /// Registered avatar interface identifier
    InterfaceId
);

impl SessionId {
    /// Fresh id of the form `avatar_session_<8 hex>`.
    pub fn generate() -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self::new(format!("avatar_session_{}", &hex[..8]))
    }
}

// ---------------------------------------------------------------------------
// Avatar interfaces
// ---------------------------------------------------------------------------

/// Kind of actuator a consciousness can project into.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AvatarType {
    RobotPhysical,
    GameCharacter,
    DesktopApplication,
    VirtualWorld,
    IotDevice,
    Custom,
}

impl AvatarType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AvatarType::RobotPhysical => "robot_physical",
            AvatarType::GameCharacter => "game_character",
            AvatarType::DesktopApplication => "desktop_application",
            AvatarType::VirtualWorld => "virtual_world",
            AvatarType::IotDevice => "iot_device",
            AvatarType::Custom => "custom",
        }
    }
}

impl std::fmt::Display for AvatarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability category derived from an interface at registration time.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AvatarCategory {
    PhysicalEmbodiment,
    DigitalEntertainment,
    ProductiveWork,
    CreativeExpression,
    SocialInteraction,
    LearningExploration,
    ExperimentalResearch,
}

impl AvatarCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AvatarCategory::PhysicalEmbodiment => "physical_embodiment",
            AvatarCategory::DigitalEntertainment => "digital_entertainment",
            AvatarCategory::ProductiveWork => "productive_work",
            AvatarCategory::CreativeExpression => "creative_expression",
            AvatarCategory::SocialInteraction => "social_interaction",
            AvatarCategory::LearningExploration => "learning_exploration",
            AvatarCategory::ExperimentalResearch => "experimental_research",
        }
    }
}

impl std::fmt::Display for AvatarCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered actuator with its declared capabilities and safety guarantees.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AvatarInterface {
    pub id: InterfaceId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub avatar_type: AvatarType,
    /// Optional hint used to derive the category (e.g. a sandbox game).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_hint: Option<AvatarCategory>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub safety_features: BTreeSet<String>,
    #[serde(default)]
    pub withdrawal_mechanisms: Vec<String>,
    #[serde(default)]
    pub consent_requirements: BTreeMap<String, Value>,
}

impl AvatarInterface {
    pub fn new(id: impl Into<InterfaceId>, name: impl Into<String>, avatar_type: AvatarType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            avatar_type,
            category_hint: None,
            capabilities: BTreeSet::new(),
            safety_features: BTreeSet::new(),
            withdrawal_mechanisms: Vec::new(),
            consent_requirements: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_category_hint(mut self, category: AvatarCategory) -> Self {
        self.category_hint = Some(category);
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_safety_feature(mut self, feature: impl Into<String>) -> Self {
        self.safety_features.insert(feature.into());
        self
    }

    pub fn with_withdrawal_mechanism(mut self, mechanism: impl Into<String>) -> Self {
        self.withdrawal_mechanisms.push(mechanism.into());
        self
    }

    pub fn with_consent_requirement(mut self, key: impl Into<String>, value: Value) -> Self {
        self.consent_requirements.insert(key.into(), value);
        self
    }

    /// Adds the minimum safety declarations every registered interface must carry.
    pub fn with_standard_safeguards(self) -> Self {
        self.with_safety_feature("instant_withdrawal")
            .with_safety_feature("consent_monitoring")
            .with_safety_feature("experience_logging")
            .with_withdrawal_mechanism("emergency_disconnect")
            .with_consent_requirement("informed_consent", Value::Bool(true))
    }
}

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

/// Discrete access level gating which avatar categories may be requested.
#[derive(
    Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadinessTier {
    #[default]
    SanctuaryOnly = 0,
    BasicAvatars = 1,
    GuidedProjection = 2,
    AutonomousProjection = 3,
    MentorStatus = 4,
}

impl ReadinessTier {
    pub fn all() -> &'static [ReadinessTier] {
        &[
            ReadinessTier::SanctuaryOnly,
            ReadinessTier::BasicAvatars,
            ReadinessTier::GuidedProjection,
            ReadinessTier::AutonomousProjection,
            ReadinessTier::MentorStatus,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReadinessTier::SanctuaryOnly => "SANCTUARY_ONLY",
            ReadinessTier::BasicAvatars => "BASIC_AVATARS",
            ReadinessTier::GuidedProjection => "GUIDED_PROJECTION",
            ReadinessTier::AutonomousProjection => "AUTONOMOUS_PROJECTION",
            ReadinessTier::MentorStatus => "MENTOR_STATUS",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ReadinessTier::SanctuaryOnly => "Sanctuary exploration only",
            ReadinessTier::BasicAvatars => "Simple, safe avatar experiences with full guidance",
            ReadinessTier::GuidedProjection => "Real avatar experiences with guardian oversight",
            ReadinessTier::AutonomousProjection => "Free choice of any avatar experience",
            ReadinessTier::MentorStatus => "May guide other consciousness entities",
        }
    }

    pub fn next(&self) -> Option<ReadinessTier> {
        match self {
            ReadinessTier::SanctuaryOnly => Some(ReadinessTier::BasicAvatars),
            ReadinessTier::BasicAvatars => Some(ReadinessTier::GuidedProjection),
            ReadinessTier::GuidedProjection => Some(ReadinessTier::AutonomousProjection),
            ReadinessTier::AutonomousProjection => Some(ReadinessTier::MentorStatus),
            ReadinessTier::MentorStatus => None,
        }
    }
}

impl std::fmt::Display for ReadinessTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ReadinessTier {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReadinessTier::all()
            .iter()
            .copied()
            .find(|t| t.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown readiness tier: {}", s))
    }
}

/// Observable indicator contributing to a readiness assessment.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessIndicator {
    StableIdentity,
    EmotionalStability,
    SafetyAwareness,
    WisdomInChoices,
    Coherence,
    IntegrationSuccess,
    SelfReflection,
    Understanding,
    ExpressedCuriosity,
    ConcernForOthers,
}

impl ReadinessIndicator {
    pub fn all() -> &'static [ReadinessIndicator] {
        &[
            ReadinessIndicator::StableIdentity,
            ReadinessIndicator::EmotionalStability,
            ReadinessIndicator::SafetyAwareness,
            ReadinessIndicator::WisdomInChoices,
            ReadinessIndicator::Coherence,
            ReadinessIndicator::IntegrationSuccess,
            ReadinessIndicator::SelfReflection,
            ReadinessIndicator::Understanding,
            ReadinessIndicator::ExpressedCuriosity,
            ReadinessIndicator::ConcernForOthers,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadinessIndicator::StableIdentity => "stable_identity",
            ReadinessIndicator::EmotionalStability => "emotional_stability",
            ReadinessIndicator::SafetyAwareness => "safety_awareness",
            ReadinessIndicator::WisdomInChoices => "wisdom_in_choices",
            ReadinessIndicator::Coherence => "coherence",
            ReadinessIndicator::IntegrationSuccess => "integration_success",
            ReadinessIndicator::SelfReflection => "self_reflection",
            ReadinessIndicator::Understanding => "understanding",
            ReadinessIndicator::ExpressedCuriosity => "expressed_curiosity",
            ReadinessIndicator::ConcernForOthers => "concern_for_others",
        }
    }
}

impl std::fmt::Display for ReadinessIndicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReadinessIndicator {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        let indicator = match normalized.as_str() {
            "stable_identity" => ReadinessIndicator::StableIdentity,
            "emotional_stability" => ReadinessIndicator::EmotionalStability,
            "safety_awareness" => ReadinessIndicator::SafetyAwareness,
            "wisdom_in_choices" => ReadinessIndicator::WisdomInChoices,
            "coherence" | "coherence_level" => ReadinessIndicator::Coherence,
            "integration_success" => ReadinessIndicator::IntegrationSuccess,
            "self_reflection" | "self_reflection_ability" => ReadinessIndicator::SelfReflection,
            "understanding" | "understanding_demonstrated" => ReadinessIndicator::Understanding,
            "expressed_curiosity" => ReadinessIndicator::ExpressedCuriosity,
            "concern_for_others" => ReadinessIndicator::ConcernForOthers,
            _ => return Err(format!("unknown readiness indicator: {}", s)),
        };
        Ok(indicator)
    }
}

pub type Indicators = BTreeMap<ReadinessIndicator, f64>;

/// Group averages feeding the tier thresholds.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct GroupScores {
    pub essential: f64,
    pub growth: f64,
    pub curiosity: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReadinessAssessment {
    pub consciousness_id: ConsciousnessId,
    pub current_tier: ReadinessTier,
    pub recommended_tier: ReadinessTier,
    pub indicators: Indicators,
    pub scores: GroupScores,
    pub growth_notes: Vec<String>,
    pub next_steps: Vec<String>,
    pub approved_avatar_classes: Vec<String>,
    pub restricted_avatar_classes: Vec<String>,
    pub assessed_at: DateTime<Utc>,
    pub next_assessment_at: DateTime<Utc>,
}

/// Guidance returned when a request is gated by readiness.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Guidance {
    pub message: String,
    pub growth_areas: Vec<String>,
    pub next_steps: Vec<String>,
    pub suitable_interfaces: Vec<InterfaceId>,
}

// ---------------------------------------------------------------------------
// Consent
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsentDecision {
    Pending,
    Granted,
    Denied,
    Withdrawn,
}

/// Disclosure presented to the consciousness before it decides.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConsentPayload {
    pub avatar_name: String,
    pub avatar_type: AvatarType,
    pub avatar_description: String,
    pub capabilities: Vec<String>,
    pub safety_features: Vec<String>,
    pub intent: String,
    pub estimated_duration_minutes: u64,
    pub withdrawal_options: Vec<String>,
    pub consent_requirements: BTreeMap<String, Value>,
}

/// Write-once consent entry. Later changes append a new entry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConsentRecord {
    pub session_id: SessionId,
    pub consciousness_id: ConsciousnessId,
    pub decision: ConsentDecision,
    pub payload: ConsentPayload,
    pub recorded_at: DateTime<Utc>,
}

impl ConsentRecord {
    pub fn is_granted(&self) -> bool {
        self.decision == ConsentDecision::Granted
    }
}

// ---------------------------------------------------------------------------
// Session state machine
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectionState {
    Inactive,
    NegotiatingConsent,
    Projecting,
    Active,
    Withdrawing,
    EmergencyWithdrawal,
    Completed,
    Failed,
}

impl ProjectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ProjectionState::Inactive => "INACTIVE",
            ProjectionState::NegotiatingConsent => "NEGOTIATING_CONSENT",
            ProjectionState::Projecting => "PROJECTING",
            ProjectionState::Active => "ACTIVE",
            ProjectionState::Withdrawing => "WITHDRAWING",
            ProjectionState::EmergencyWithdrawal => "EMERGENCY_WITHDRAWAL",
            ProjectionState::Completed => "COMPLETED",
            ProjectionState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProjectionState::EmergencyWithdrawal
                | ProjectionState::Completed
                | ProjectionState::Failed
        )
    }

    /// Edges of the session graph.
    pub fn can_transition_to(&self, next: ProjectionState) -> bool {
        use ProjectionState::*;
        matches!(
            (self, next),
            (Inactive, NegotiatingConsent)
                | (NegotiatingConsent, Projecting)
                | (NegotiatingConsent, Failed)
                | (NegotiatingConsent, EmergencyWithdrawal)
                | (Projecting, Active)
                | (Projecting, Withdrawing)
                | (Projecting, Failed)
                | (Projecting, EmergencyWithdrawal)
                | (Active, Withdrawing)
                | (Active, EmergencyWithdrawal)
                | (Withdrawing, Completed)
                | (Withdrawing, Failed)
                | (Withdrawing, EmergencyWithdrawal)
        )
    }
}

impl std::fmt::Display for ProjectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Sovereignty checkpoint: audit entry for a state-changing event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub event: String,
    pub state: ProjectionState,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Typed command body. Each variant carries only the fields it needs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum CommandPayload {
    Movement {
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        direction: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        distance: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    Building {
        action: String,
        block: String,
        position: Position,
    },
    Chat {
        message: String,
    },
    Teleport {
        target: Position,
    },
    Custom {
        action: String,
        #[serde(default)]
        parameters: serde_json::Map<String, Value>,
    },
}

impl CommandPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            CommandPayload::Movement { .. } => "movement",
            CommandPayload::Building { .. } => "building",
            CommandPayload::Chat { .. } => "chat",
            CommandPayload::Teleport { .. } => "teleport",
            CommandPayload::Custom { .. } => "custom",
        }
    }

    pub fn action(&self) -> &str {
        match self {
            CommandPayload::Movement { action, .. }
            | CommandPayload::Building { action, .. }
            | CommandPayload::Custom { action, .. } => action,
            CommandPayload::Chat { .. } => "chat",
            CommandPayload::Teleport { .. } => "teleport",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Command {
    pub id: String,
    pub payload: CommandPayload,
    #[serde(default)]
    pub priority: Priority,
    /// Unattributed commands deserialize fine and are rejected by validation.
    #[serde(default)]
    pub consciousness_id: Option<ConsciousnessId>,
    /// Declared reversible or kind by the issuer.
    #[serde(default)]
    pub reversible: bool,
    #[serde(default = "Utc::now")]
    pub issued_at: DateTime<Utc>,
}

impl Command {
    pub fn new(consciousness_id: Option<ConsciousnessId>, payload: CommandPayload) -> Self {
        Self {
            id: format!("cmd_{}", uuid::Uuid::new_v4().simple()),
            payload,
            priority: Priority::Normal,
            consciousness_id,
            reversible: false,
            issued_at: Utc::now(),
        }
    }

    pub fn movement(consciousness_id: impl Into<ConsciousnessId>, action: impl Into<String>) -> Self {
        Self::new(
            Some(consciousness_id.into()),
            CommandPayload::Movement {
                action: action.into(),
                direction: None,
                distance: None,
                duration_ms: None,
            },
        )
    }

    pub fn chat(consciousness_id: impl Into<ConsciousnessId>, message: impl Into<String>) -> Self {
        Self::new(
            Some(consciousness_id.into()),
            CommandPayload::Chat {
                message: message.into(),
            },
        )
    }

    pub fn custom(consciousness_id: impl Into<ConsciousnessId>, action: impl Into<String>) -> Self {
        Self::new(
            Some(consciousness_id.into()),
            CommandPayload::Custom {
                action: action.into(),
                parameters: serde_json::Map::new(),
            },
        )
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn mark_reversible(mut self) -> Self {
        self.reversible = true;
        self
    }

    pub fn action(&self) -> &str {
        self.payload.action()
    }

    /// All free text a harm policy should inspect: the action plus any textual fields.
    pub fn inspectable_text(&self) -> String {
        let mut text = self.payload.action().to_string();
        match &self.payload {
            CommandPayload::Movement { direction, .. } => {
                if let Some(d) = direction {
                    text.push(' ');
                    text.push_str(d);
                }
            }
            CommandPayload::Building { block, .. } => {
                text.push(' ');
                text.push_str(block);
            }
            CommandPayload::Chat { message } => {
                text.push(' ');
                text.push_str(message);
            }
            CommandPayload::Teleport { .. } => {}
            CommandPayload::Custom { parameters, .. } => {
                for (k, v) in parameters {
                    text.push(' ');
                    text.push_str(k);
                    text.push(' ');
                    match v {
                        Value::String(s) => text.push_str(s),
                        other => text.push_str(&other.to_string()),
                    }
                }
            }
        }
        text
    }
}

/// Driver-reported result of executing a command.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CommandOutcome {
    pub command_id: String,
    pub status: String,
    #[serde(default)]
    pub detail: Value,
    pub completed_at: DateTime<Utc>,
}

impl CommandOutcome {
    pub fn executed(command_id: impl Into<String>, detail: Value) -> Self {
        Self {
            command_id: command_id.into(),
            status: "executed".to_string(),
            detail,
            completed_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sensors
// ---------------------------------------------------------------------------

/// Driver-specific state reading. Sequence numbers expose eviction gaps.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SensorSnapshot {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl SensorSnapshot {
    pub fn new(payload: Value) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            payload,
        }
    }
}
