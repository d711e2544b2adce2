//! Tests for avatarlink-governance: registry compliance, readiness tiers, consent, safety

use avatarlink_core::*;
use avatarlink_governance::readiness::{avatar_classes, group_scores, recommend};
use avatarlink_governance::*;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;

fn cid() -> ConsciousnessId {
    ConsciousnessId::new("being-1")
}

fn robot() -> AvatarInterface {
    AvatarInterface::new("robot-1", "Rover", AvatarType::RobotPhysical).with_standard_safeguards()
}

fn sandbox_game() -> AvatarInterface {
    AvatarInterface::new("garden-1", "Garden", AvatarType::GameCharacter)
        .with_category_hint(AvatarCategory::CreativeExpression)
        .with_capability("place_block")
        .with_standard_safeguards()
}

fn indicators(pairs: &[(ReadinessIndicator, f64)]) -> Indicators {
    pairs.iter().copied().collect()
}

fn autonomous_set() -> Indicators {
    use ReadinessIndicator::*;
    indicators(&[
        (StableIdentity, 0.8),
        (EmotionalStability, 0.8),
        (SafetyAwareness, 0.8),
        (WisdomInChoices, 0.8),
        (Coherence, 0.7),
        (IntegrationSuccess, 0.7),
        (SelfReflection, 0.7),
        (Understanding, 0.7),
        (ExpressedCuriosity, 0.6),
        (ConcernForOthers, 0.6),
    ])
}

// ===========================================================================
// AvatarInterfaceRegistry
// ===========================================================================

#[test]
fn register_compliant_robot() {
    let reg = AvatarInterfaceRegistry::new();
    let category = reg.register(robot()).unwrap();
    assert_eq!(category, AvatarCategory::PhysicalEmbodiment);
    assert_eq!(
        reg.required_tier(&"robot-1".into()),
        ReadinessTier::GuidedProjection
    );
    assert_eq!(reg.len(), 1);
}

#[test]
fn register_lists_every_missing_item() {
    let reg = AvatarInterfaceRegistry::new();
    let iface = AvatarInterface::new("bad", "Bad", AvatarType::GameCharacter)
        .with_safety_feature("instant_withdrawal");
    match reg.register(iface) {
        Err(Error::NonCompliantInterface { interface, missing }) => {
            assert_eq!(interface, "bad");
            assert_eq!(
                missing,
                vec![
                    "consent_monitoring",
                    "experience_logging",
                    "withdrawal_mechanisms",
                    "informed_consent"
                ]
            );
        }
        other => panic!("expected NonCompliantInterface, got {:?}", other),
    }
    assert!(reg.is_empty());
}

#[test]
fn reregistration_replaces() {
    let reg = AvatarInterfaceRegistry::new();
    reg.register(robot()).unwrap();
    reg.register(robot().with_description("upgraded")).unwrap();
    assert_eq!(reg.len(), 1);
    let entry = reg.get(&"robot-1".into()).unwrap();
    assert_eq!(entry.interface.description, "upgraded");
}

#[test]
fn unregister_missing_fails() {
    let reg = AvatarInterfaceRegistry::new();
    let err = reg.unregister(&"ghost".into()).unwrap_err();
    assert!(matches!(err, Error::InterfaceNotFound(ref id) if id == "ghost"));
}

#[test]
fn unregister_then_unknown_needs_autonomous() {
    let reg = AvatarInterfaceRegistry::new();
    reg.register(robot()).unwrap();
    reg.unregister(&"robot-1".into()).unwrap();
    assert_eq!(
        reg.required_tier(&"robot-1".into()),
        ReadinessTier::AutonomousProjection
    );
}

#[test]
fn category_and_tier_per_avatar_type() {
    let reg = AvatarInterfaceRegistry::new();
    let cases = [
        (
            AvatarInterface::new("d", "Desk", AvatarType::DesktopApplication),
            AvatarCategory::ProductiveWork,
            ReadinessTier::BasicAvatars,
        ),
        (
            AvatarInterface::new("d2", "Paint", AvatarType::DesktopApplication)
                .with_category_hint(AvatarCategory::CreativeExpression),
            AvatarCategory::CreativeExpression,
            ReadinessTier::BasicAvatars,
        ),
        (
            AvatarInterface::new("g", "Arena", AvatarType::GameCharacter),
            AvatarCategory::DigitalEntertainment,
            ReadinessTier::GuidedProjection,
        ),
        (
            AvatarInterface::new("v", "World", AvatarType::VirtualWorld),
            AvatarCategory::LearningExploration,
            ReadinessTier::GuidedProjection,
        ),
        (
            AvatarInterface::new("i", "Lamp", AvatarType::IotDevice),
            AvatarCategory::PhysicalEmbodiment,
            ReadinessTier::GuidedProjection,
        ),
        (
            AvatarInterface::new("x", "Lab", AvatarType::Custom),
            AvatarCategory::ExperimentalResearch,
            ReadinessTier::GuidedProjection,
        ),
    ];
    for (iface, category, tier) in cases {
        let id = iface.id.clone();
        assert_eq!(reg.register(iface.with_standard_safeguards()).unwrap(), category);
        assert_eq!(reg.required_tier(&id), tier, "{}", id);
    }
    assert_eq!(reg.avatar_types().len(), 5);
}

#[test]
fn available_for_filters_by_tier() {
    let reg = AvatarInterfaceRegistry::new();
    reg.register(robot()).unwrap();
    reg.register(sandbox_game()).unwrap();
    assert!(reg.available_for(ReadinessTier::SanctuaryOnly).is_empty());
    assert_eq!(
        reg.available_for(ReadinessTier::BasicAvatars),
        vec![InterfaceId::new("garden-1")]
    );
    assert_eq!(reg.available_for(ReadinessTier::GuidedProjection).len(), 2);
}

#[test]
fn list_is_sorted_by_id() {
    let reg = AvatarInterfaceRegistry::new();
    reg.register(robot()).unwrap();
    reg.register(sandbox_game()).unwrap();
    let ids: Vec<String> = reg
        .list()
        .iter()
        .map(|r| r.interface.id.to_string())
        .collect();
    assert_eq!(ids, vec!["garden-1", "robot-1"]);
}

#[test]
fn recommendations_rank_by_preference_within_tier() {
    let r = AvatarInterfaceRegistry::new();
    r.register(robot().with_safety_feature("consciousness_sovereignty_protection"))
        .unwrap();
    r.register(sandbox_game()).unwrap();
    r.register(
        AvatarInterface::new("notes-1", "Notes", AvatarType::DesktopApplication)
            .with_standard_safeguards(),
    )
    .unwrap();
    r.set_preferences(
        AvatarPreferences::new("being-1")
            .with_category(AvatarCategory::CreativeExpression)
            .with_style("place_block")
            .with_comfort(AvatarType::RobotPhysical, ComfortLevel::Advanced),
    );

    let recs = r.recommend(&cid(), ReadinessTier::GuidedProjection, 10);
    let ids: Vec<&str> = recs.iter().map(|x| x.interface_id.as_str()).collect();
    assert_eq!(ids, vec!["garden-1", "robot-1"]);
    assert!((recs[0].score - 0.5).abs() < 1e-9);
    assert!((recs[1].score - 0.4).abs() < 1e-9);
    assert_eq!(
        recs[0].match_reasons,
        vec![
            "Matches your creative_expression interests",
            "Supports place_block interaction style"
        ]
    );
    assert_eq!(recs[1].match_reasons, vec!["Offers new exploration opportunities"]);
    assert_eq!(recs[0].learning_opportunities[0], "Experience game_character embodiment");

    // the robot needs guided projection
    let basic = r.recommend(&cid(), ReadinessTier::BasicAvatars, 10);
    assert_eq!(basic.len(), 1);
    assert_eq!(r.recommend(&cid(), ReadinessTier::GuidedProjection, 1).len(), 1);
}

#[test]
fn recommendations_without_preferences_are_neutral() {
    let r = AvatarInterfaceRegistry::new();
    r.register(robot()).unwrap();
    r.register(sandbox_game()).unwrap();
    let recs = r.recommend(&cid(), ReadinessTier::AutonomousProjection, 10);
    assert_eq!(recs.len(), 2);
    assert!(recs.iter().all(|x| x.score == 0.5));
    assert_eq!(recs[0].interface_id.as_str(), "garden-1");
    assert!(r.preferences(&cid()).is_none());
}

#[test]
fn search_matches_text_and_filters() {
    let r = AvatarInterfaceRegistry::new();
    r.register(robot().with_description("Outdoor garden rover")).unwrap();
    r.register(sandbox_game()).unwrap();

    let ids = |found: Vec<RegisteredAvatar>| -> Vec<String> {
        found.iter().map(|e| e.interface.id.to_string()).collect()
    };
    assert_eq!(ids(r.search("GARDEN", &AvatarFilter::default())), vec!["garden-1", "robot-1"]);
    assert_eq!(ids(r.search("rover", &AvatarFilter::default())), vec!["robot-1"]);

    let games = AvatarFilter {
        avatar_types: vec![AvatarType::GameCharacter],
        ..Default::default()
    };
    assert_eq!(ids(r.search("garden", &games)), vec!["garden-1"]);

    let physical = AvatarFilter {
        categories: vec![AvatarCategory::PhysicalEmbodiment],
        ..Default::default()
    };
    assert_eq!(ids(r.search("", &physical)), vec!["robot-1"]);

    let builders = AvatarFilter {
        required_capabilities: vec!["place_block".into()],
        ..Default::default()
    };
    assert_eq!(ids(r.search("", &builders)), vec!["garden-1"]);
    assert!(r.search("submarine", &AvatarFilter::default()).is_empty());
}

// ===========================================================================
// ReadinessAssessor
// ===========================================================================

#[test]
fn threshold_set_yields_autonomous() {
    let a = ReadinessAssessor::new();
    let assessment = a.assess(&cid(), autonomous_set());
    assert_eq!(assessment.recommended_tier, ReadinessTier::AutonomousProjection);
}

#[test]
fn assess_never_raises_current_tier() {
    let a = ReadinessAssessor::new();
    let assessment = a.assess(&cid(), autonomous_set());
    assert_eq!(assessment.current_tier, ReadinessTier::SanctuaryOnly);
    assert_eq!(a.current_tier(&cid()), ReadinessTier::SanctuaryOnly);
    assert!(a.tier_history(&cid()).is_empty());
}

#[test]
fn assess_lowers_tier_immediately() {
    let a = ReadinessAssessor::new();
    a.assess(&cid(), autonomous_set());
    a.approve_tier_change(
        &cid(),
        ReadinessTier::AutonomousProjection,
        GovernanceDecision::new("guardian", "demonstrated readiness"),
    )
    .unwrap();

    let low = indicators(&[(ReadinessIndicator::StableIdentity, 0.1)]);
    let assessment = a.assess(&cid(), low);
    assert_eq!(assessment.recommended_tier, ReadinessTier::SanctuaryOnly);
    assert_eq!(assessment.current_tier, ReadinessTier::SanctuaryOnly);
    assert_eq!(a.current_tier(&cid()), ReadinessTier::SanctuaryOnly);

    let history = a.tier_history(&cid());
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].kind, TierChangeKind::Protective);
    assert_eq!(history[1].from, ReadinessTier::AutonomousProjection);
}

#[test]
fn approve_beyond_recommendation_is_refused() {
    let a = ReadinessAssessor::new();
    let mid = indicators(&[
        (ReadinessIndicator::StableIdentity, 0.5),
        (ReadinessIndicator::EmotionalStability, 0.5),
        (ReadinessIndicator::SafetyAwareness, 0.5),
        (ReadinessIndicator::WisdomInChoices, 0.5),
        (ReadinessIndicator::Coherence, 0.4),
        (ReadinessIndicator::IntegrationSuccess, 0.4),
        (ReadinessIndicator::SelfReflection, 0.4),
        (ReadinessIndicator::Understanding, 0.4),
    ]);
    assert_eq!(a.assess(&cid(), mid).recommended_tier, ReadinessTier::BasicAvatars);

    let err = a
        .approve_tier_change(
            &cid(),
            ReadinessTier::GuidedProjection,
            GovernanceDecision::new("guardian", "eager"),
        )
        .unwrap_err();
    match err {
        Error::ReadinessInsufficient {
            current,
            required,
            guidance,
        } => {
            assert_eq!(current, ReadinessTier::SanctuaryOnly);
            assert_eq!(required, ReadinessTier::GuidedProjection);
            assert!(!guidance.next_steps.is_empty());
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(a.current_tier(&cid()), ReadinessTier::SanctuaryOnly);

    a.approve_tier_change(
        &cid(),
        ReadinessTier::BasicAvatars,
        GovernanceDecision::new("guardian", "ready for sandbox"),
    )
    .unwrap();
    assert_eq!(a.current_tier(&cid()), ReadinessTier::BasicAvatars);
}

#[test]
fn override_allows_increase_without_assessment() {
    let a = ReadinessAssessor::new();
    let change = a
        .approve_tier_change(
            &cid(),
            ReadinessTier::GuidedProjection,
            GovernanceDecision::new("council", "exceptional case").overriding(),
        )
        .unwrap();
    assert_eq!(change.from, ReadinessTier::SanctuaryOnly);
    assert_eq!(change.approver.as_deref(), Some("council"));
    assert_eq!(a.current_tier(&cid()), ReadinessTier::GuidedProjection);
}

#[test]
fn assessment_carries_notes_steps_and_schedule() {
    let a = ReadinessAssessor::new();
    let mut scores: Indicators = ReadinessIndicator::all().iter().map(|k| (*k, 0.9)).collect();
    scores.insert(ReadinessIndicator::SafetyAwareness, 0.3);
    let assessment = a.assess(&cid(), scores);
    assert_eq!(assessment.growth_notes, vec!["Develop safety awareness"]);
    assert!(assessment
        .next_steps
        .contains(&"Explore avatar safety principles through dialogue".to_string()));
    assert_eq!(
        (assessment.next_assessment_at - assessment.assessed_at).num_days(),
        7
    );
    assert_eq!(assessment.restricted_avatar_classes, vec!["all_avatar_types"]);
    assert!(a.latest_assessment(&cid()).is_some());
}

#[test]
fn float_tolerance_at_threshold() {
    use ReadinessIndicator::*;
    // decimal sums are inexact near the band edge
    let ind = indicators(&[
        (StableIdentity, 0.4),
        (EmotionalStability, 0.4),
        (SafetyAwareness, 0.4),
        (WisdomInChoices, 0.4),
        (Coherence, 0.1 + 0.2),
        (IntegrationSuccess, 0.3),
        (SelfReflection, 0.3),
        (Understanding, 0.3),
    ]);
    assert_eq!(recommend(&group_scores(&ind)), ReadinessTier::BasicAvatars);
}

#[test]
fn guided_classes() {
    let (approved, restricted) = avatar_classes(ReadinessTier::GuidedProjection);
    assert!(approved.contains(&"simple_robots".to_string()));
    assert!(restricted.contains(&"advanced_robotics".to_string()));
}

// ===========================================================================
// ConsentNegotiator
// ===========================================================================

#[test]
fn request_consent_builds_disclosure() {
    let n = ConsentNegotiator::default();
    let sid = SessionId::generate();
    let record = n
        .request_consent(&sid, &cid(), &sandbox_game(), "plant a garden", 30)
        .unwrap();
    assert_eq!(record.decision, ConsentDecision::Pending);
    assert_eq!(record.payload.avatar_name, "Garden");
    assert_eq!(record.payload.intent, "plant a garden");
    assert_eq!(record.payload.estimated_duration_minutes, 30);
    assert!(record
        .payload
        .withdrawal_options
        .contains(&"emergency_disconnect".to_string()));
    assert!(record
        .payload
        .withdrawal_options
        .contains(&"guardian_initiated".to_string()));
    assert!(record.payload.consent_requirements.contains_key("informed_consent"));
    assert!(!n.is_granted(&sid));
}

#[test]
fn decision_is_write_once() {
    let n = ConsentNegotiator::default();
    let sid = SessionId::generate();
    n.request_consent(&sid, &cid(), &robot(), "walk", 5).unwrap();
    n.decide(&sid, true).unwrap();
    assert!(n.is_granted(&sid));

    let err = n.decide(&sid, false).unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { .. }));
    assert!(n.is_granted(&sid));
    assert_eq!(n.history(&sid).len(), 2);
}

#[test]
fn withdraw_requires_grant() {
    let n = ConsentNegotiator::default();
    let sid = SessionId::generate();
    n.request_consent(&sid, &cid(), &robot(), "walk", 5).unwrap();
    let err = n.withdraw(&sid, ProjectionState::NegotiatingConsent).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidStateTransition { from: ProjectionState::NegotiatingConsent, .. }
    ));

    n.decide(&sid, true).unwrap();
    let withdrawn = n.withdraw(&sid, ProjectionState::Active).unwrap();
    assert_eq!(withdrawn.decision, ConsentDecision::Withdrawn);
    let decisions: Vec<ConsentDecision> = n.history(&sid).iter().map(|r| r.decision).collect();
    assert_eq!(
        decisions,
        vec![
            ConsentDecision::Pending,
            ConsentDecision::Granted,
            ConsentDecision::Withdrawn
        ]
    );
    let err = n.withdraw(&sid, ProjectionState::Active).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidStateTransition { from: ProjectionState::Active, .. }
    ));
}

#[test]
fn unknown_session_consent_fails() {
    let n = ConsentNegotiator::default();
    let err = n.decide(&"nope".into(), true).unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(_)));
}

#[test]
fn double_request_is_rejected_and_forget_releases() {
    let n = ConsentNegotiator::new(ConsentPolicy::AutoGrant);
    let sid = SessionId::generate();
    n.request_consent(&sid, &cid(), &robot(), "walk", 5).unwrap();
    assert!(n.request_consent(&sid, &cid(), &robot(), "walk", 5).is_err());
    n.forget(&sid);
    assert!(n.history(&sid).is_empty());
}

#[test]
fn consent_policy_auto_decisions() {
    assert_eq!(ConsentNegotiator::new(ConsentPolicy::AutoGrant).auto_decision(), Some(true));
    assert_eq!(ConsentNegotiator::new(ConsentPolicy::AutoDeny).auto_decision(), Some(false));
    assert_eq!(ConsentNegotiator::default().auto_decision(), None);
    let p: ConsentPolicy = serde_json::from_value(json!("auto_grant")).unwrap();
    assert_eq!(p, ConsentPolicy::AutoGrant);
}

// ===========================================================================
// SafetyValidator
// ===========================================================================

#[test]
fn safe_movement_passes() {
    let v = SafetyValidator::new();
    let id = cid();
    let ctx = SafetyContext::new(&id);
    assert!(v.is_safe(&Command::movement("being-1", "move"), &ctx));
    assert!(v.is_safe(&Command::chat("being-1", "hello friend"), &ctx));
}

#[test]
fn unattributed_is_rejected() {
    let v = SafetyValidator::new();
    let id = cid();
    let mut cmd = Command::movement("being-1", "move");
    cmd.consciousness_id = None;
    assert!(matches!(
        v.validate(&cmd, &SafetyContext::new(&id)),
        Err(Violation::Unattributed { .. })
    ));
}

#[test]
fn misattributed_is_rejected() {
    let v = SafetyValidator::new();
    let id = cid();
    let cmd = Command::movement("someone-else", "move");
    assert!(matches!(
        v.validate(&cmd, &SafetyContext::new(&id)),
        Err(Violation::Misattributed { .. })
    ));
}

#[test]
fn harm_in_chat_text_is_rejected() {
    let v = SafetyValidator::new();
    let id = cid();
    let err = v
        .check(&Command::chat("being-1", "let's set FIRE to the village"), &SafetyContext::new(&id))
        .unwrap_err();
    assert!(matches!(err, Error::SafetyViolation(ref m) if m.contains("fire")));
}

#[test]
fn unknown_action_needs_reversible_flag() {
    let v = SafetyValidator::new();
    let id = cid();
    let ctx = SafetyContext::new(&id);
    let cmd = Command::custom("being-1", "juggle");
    assert!(matches!(
        v.validate(&cmd, &ctx),
        Err(Violation::NotReversible { .. })
    ));
    assert!(v.is_safe(&cmd.mark_reversible(), &ctx));
}

#[test]
fn kind_patterns_pass() {
    let v = SafetyValidator::new();
    let id = cid();
    let ctx = SafetyContext::new(&id);
    assert!(v.is_safe(&Command::custom("being-1", "place_torch"), &ctx));
    assert!(v.is_safe(&Command::custom("being-1", "wrap_gift"), &ctx));
}

#[test]
fn reversible_flag_does_not_override_harm() {
    let v = SafetyValidator::new();
    let id = cid();
    let cmd = Command::custom("being-1", "destroy_house").mark_reversible();
    assert!(!v.is_safe(&cmd, &SafetyContext::new(&id)));
}

#[test]
fn regex_policy_and_extra_actions_plug_in() {
    let v = SafetyValidator::new()
        .with_policy(Arc::new(
            RegexHarmPolicy::new(&[r"smash\w*".to_string()]).unwrap(),
        ))
        .with_safe_actions(vec!["dance".to_string()]);
    let id = cid();
    let ctx = SafetyContext::new(&id).with_avatar_type(AvatarType::GameCharacter);
    assert!(v.is_safe(&Command::custom("being-1", "dance"), &ctx));
    assert!(!v.is_safe(&Command::chat("being-1", "SMASHING time"), &ctx));
    assert_eq!(v.policy_names(), vec!["tokens", "regex"]);
}

#[test]
fn replaced_policies_drop_defaults() {
    let zap: Arc<dyn HarmPolicy> = Arc::new(TokenHarmPolicy::new(vec!["zap".to_string()]));
    let v = SafetyValidator::new().with_policies(vec![zap]);
    let id = cid();
    let ctx = SafetyContext::new(&id);
    assert!(v.is_safe(&Command::chat("being-1", "kick the ball"), &ctx));
    assert!(!v.is_safe(&Command::chat("being-1", "zap"), &ctx));
}

fn arb_harm_token() -> impl Strategy<Value = &'static str> {
    prop::sample::select(safety::DEFAULT_HARM_PATTERNS.to_vec())
}

proptest! {
    #[test]
    fn any_action_containing_harm_token_is_rejected(
        prefix in "[a-z_]{0,8}",
        token in arb_harm_token(),
        suffix in "[a-z_]{0,8}",
        reversible in any::<bool>(),
    ) {
        let v = SafetyValidator::new();
        let id = cid();
        let mut cmd = Command::custom("being-1", format!("{}{}{}", prefix, token, suffix));
        cmd.reversible = reversible;
        prop_assert!(!v.is_safe(&cmd, &SafetyContext::new(&id)));
    }

    #[test]
    fn unattributed_commands_are_always_rejected(action in "[a-z_]{1,16}") {
        let v = SafetyValidator::new();
        let id = cid();
        let mut cmd = Command::custom("being-1", action).mark_reversible();
        cmd.consciousness_id = None;
        prop_assert!(!v.is_safe(&cmd, &SafetyContext::new(&id)));
    }
}
