//! Property-based tests for core components using proptest.

use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use irflow_core::approval::{AutoApprovalEngine, IncidentSnapshot, ProposedAction, risk_score};
use irflow_core::collaborators::{Collaborators, ManualClock};
use irflow_core::recovery::{ErrorClassification, RecoveryContext, RecoveryManager};
use irflow_core::{IncidentState, StateMachine, TransitionContext};
use serde_json::json;

fn arb_state() -> impl Strategy<Value = IncidentState> {
    (0..IncidentState::ALL.len()).prop_map(|i| IncidentState::ALL[i])
}

fn arb_context() -> impl Strategy<Value = TransitionContext> {
    (
        prop::option::of(0.0f64..=1.0),
        prop::option::of(any::<bool>()),
        any::<bool>(),
        prop::option::of("[a-z]{0,6}"),
        any::<bool>(),
        prop::collection::vec(prop::sample::select(vec!["completed", "failed", "pending"]), 0..4),
    )
        .prop_map(|(confidence, threat, auto, approver, rejected, statuses)| {
            let mut ctx = TransitionContext::new()
                .with("auto_approved", auto)
                .with("rejected", rejected);
            if let Some(c) = confidence {
                ctx.insert("confidence", c);
            }
            if let Some(t) = threat {
                ctx.insert("threat_confirmed", t);
            }
            if let Some(a) = approver {
                ctx.insert("approved_by", a);
            }
            let actions: Vec<_> = statuses.iter().map(|s| json!({ "status": s })).collect();
            ctx.insert("actions", actions);
            ctx
        })
}

// --- State machine properties ---

proptest! {
    #[test]
    fn state_changes_only_on_successful_transition(
        steps in prop::collection::vec((arb_state(), arb_context()), 1..40)
    ) {
        let sm = StateMachine::new();
        let mut accepted = 0;
        for (target, ctx) in &steps {
            let before = sm.current_state("inc");
            if sm.transition("inc", *target, "prop", ctx) {
                accepted += 1;
                prop_assert_eq!(sm.current_state("inc"), *target);
            } else {
                prop_assert_eq!(sm.current_state("inc"), before);
            }
        }
        prop_assert_eq!(sm.history("inc").len(), accepted);
    }

    #[test]
    fn can_transition_implies_transition(
        prefix in prop::collection::vec((arb_state(), arb_context()), 0..20),
        target in arb_state(),
        ctx in arb_context(),
    ) {
        let sm = StateMachine::new();
        for (state, c) in &prefix {
            sm.transition("inc", *state, "prop", c);
        }
        if sm.can_transition("inc", target, &ctx) {
            prop_assert!(sm.transition("inc", target, "prop", &ctx));
            prop_assert_eq!(sm.current_state("inc"), target);
        }
    }

    #[test]
    fn allowed_transitions_is_idempotent_and_consistent(
        prefix in prop::collection::vec((arb_state(), arb_context()), 0..20),
        ctx in arb_context(),
    ) {
        let sm = StateMachine::new();
        for (state, c) in &prefix {
            sm.transition("inc", *state, "prop", c);
        }
        let first = sm.allowed_transitions("inc", &ctx);
        let history = sm.history("inc");
        prop_assert_eq!(&first, &sm.allowed_transitions("inc", &ctx));
        prop_assert_eq!(history, sm.history("inc"));
        for target in &first {
            prop_assert!(sm.can_transition("inc", *target, &ctx));
        }
        if sm.current_state("inc").is_terminal() {
            prop_assert!(first.is_empty());
        }
    }
}

// --- Risk score properties ---

proptest! {
    #[test]
    fn risk_non_increasing_in_confidence(
        action in prop::sample::select(vec!["delete_vm", "block_ip", "get_logs", "ping"]),
        a in 0.0f64..=1.0,
        b in 0.0f64..=1.0,
    ) {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(risk_score(action, None, Some(low)) >= risk_score(action, None, Some(high)));
    }

    #[test]
    fn risk_non_decreasing_in_tier_and_environment(confidence in 0.0f64..=1.0) {
        let tiers = ["ping", "get_logs", "block_ip", "delete_vm"];
        for pair in tiers.windows(2) {
            let lower = risk_score(pair[0], None, Some(confidence));
            let higher = risk_score(pair[1], None, Some(confidence));
            prop_assert!(lower <= higher);
        }
        for action in tiers {
            let plain = risk_score(action, Some("web-01"), Some(confidence));
            let prod = risk_score(action, Some("production-web-01"), Some(confidence));
            prop_assert!(plain <= prod);
            prop_assert!((0.0..=1.0).contains(&prod));
        }
    }
}

// --- Approval properties ---

proptest! {
    #[test]
    fn one_unmatched_action_denies_the_batch(
        actions in prop::collection::vec(
            prop::sample::select(vec!["get_instance", "list_users", "describe_vpc", "query_logs"]),
            1..6,
        ),
        confidence in 0.5f64..=1.0,
        replace in any::<prop::sample::Index>(),
    ) {
        let engine = AutoApprovalEngine::default();
        let incident = IncidentSnapshot {
            id: "inc".into(),
            severity: Some("medium".into()),
            confidence: Some(confidence),
            ..Default::default()
        };
        let mut batch: Vec<_> = actions.iter().map(|a| ProposedAction::new(*a)).collect();
        prop_assert!(engine.can_auto_approve(&incident, &batch).approved);

        let i = replace.index(batch.len());
        batch[i] = ProposedAction::new("frobnicate_widget");
        let outcome = engine.can_auto_approve(&incident, &batch);
        prop_assert!(!outcome.approved);
        prop_assert!(!outcome.assessments[i].approved);
    }
}

// --- Circuit breaker properties ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn breaker_opens_past_retry_ceiling_until_cooldown(failures in 1usize..10, wait in 0u64..600) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let clock = Arc::new(ManualClock::default());
            let sm = Arc::new(StateMachine::new());
            let manager = RecoveryManager::new(sm, Collaborators::in_memory())
                .with_clock(clock.clone())
                .with_scheduler(clock.clone());
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = calls.clone();
            let ctx = RecoveryContext::new().with_retry(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), String>("down".into()) }
            });
            let class = ErrorClassification::PersistenceError;

            for _ in 0..failures {
                manager.handle_error("down", class, None, &ctx).await;
            }
            prop_assert_eq!(calls.load(Ordering::SeqCst), failures.min(3));
            prop_assert_eq!(manager.is_circuit_open(class), failures > 3);

            if failures > 3 {
                let before = calls.load(Ordering::SeqCst);
                clock.advance_secs(wait);
                manager.handle_error("down", class, None, &ctx).await;
                let trial_ran = calls.load(Ordering::SeqCst) > before;
                prop_assert_eq!(trial_ran, wait >= 300);
            }
            Ok(())
        })?;
    }
}
