/// Property-based tests for the routing and status invariants
use conversa_core::identity::{normalize_email, normalize_phone};
use conversa_core::models::{Channel, Handler, MessageStatus};
use proptest::prelude::*;

/// Position on the forward ladder.
fn ladder_position(status: MessageStatus) -> u8 {
    match status {
        MessageStatus::Pending => 0,
        MessageStatus::Sent => 1,
        MessageStatus::Delivered => 2,
        MessageStatus::Read => 3,
        MessageStatus::Failed => 4,
    }
}

fn arb_status() -> impl Strategy<Value = MessageStatus> {
    prop_oneof![
        Just(MessageStatus::Pending),
        Just(MessageStatus::Sent),
        Just(MessageStatus::Delivered),
        Just(MessageStatus::Read),
        Just(MessageStatus::Failed),
    ]
}

proptest! {
    /// No sequence of reported statuses can move a message backwards on the
    /// ladder, and nothing leaves the failed state.
    #[test]
    fn status_fold_never_regresses(reports in prop::collection::vec(arb_status(), 0..20)) {
        let mut current = MessageStatus::Pending;
        let mut seen_failed = false;

        for reported in reports {
            let before = current;
            if current.can_advance_to(reported) {
                current = reported;
            }

            if current == MessageStatus::Failed {
                if current != before {
                    // Failed is only reachable directly from pending.
                    prop_assert_eq!(before, MessageStatus::Pending);
                }
                seen_failed = true;
            } else {
                prop_assert!(ladder_position(current) >= ladder_position(before));
            }

            if seen_failed {
                prop_assert_eq!(current, MessageStatus::Failed);
            }
        }
    }

    /// Duplicate callbacks are no-ops: a status never advances to itself.
    #[test]
    fn duplicate_report_is_ignored(status in arb_status()) {
        prop_assert!(!status.can_advance_to(status));
    }

    /// Toggling twice lands back where it started.
    #[test]
    fn toggle_is_an_involution(start_is_human in any::<bool>()) {
        let start = if start_is_human { Handler::Human } else { Handler::Agent };
        prop_assert_eq!(start.toggled().toggled(), start);
    }

    /// A normalized phone is digits with an optional leading plus, and its
    /// digit count stays within bounds. Anything else normalizes to None.
    #[test]
    fn normalized_phone_shape(raw in "\\PC{0,30}") {
        if let Some(normalized) = normalize_phone(&raw) {
            let rest = normalized.strip_prefix('+').unwrap_or(&normalized);
            prop_assert!(rest.chars().all(|c| c.is_ascii_digit()));
            prop_assert!((8..=15).contains(&rest.len()));
        }
    }

    /// Normalizing an already-normalized phone is a fixed point.
    #[test]
    fn phone_normalization_idempotent(raw in "\\+?[0-9 ()-]{8,20}") {
        if let Some(once) = normalize_phone(&raw) {
            prop_assert_eq!(normalize_phone(&once), Some(once));
        }
    }

    /// Normalized emails are lowercase, and normalization is idempotent.
    #[test]
    fn email_normalization_lowercases(raw in "[a-zA-Z0-9._]{1,10}@[a-zA-Z0-9]{1,10}\\.[a-zA-Z]{2,4}") {
        let normalized = normalize_email(&raw);
        prop_assert!(normalized.is_some());
        let value = normalized.unwrap();
        prop_assert_eq!(value.clone(), value.to_lowercase());
        prop_assert_eq!(normalize_email(&value), Some(value));
    }

    /// Channel parsing is total: any label yields a channel whose own label
    /// round-trips.
    #[test]
    fn channel_parsing_is_total(raw in "\\PC{0,20}") {
        let channel = Channel::from_label(&raw);
        prop_assert_eq!(Channel::from_label(channel.as_str()), channel);
    }
}
