//! Property-Based Tests for the Quota Engine
//!
//! Invariants checked against random inputs:
//!
//! - **Calendar days**: every instant falls in exactly one reference day,
//!   whatever the offset or reset hour
//! - **Rolling windows**: an event counts iff `now - d < occurred_at <= now`
//! - **Monotonic admission**: with limit `L`, `K` check-and-consume attempts
//!   record exactly `min(K, L)` events
//! - **Backoff**: retry delays stay within the configured cap plus jitter
//!
//! # Running the Tests
//!
//! ```bash
//! cargo test --lib quota::proptests
//! ```

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::sync::Arc;

use crate::quota::clock::ManualClock;
use crate::quota::config::GuardConfig;
use crate::quota::guard::QuotaGuard;
use crate::quota::ledger::{InMemoryLedger, TimeRange};
use crate::quota::policy::{
    ActionType, PolicyEntry, PolicyStrategy, PolicyTable, SubscriptionTier, UsageScope,
    WindowSpec,
};
use crate::quota::retry::{calculate_retry_delay, RetryConfig, RetryDecision};
use crate::quota::user::{InMemoryUserDirectory, User};
use crate::quota::window::ReferenceCalendar;

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn arb_instant() -> impl Strategy<Value = DateTime<Utc>> {
    // Roughly two years of milliseconds
    (0i64..63_072_000_000).prop_map(|ms| base() + Duration::milliseconds(ms))
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// ============================================================================
// Property 1: Calendar day boundaries
// ============================================================================

proptest! {
    #[test]
    fn prop_instant_lies_in_its_day(
        instant in arb_instant(),
        offset_secs in -50_400i32..=50_400,
        reset_hour in 0u32..24,
    ) {
        let calendar = ReferenceCalendar::with_offset_secs(offset_secs).unwrap();
        let range = calendar.day_range(instant, reset_hour);

        prop_assert!(range.start <= instant);
        prop_assert!(instant < range.end);
        prop_assert_eq!(range.end - range.start, Duration::days(1));
        prop_assert_eq!(calendar.day_start(range.start, reset_hour), range.start);
    }

    #[test]
    fn prop_first_day_matches_day_start(
        created in arb_instant(),
        later_ms in 0i64..259_200_000,
        reset_hour in 0u32..24,
    ) {
        let calendar = ReferenceCalendar::utc();
        let now = created + Duration::milliseconds(later_ms);
        let same_day = now < calendar.day_range(created, reset_hour).end;
        prop_assert_eq!(calendar.is_first_day(created, now, reset_hour), same_day);
    }
}

// ============================================================================
// Property 2: Rolling window membership
// ============================================================================

proptest! {
    #[test]
    fn prop_trailing_window_membership(
        now in arb_instant(),
        duration_secs in 1i64..86_400,
        event_offset_ms in -100_000_000i64..1_000,
    ) {
        let duration = Duration::seconds(duration_secs);
        let range = TimeRange::trailing(now, duration).unwrap();
        let event = now + Duration::milliseconds(event_offset_ms);

        let expected = event > now - duration && event <= now;
        prop_assert_eq!(range.contains(event), expected);
    }
}

// ============================================================================
// Property 3: Monotonic admission
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_admission_stops_at_limit(limit in 1u32..12, attempts in 1usize..30) {
        let now = Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();
        let table = PolicyTable::empty().with_entry(PolicyEntry::new(
            SubscriptionTier::Free,
            UsageScope::AllActions,
            limit,
            WindowSpec::calendar_day(),
        ));
        let user = User::new("prop-user", now - Duration::days(3), SubscriptionTier::Free);
        let ledger = Arc::new(InMemoryLedger::new());
        let guard = QuotaGuard::new(
            GuardConfig::with_policy(table),
            Arc::new(InMemoryUserDirectory::from_users([user])),
            ledger.clone(),
            Arc::new(ManualClock::new(now)),
        )
        .unwrap();

        let (recorded, final_allowed) = runtime().block_on(async {
            let mut recorded = 0usize;
            for i in 0..attempts {
                let action = ActionType::ALL[i % ActionType::ALL.len()];
                let outcome = guard
                    .check_and_consume_at("prop-user", action, PolicyStrategy::Tiered, now, None)
                    .await
                    .unwrap();
                if outcome.recorded.is_some() {
                    recorded += 1;
                }
            }
            let decision = guard
                .check_at("prop-user", ActionType::Explanation, PolicyStrategy::Tiered, now)
                .await
                .unwrap();
            (recorded, decision.allowed)
        });

        prop_assert_eq!(recorded, attempts.min(limit as usize));
        prop_assert_eq!(final_allowed, attempts < limit as usize);
    }
}

// ============================================================================
// Property 4: Backoff bounds
// ============================================================================

proptest! {
    #[test]
    fn prop_retry_delay_is_bounded(
        attempt in 0u32..10,
        base_delay_ms in 1u64..1_000,
        max_delay_ms in 1u64..10_000,
    ) {
        let config = RetryConfig {
            base_delay_ms,
            max_retries: 5,
            max_delay_ms,
            ..RetryConfig::default()
        };
        match calculate_retry_delay(attempt, &config) {
            RetryDecision::Retry(ms) => {
                prop_assert!(attempt < 5);
                let capped = base_delay_ms.saturating_mul(2u64.pow(attempt)).min(max_delay_ms);
                prop_assert!(ms <= capped + capped / 5);
                prop_assert!(ms >= capped - capped / 5);
            }
            RetryDecision::GiveUp => prop_assert!(attempt >= 5),
        }
    }
}
