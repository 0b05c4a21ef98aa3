//! Usage Ledger
//!
//! Append-only store of usage events with range-sum queries. The ledger is
//! the only component that writes events; everything else reads through
//! [`UsageLedger::sum_in_range`].

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::error::{QuotaError, QuotaResult};
use super::policy::{ActionType, UsageScope};

/// One recorded user action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    pub id: Uuid,
    pub user_id: String,
    pub action_type: ActionType,
    pub occurred_at: DateTime<Utc>,
    pub amount: u32,
    /// Caller-supplied token used to suppress duplicate appends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl UsageEvent {
    /// Single-unit event
    pub fn new(user_id: impl Into<String>, action_type: ActionType, occurred_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            action_type,
            occurred_at,
            amount: 1,
            idempotency_key: None,
        }
    }

    pub fn with_amount(mut self, amount: u32) -> Self {
        self.amount = amount;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Reject events that violate ledger invariants
    pub fn validate(&self) -> QuotaResult<()> {
        if self.amount == 0 {
            return Err(QuotaError::Configuration(format!(
                "usage event {} has zero amount",
                self.id
            )));
        }
        if self.user_id.is_empty() {
            return Err(QuotaError::Configuration(format!(
                "usage event {} has no user",
                self.id
            )));
        }
        Ok(())
    }
}

/// Half-open interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The closed-at-now interval `(now - duration, now]`, at nanosecond resolution
    pub fn trailing(now: DateTime<Utc>, duration: Duration) -> QuotaResult<Self> {
        let tick = Duration::nanoseconds(1);
        let start = now
            .checked_sub_signed(duration)
            .and_then(|start| start.checked_add_signed(tick));
        match (start, now.checked_add_signed(tick)) {
            (Some(start), Some(end)) => Ok(Self { start, end }),
            _ => Err(QuotaError::Configuration(format!(
                "trailing window of {}s does not fit before {}",
                duration.num_seconds(),
                now
            ))),
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }
}

/// Result of a range-sum query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageSum {
    pub total: u64,
    /// Earliest matching event, `None` when nothing matched
    pub earliest: Option<DateTime<Utc>>,
}

impl UsageSum {
    /// Fold one event into the sum
    pub fn add(&mut self, amount: u32, occurred_at: DateTime<Utc>) {
        self.total += u64::from(amount);
        self.earliest = Some(match self.earliest {
            Some(e) if e <= occurred_at => e,
            _ => occurred_at,
        });
    }
}

/// Outcome of an append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The event is now visible to queries
    Recorded,
    /// An event with the same idempotency key already exists; nothing written
    Duplicate,
}

/// Durable, append-only usage store
///
/// Appends are all-or-nothing: once `append` returns `Ok`, the event is
/// visible to later `sum_in_range` calls; if the future is dropped before
/// completion, either the whole event is visible or none of it is.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Write-once insert
    async fn append(&self, event: UsageEvent) -> QuotaResult<AppendOutcome>;

    /// Sum of `amount` over the user's events in `scope` with `occurred_at` in `range`
    async fn sum_in_range(
        &self,
        user_id: &str,
        scope: UsageScope,
        range: TimeRange,
    ) -> QuotaResult<UsageSum>;

    /// Per-action totals in `range`
    async fn totals_by_action(
        &self,
        user_id: &str,
        range: TimeRange,
    ) -> QuotaResult<BTreeMap<ActionType, u64>> {
        let mut totals = BTreeMap::new();
        for action in ActionType::ALL {
            let sum = self
                .sum_in_range(user_id, UsageScope::Action(action), range)
                .await?;
            totals.insert(action, sum.total);
        }
        Ok(totals)
    }
}

/// Indexed events, shared by the in-memory and file-backed ledgers
#[derive(Debug, Default)]
pub(crate) struct LedgerState {
    /// Per-user events ordered by `occurred_at`, ties in append order
    events: HashMap<String, Vec<UsageEvent>>,
    idempotency_keys: HashSet<(String, String)>,
}

impl LedgerState {
    /// Index an event; the only mutation of ledger state
    pub(crate) fn apply(&mut self, event: UsageEvent) -> AppendOutcome {
        if let Some(key) = &event.idempotency_key {
            if !self
                .idempotency_keys
                .insert((event.user_id.clone(), key.clone()))
            {
                return AppendOutcome::Duplicate;
            }
        }
        let events = self.events.entry(event.user_id.clone()).or_default();
        let at = events.partition_point(|e| e.occurred_at <= event.occurred_at);
        events.insert(at, event);
        AppendOutcome::Recorded
    }

    pub(crate) fn is_duplicate(&self, event: &UsageEvent) -> bool {
        event
            .idempotency_key
            .as_ref()
            .is_some_and(|key| {
                self.idempotency_keys
                    .contains(&(event.user_id.clone(), key.clone()))
            })
    }

    pub(crate) fn len(&self) -> usize {
        self.events.values().map(Vec::len).sum()
    }

    pub(crate) fn sum(&self, user_id: &str, scope: UsageScope, range: TimeRange) -> UsageSum {
        let mut sum = UsageSum::default();
        let Some(events) = self.events.get(user_id) else {
            return sum;
        };
        let first = events.partition_point(|e| e.occurred_at < range.start);
        for event in events[first..]
            .iter()
            .take_while(|e| e.occurred_at < range.end)
        {
            if scope.includes(event.action_type) {
                sum.add(event.amount, event.occurred_at);
            }
        }
        sum
    }
}

/// In-memory ledger
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded for a user, oldest first
    pub async fn events_for_user(&self, user_id: &str) -> Vec<UsageEvent> {
        let state = self.state.read().await;
        state.events.get(user_id).cloned().unwrap_or_default()
    }

    /// Total number of events across all users
    pub async fn count(&self) -> usize {
        self.state.read().await.len()
    }

    /// Drop every event (tests and replay)
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        *state = LedgerState::default();
    }
}

#[async_trait]
impl UsageLedger for InMemoryLedger {
    async fn append(&self, event: UsageEvent) -> QuotaResult<AppendOutcome> {
        event.validate()?;
        let mut state = self.state.write().await;
        Ok(state.apply(event))
    }

    async fn sum_in_range(
        &self,
        user_id: &str,
        scope: UsageScope,
        range: TimeRange,
    ) -> QuotaResult<UsageSum> {
        let state = self.state.read().await;
        Ok(state.sum(user_id, scope, range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, m, 0).unwrap()
    }

    fn day() -> TimeRange {
        TimeRange::new(t(0, 0), t(0, 0) + Duration::days(1))
    }

    #[tokio::test]
    async fn test_empty_sum_is_not_an_error() {
        let ledger = InMemoryLedger::new();
        let sum = ledger
            .sum_in_range("user-1", UsageScope::AllActions, day())
            .await
            .unwrap();
        assert_eq!(sum, UsageSum::default());
    }

    #[tokio::test]
    async fn test_sum_and_earliest() {
        let ledger = InMemoryLedger::new();
        ledger
            .append(UsageEvent::new("user-1", ActionType::Explanation, t(10, 0)))
            .await
            .unwrap();
        ledger
            .append(UsageEvent::new("user-1", ActionType::Explanation, t(8, 30)).with_amount(2))
            .await
            .unwrap();
        ledger
            .append(UsageEvent::new("user-1", ActionType::ChatMessage, t(7, 0)))
            .await
            .unwrap();

        let sum = ledger
            .sum_in_range("user-1", UsageScope::Action(ActionType::Explanation), day())
            .await
            .unwrap();
        assert_eq!(sum.total, 3);
        assert_eq!(sum.earliest, Some(t(8, 30)));

        let all = ledger
            .sum_in_range("user-1", UsageScope::AllActions, day())
            .await
            .unwrap();
        assert_eq!(all.total, 4);
        assert_eq!(all.earliest, Some(t(7, 0)));
    }

    #[tokio::test]
    async fn test_users_are_isolated() {
        let ledger = InMemoryLedger::new();
        ledger
            .append(UsageEvent::new("user-1", ActionType::FileUpload, t(9, 0)))
            .await
            .unwrap();
        let other = ledger
            .sum_in_range("user-2", UsageScope::AllActions, day())
            .await
            .unwrap();
        assert_eq!(other.total, 0);
    }

    #[tokio::test]
    async fn test_range_is_half_open() {
        let ledger = InMemoryLedger::new();
        ledger
            .append(UsageEvent::new("user-1", ActionType::Explanation, t(12, 0)))
            .await
            .unwrap();

        let ending_at = TimeRange::new(t(11, 0), t(12, 0));
        let starting_at = TimeRange::new(t(12, 0), t(13, 0));
        let scope = UsageScope::AllActions;
        assert_eq!(ledger.sum_in_range("user-1", scope, ending_at).await.unwrap().total, 0);
        assert_eq!(ledger.sum_in_range("user-1", scope, starting_at).await.unwrap().total, 1);
    }

    #[test]
    fn test_trailing_range_includes_now_excludes_start() {
        let now = t(12, 0);
        let range = TimeRange::trailing(now, Duration::hours(1)).unwrap();
        assert!(range.contains(now));
        assert!(!range.contains(t(11, 0)));
        assert!(range.contains(t(11, 0) + Duration::nanoseconds(1)));
    }

    #[test]
    fn test_trailing_range_underflow_is_configuration_error() {
        let err = TimeRange::trailing(t(12, 0), Duration::days(365 * 300_000)).unwrap_err();
        assert!(matches!(err, QuotaError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_idempotency_key_suppresses_duplicates() {
        let ledger = InMemoryLedger::new();
        let first = UsageEvent::new("user-1", ActionType::ChatMessage, t(9, 0))
            .with_idempotency_key("req-42");
        let retry = UsageEvent::new("user-1", ActionType::ChatMessage, t(9, 1))
            .with_idempotency_key("req-42");

        assert_eq!(ledger.append(first).await.unwrap(), AppendOutcome::Recorded);
        assert_eq!(ledger.append(retry).await.unwrap(), AppendOutcome::Duplicate);
        assert_eq!(ledger.count().await, 1);

        // Same key under a different user is a different event
        let other = UsageEvent::new("user-2", ActionType::ChatMessage, t(9, 0))
            .with_idempotency_key("req-42");
        assert_eq!(ledger.append(other).await.unwrap(), AppendOutcome::Recorded);
    }

    #[tokio::test]
    async fn test_zero_amount_rejected() {
        let ledger = InMemoryLedger::new();
        let err = ledger
            .append(UsageEvent::new("user-1", ActionType::Explanation, t(9, 0)).with_amount(0))
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::Configuration(_)));
        assert_eq!(ledger.count().await, 0);
    }

    #[tokio::test]
    async fn test_totals_by_action() {
        let ledger = InMemoryLedger::new();
        for _ in 0..2 {
            ledger
                .append(UsageEvent::new("user-1", ActionType::Explanation, t(9, 0)))
                .await
                .unwrap();
        }
        ledger
            .append(UsageEvent::new("user-1", ActionType::FileUpload, t(9, 0)))
            .await
            .unwrap();

        let totals = ledger.totals_by_action("user-1", day()).await.unwrap();
        assert_eq!(totals[&ActionType::Explanation], 2);
        assert_eq!(totals[&ActionType::ChatMessage], 0);
        assert_eq!(totals[&ActionType::FileUpload], 1);
    }

    #[tokio::test]
    async fn test_out_of_order_appends_are_summed_by_range() {
        let ledger = InMemoryLedger::new();
        for (h, m) in [(15, 0), (9, 0), (12, 0), (9, 0), (23, 59)] {
            ledger
                .append(UsageEvent::new("user-1", ActionType::Explanation, t(h, m)))
                .await
                .unwrap();
        }
        ledger
            .append(UsageEvent::new(
                "user-1",
                ActionType::Explanation,
                t(0, 0) - Duration::days(3),
            ))
            .await
            .unwrap();

        let occurred: Vec<_> = ledger
            .events_for_user("user-1")
            .await
            .iter()
            .map(|e| e.occurred_at)
            .collect();
        let mut sorted = occurred.clone();
        sorted.sort();
        assert_eq!(occurred, sorted);

        let morning = TimeRange::new(t(9, 0), t(12, 0));
        let sum = ledger
            .sum_in_range("user-1", UsageScope::AllActions, morning)
            .await
            .unwrap();
        assert_eq!(sum.total, 2);
        assert_eq!(sum.earliest, Some(t(9, 0)));

        let today = ledger
            .sum_in_range("user-1", UsageScope::AllActions, day())
            .await
            .unwrap();
        assert_eq!(today.total, 5);
    }

    #[tokio::test]
    async fn test_clear() {
        let ledger = InMemoryLedger::new();
        ledger
            .append(UsageEvent::new("user-1", ActionType::Explanation, t(9, 0)))
            .await
            .unwrap();
        ledger.clear().await;
        assert_eq!(ledger.count().await, 0);
        assert!(ledger.events_for_user("user-1").await.is_empty());
    }
}
