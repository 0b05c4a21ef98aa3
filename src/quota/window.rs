//! Window Evaluator
//!
//! Turns a [`WindowSpec`] and "now" into a concrete ledger range and a
//! next-reset instant, then asks the ledger for current usage. Never writes.
//!
//! All users share one reference calendar (a fixed UTC offset, UTC unless
//! configured), so "today" and "first day" mean the same thing for everyone.

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Offset, TimeZone, Utc};
use std::sync::Arc;
use tracing::debug;

use super::error::{QuotaError, QuotaResult};
use super::ledger::{TimeRange, UsageLedger};
use super::policy::{
    rolling_duration, ActionType, PolicyStrategy, PolicyTable, ResolvedPolicy, SubscriptionTier,
    UsageScope, WindowSpec,
};

/// Fixed-offset calendar used for day boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceCalendar {
    offset: FixedOffset,
}

impl Default for ReferenceCalendar {
    fn default() -> Self {
        Self::utc()
    }
}

impl ReferenceCalendar {
    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    /// Calendar at `secs` east of UTC
    pub fn with_offset_secs(secs: i32) -> QuotaResult<Self> {
        FixedOffset::east_opt(secs)
            .map(|offset| Self { offset })
            .ok_or_else(|| {
                QuotaError::Configuration(format!("UTC offset {}s is out of range", secs))
            })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Start of the calendar day containing `instant`, with days beginning at `reset_hour`
    pub fn day_start(&self, instant: DateTime<Utc>, reset_hour: u32) -> DateTime<Utc> {
        let shift = Duration::hours(i64::from(reset_hour));
        let local = instant.with_timezone(&self.offset) - shift;
        let midnight = local.date_naive().and_time(NaiveTime::MIN);
        let utc_offset = Duration::seconds(i64::from(self.offset.local_minus_utc()));
        Utc.from_utc_datetime(&(midnight - utc_offset)) + shift
    }

    /// `[start_of_day, start_of_day + 24h)` around `now`
    pub fn day_range(&self, now: DateTime<Utc>, reset_hour: u32) -> TimeRange {
        let start = self.day_start(now, reset_hour);
        TimeRange::new(start, start + Duration::days(1))
    }

    /// Whether `now` falls on the same calendar day as `created_at`
    pub fn is_first_day(&self, created_at: DateTime<Utc>, now: DateTime<Utc>, reset_hour: u32) -> bool {
        self.day_start(created_at, reset_hour) == self.day_start(now, reset_hour)
    }
}

/// Concrete range a window covers at `now`
pub fn window_range(
    calendar: &ReferenceCalendar,
    window: WindowSpec,
    now: DateTime<Utc>,
) -> QuotaResult<TimeRange> {
    match window {
        WindowSpec::CalendarDay { reset_hour } => Ok(calendar.day_range(now, reset_hour)),
        WindowSpec::Rolling { duration_secs } => {
            TimeRange::trailing(now, rolling_duration(duration_secs)?)
        }
    }
}

/// Usage of one window at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEvaluation {
    pub current_usage: u64,
    pub limit: u32,
    pub next_reset: Option<DateTime<Utc>>,
    pub is_first_day: bool,
    pub policy: ResolvedPolicy,
    pub range: TimeRange,
}

impl WindowEvaluation {
    pub fn has_capacity(&self) -> bool {
        self.current_usage < u64::from(self.limit)
    }
}

/// Computes current usage for a user/action under the policy table
#[derive(Clone)]
pub struct WindowEvaluator {
    ledger: Arc<dyn UsageLedger>,
    calendar: ReferenceCalendar,
}

impl std::fmt::Debug for WindowEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowEvaluator")
            .field("calendar", &self.calendar)
            .finish_non_exhaustive()
    }
}

impl WindowEvaluator {
    pub fn new(ledger: Arc<dyn UsageLedger>, calendar: ReferenceCalendar) -> Self {
        Self { ledger, calendar }
    }

    pub fn calendar(&self) -> &ReferenceCalendar {
        &self.calendar
    }

    /// Evaluate the window for `(tier, action)` under `strategy` at `now`
    #[allow(clippy::too_many_arguments)]
    pub async fn evaluate(
        &self,
        table: &PolicyTable,
        user_id: &str,
        created_at: DateTime<Utc>,
        tier: SubscriptionTier,
        action: ActionType,
        strategy: PolicyStrategy,
        now: DateTime<Utc>,
    ) -> QuotaResult<WindowEvaluation> {
        let (policy, is_first_day) = self.resolve(table, created_at, tier, action, strategy, now)?;
        self.evaluate_policy(user_id, policy, is_first_day, now).await
    }

    /// Resolve the applicable policy and first-day status without touching the ledger
    pub fn resolve(
        &self,
        table: &PolicyTable,
        created_at: DateTime<Utc>,
        tier: SubscriptionTier,
        action: ActionType,
        strategy: PolicyStrategy,
        now: DateTime<Utc>,
    ) -> QuotaResult<(ResolvedPolicy, bool)> {
        let reset_hour = match strategy {
            PolicyStrategy::Tiered => match table.entry(tier, action)?.window {
                WindowSpec::CalendarDay { reset_hour } => reset_hour,
                WindowSpec::Rolling { .. } => 0,
            },
            PolicyStrategy::Rolling => 0,
        };
        let is_first_day = self.calendar.is_first_day(created_at, now, reset_hour);
        let policy = table.resolve(tier, action, strategy, is_first_day)?;
        Ok((policy, is_first_day))
    }

    /// Evaluate an already-resolved policy
    pub async fn evaluate_policy(
        &self,
        user_id: &str,
        policy: ResolvedPolicy,
        is_first_day: bool,
        now: DateTime<Utc>,
    ) -> QuotaResult<WindowEvaluation> {
        let range = window_range(&self.calendar, policy.window, now)?;
        let sum = self.ledger.sum_in_range(user_id, policy.scope, range).await?;

        let at_limit = sum.total >= u64::from(policy.limit);
        let next_reset = match policy.window {
            WindowSpec::CalendarDay { .. } => Some(range.end),
            WindowSpec::Rolling { duration_secs } if at_limit => match sum.earliest {
                Some(earliest) => earliest.checked_add_signed(rolling_duration(duration_secs)?),
                None => None,
            },
            WindowSpec::Rolling { .. } => None,
        };

        debug!(
            user_id,
            scope = ?policy.scope,
            usage = sum.total,
            limit = policy.limit,
            "Evaluated usage window"
        );

        Ok(WindowEvaluation {
            current_usage: sum.total,
            limit: policy.limit,
            next_reset,
            is_first_day,
            policy,
            range,
        })
    }

    /// Per-action and total usage for the calendar day containing `now`
    pub async fn day_totals(
        &self,
        user_id: &str,
        reset_hour: u32,
        now: DateTime<Utc>,
    ) -> QuotaResult<(TimeRange, std::collections::BTreeMap<ActionType, u64>, u64)> {
        let range = self.calendar.day_range(now, reset_hour);
        let by_action = self.ledger.totals_by_action(user_id, range).await?;
        let total = self
            .ledger
            .sum_in_range(user_id, UsageScope::AllActions, range)
            .await?
            .total;
        Ok((range, by_action, total))
    }
}
