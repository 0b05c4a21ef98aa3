//! Quota Guard
//!
//! The only component request handlers call. Each action attempt follows a
//! two-phase protocol:
//!
//! ```text
//! PENDING --check--> ALLOWED --privileged work--> consume --> RECORDED
//!                \-> DENIED (terminal, nothing written)
//! ```
//!
//! Running out of quota is a normal [`Decision`] with `allowed == false`,
//! never an error. Only unknown users, unresolvable policies, ledger
//! failures and elapsed deadlines use the error channel.
//!
//! [`QuotaGuard::admit`] holds a per-user lock from the check until the
//! returned ticket is consumed or dropped, so concurrent attempts by one
//! user cannot overshoot a limit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use super::clock::{Clock, SystemClock};
use super::config::{Atomicity, GuardConfig, StorageErrorPolicy};
use super::deadline::OperationDeadline;
use super::error::{QuotaError, QuotaResult};
use super::ledger::{AppendOutcome, UsageEvent, UsageLedger};
use super::locks::{UserLockGuard, UserLocks};
use super::policy::{
    ActionType, PolicyStrategy, ResolvedPolicy, SubscriptionTier, UsageScope, WindowKind,
    WindowSpec,
};
use super::retry::{calculate_retry_delay, retry_read, RetryDecision};
use super::user::{User, UserDirectory};
use super::window::{window_range, WindowEvaluation, WindowEvaluator};
use crate::metrics;

/// Outcome of a check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Whether the action may proceed
    pub allowed: bool,

    /// Usage already counted in the window
    pub current_usage: u64,

    /// Limit that applied
    pub limit: u32,

    /// When the window next frees capacity, if known
    pub next_reset: Option<DateTime<Utc>>,

    /// Whether `now` is on the account's creation day
    pub is_first_day: bool,

    /// Human-readable denial message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub action: ActionType,

    /// Effective tier at the time of the check
    pub tier: SubscriptionTier,

    pub window: WindowKind,

    /// Admitted without reading the ledger because storage failed
    #[serde(default)]
    pub degraded: bool,
}

impl Decision {
    fn from_evaluation(eval: &WindowEvaluation, action: ActionType, tier: SubscriptionTier) -> Self {
        let allowed = eval.has_capacity();
        Self {
            allowed,
            current_usage: eval.current_usage,
            limit: eval.limit,
            next_reset: eval.next_reset,
            is_first_day: eval.is_first_day,
            reason: (!allowed).then(|| denial_reason(&eval.policy)),
            action,
            tier,
            window: eval.policy.window.kind(),
            degraded: false,
        }
    }

    fn fail_open(
        policy: &ResolvedPolicy,
        is_first_day: bool,
        next_reset: Option<DateTime<Utc>>,
        action: ActionType,
        tier: SubscriptionTier,
    ) -> Self {
        Self {
            allowed: true,
            current_usage: 0,
            limit: policy.limit,
            next_reset,
            is_first_day,
            reason: None,
            action,
            tier,
            window: policy.window.kind(),
            degraded: true,
        }
    }

    /// Capacity left in the window
    pub fn remaining(&self) -> u64 {
        u64::from(self.limit).saturating_sub(self.current_usage)
    }

    fn outcome_label(&self) -> &'static str {
        match (self.allowed, self.degraded) {
            (true, false) => "allowed",
            (true, true) => "allowed_degraded",
            (false, _) => "denied",
        }
    }
}

/// Denial message citing the limit and the window it applies over
pub fn denial_reason(policy: &ResolvedPolicy) -> String {
    let noun = policy.scope.plural_noun();
    match policy.window {
        WindowSpec::CalendarDay { .. } if policy.first_day_applied => {
            format!("First day limit of {} {} reached", policy.limit, noun)
        }
        WindowSpec::CalendarDay { .. } => {
            format!("Daily limit of {} {} reached", policy.limit, noun)
        }
        WindowSpec::Rolling { duration_secs: 3600 } => {
            format!("Hourly limit of {} {} reached", policy.limit, noun)
        }
        WindowSpec::Rolling { duration_secs } => format!(
            "Limit of {} {} per {} reached",
            policy.limit,
            noun,
            describe_duration(duration_secs)
        ),
    }
}

fn describe_duration(secs: u64) -> String {
    let (n, unit) = if secs % 3600 == 0 {
        (secs / 3600, "hour")
    } else if secs % 60 == 0 {
        (secs / 60, "minute")
    } else {
        (secs, "second")
    };
    if n == 1 {
        unit.to_string()
    } else {
        format!("{} {}s", n, unit)
    }
}

/// Read-only usage summary for account screens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    /// Events per action today; every action is present
    pub by_action: BTreeMap<ActionType, u64>,
    pub total_today: u64,
    /// Aggregate cap if the tier has one, else the sum of per-action caps
    pub daily_limit: u64,
    pub remaining: u64,
    pub limits_by_action: BTreeMap<ActionType, u32>,
    pub is_first_day: bool,
    pub tier: SubscriptionTier,
    pub day_start: DateTime<Utc>,
    pub day_end: DateTime<Utc>,
}

/// Result of [`QuotaGuard::admit`]
#[derive(Debug)]
pub enum Admission {
    /// The action may proceed; consume the ticket once the work succeeds
    Allowed(AdmissionTicket),
    /// Terminal: nothing is written
    Denied(Decision),
}

impl Admission {
    pub fn decision(&self) -> &Decision {
        match self {
            Admission::Allowed(ticket) => ticket.decision(),
            Admission::Denied(decision) => decision,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed(_))
    }
}

/// An allowed attempt that has not been recorded yet.
///
/// Under [`Atomicity::Serialized`] the ticket holds the user's admission
/// lock; dropping it without consuming releases the lock and records
/// nothing.
#[derive(Debug)]
pub struct AdmissionTicket {
    guard: QuotaGuard,
    user_id: String,
    decision: Decision,
    _lock: Option<UserLockGuard>,
}

impl AdmissionTicket {
    pub fn decision(&self) -> &Decision {
        &self.decision
    }

    /// Record the action at the current clock time
    pub async fn consume(self, idempotency_key: Option<&str>) -> QuotaResult<AppendOutcome> {
        let now = self.guard.now();
        self.consume_at(now, idempotency_key).await
    }

    /// Record the action at `now`
    pub async fn consume_at(
        self,
        now: DateTime<Utc>,
        idempotency_key: Option<&str>,
    ) -> QuotaResult<AppendOutcome> {
        self.guard
            .consume_at(&self.user_id, self.decision.action, now, idempotency_key)
            .await
    }

    /// Record the action, retrying a storage failure once with the same key
    pub async fn consume_with_retry(self, idempotency_key: &str) -> QuotaResult<AppendOutcome> {
        let now = self.guard.now();
        self.guard
            .consume_with_retry_at(&self.user_id, self.decision.action, now, idempotency_key)
            .await
    }

    /// Give up the attempt without recording
    pub fn release(self) {}
}

/// Check plus consume in one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionOutcome {
    pub decision: Decision,
    /// `None` when denied
    pub recorded: Option<AppendOutcome>,
}

/// Quota guard
#[derive(Clone)]
pub struct QuotaGuard {
    inner: Arc<GuardInner>,
}

struct GuardInner {
    config: GuardConfig,
    users: Arc<dyn UserDirectory>,
    ledger: Arc<dyn UsageLedger>,
    evaluator: WindowEvaluator,
    clock: Arc<dyn Clock>,
    locks: UserLocks,
    deadline: OperationDeadline,
}

impl std::fmt::Debug for QuotaGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGuard")
            .field("config", &self.inner.config)
            .field("clock", &self.inner.clock)
            .field("deadline", &self.inner.deadline)
            .finish_non_exhaustive()
    }
}

impl QuotaGuard {
    /// Create a guard; fails if the configuration is unusable
    pub fn new(
        config: GuardConfig,
        users: Arc<dyn UserDirectory>,
        ledger: Arc<dyn UsageLedger>,
        clock: Arc<dyn Clock>,
    ) -> QuotaResult<Self> {
        config.validate()?;
        let evaluator = WindowEvaluator::new(ledger.clone(), config.calendar()?);
        let deadline = OperationDeadline::from_option(config.deadline());

        info!(
            on_storage_error = ?config.on_storage_error,
            atomicity = ?config.atomicity,
            utc_offset_secs = config.reference_utc_offset_secs,
            "Quota guard initialized"
        );

        Ok(Self {
            inner: Arc::new(GuardInner {
                config,
                users,
                ledger,
                evaluator,
                clock,
                locks: UserLocks::new(),
                deadline,
            }),
        })
    }

    /// Guard on the wall clock
    pub fn with_system_clock(
        config: GuardConfig,
        users: Arc<dyn UserDirectory>,
        ledger: Arc<dyn UsageLedger>,
    ) -> QuotaResult<Self> {
        Self::new(config, users, ledger, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &GuardConfig {
        &self.inner.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Check under the tiered calendar-day policy
    pub async fn check(&self, user_id: &str, action: ActionType) -> QuotaResult<Decision> {
        self.check_at(user_id, action, PolicyStrategy::Tiered, self.now()).await
    }

    /// Check under an explicit policy strategy
    pub async fn check_with(
        &self,
        user_id: &str,
        action: ActionType,
        strategy: PolicyStrategy,
    ) -> QuotaResult<Decision> {
        self.check_at(user_id, action, strategy, self.now()).await
    }

    /// Check at an explicit instant
    #[instrument(name = "quota_check", skip_all, fields(user_id = %user_id, action = %action))]
    pub async fn check_at(
        &self,
        user_id: &str,
        action: ActionType,
        strategy: PolicyStrategy,
        now: DateTime<Utc>,
    ) -> QuotaResult<Decision> {
        let _timer = metrics::start_timer("check");
        self.inner
            .deadline
            .run(self.evaluate_check(user_id, action, strategy, now))
            .await
    }

    /// Check, retrying transient ledger failures with backoff
    pub async fn check_with_retry(
        &self,
        user_id: &str,
        action: ActionType,
        strategy: PolicyStrategy,
    ) -> QuotaResult<Decision> {
        let now = self.now();
        retry_read(&self.inner.config.retry, "check", || {
            self.check_at(user_id, action, strategy, now)
        })
        .await
    }

    async fn evaluate_check(
        &self,
        user_id: &str,
        action: ActionType,
        strategy: PolicyStrategy,
        now: DateTime<Utc>,
    ) -> QuotaResult<Decision> {
        let user = self.load_user(user_id).await?;
        let tier = user.effective_tier(now);
        let evaluator = &self.inner.evaluator;
        let (policy, is_first_day) = evaluator
            .resolve(&self.inner.config.policy, user.created_at, tier, action, strategy, now)
            .inspect_err(|err| report_configuration_error(err, user_id, action))?;

        let decision = match evaluator.evaluate_policy(user_id, policy, is_first_day, now).await {
            Ok(eval) => Decision::from_evaluation(&eval, action, tier),
            Err(QuotaError::Storage(msg)) => {
                metrics::record_storage_error("check");
                match self.inner.config.on_storage_error {
                    StorageErrorPolicy::FailOpen => {
                        warn!(user_id, action = %action, error = %msg, "Usage ledger unavailable, admitting without enforcement");
                        let next_reset = match policy.window {
                            WindowSpec::CalendarDay { .. } => {
                                window_range(evaluator.calendar(), policy.window, now)
                                    .ok()
                                    .map(|range| range.end)
                            }
                            WindowSpec::Rolling { .. } => None,
                        };
                        Decision::fail_open(&policy, is_first_day, next_reset, action, tier)
                    }
                    StorageErrorPolicy::FailClosed => {
                        error!(user_id, action = %action, error = %msg, "Usage ledger unavailable, refusing admission");
                        return Err(QuotaError::Storage(msg));
                    }
                }
            }
            Err(err) => {
                report_configuration_error(&err, user_id, action);
                return Err(err);
            }
        };

        metrics::record_decision(action.as_str(), decision.outcome_label());
        if decision.allowed {
            debug!(
                usage = decision.current_usage,
                limit = decision.limit,
                "Action admitted"
            );
        } else {
            info!(
                user_id,
                usage = decision.current_usage,
                limit = decision.limit,
                reason = decision.reason.as_deref().unwrap_or_default(),
                "Quota exhausted"
            );
        }

        Ok(decision)
    }

    /// Record one action at the current clock time
    pub async fn consume(
        &self,
        user_id: &str,
        action: ActionType,
        idempotency_key: Option<&str>,
    ) -> QuotaResult<AppendOutcome> {
        self.consume_at(user_id, action, self.now(), idempotency_key).await
    }

    /// Record one action at `now`.
    ///
    /// Does not re-check the limit. Use [`QuotaGuard::admit`] or
    /// [`QuotaGuard::check_and_consume`] for atomic enforcement.
    #[instrument(name = "quota_consume", skip_all, fields(user_id = %user_id, action = %action))]
    pub async fn consume_at(
        &self,
        user_id: &str,
        action: ActionType,
        now: DateTime<Utc>,
        idempotency_key: Option<&str>,
    ) -> QuotaResult<AppendOutcome> {
        let _timer = metrics::start_timer("consume");
        let mut event = UsageEvent::new(user_id, action, now);
        if let Some(key) = idempotency_key {
            event = event.with_idempotency_key(key);
        }

        let result = self.inner.deadline.run(self.inner.ledger.append(event)).await;
        match &result {
            Ok(AppendOutcome::Recorded) => {
                metrics::record_event(action.as_str());
                debug!("Usage recorded");
            }
            Ok(AppendOutcome::Duplicate) => {
                debug!(idempotency_key, "Duplicate usage event suppressed");
            }
            Err(err) if err.is_retryable() => {
                metrics::record_storage_error("consume");
                warn!(error = %err, "Failed to record usage");
            }
            Err(err) => warn!(error = %err, "Failed to record usage"),
        }
        result
    }

    /// Record one action, retrying a storage failure at most once.
    ///
    /// The retry reuses `idempotency_key`, so a first attempt that reached
    /// the ledger before failing is not counted twice.
    pub async fn consume_with_retry(
        &self,
        user_id: &str,
        action: ActionType,
        idempotency_key: &str,
    ) -> QuotaResult<AppendOutcome> {
        self.consume_with_retry_at(user_id, action, self.now(), idempotency_key)
            .await
    }

    pub async fn consume_with_retry_at(
        &self,
        user_id: &str,
        action: ActionType,
        now: DateTime<Utc>,
        idempotency_key: &str,
    ) -> QuotaResult<AppendOutcome> {
        match self.consume_at(user_id, action, now, Some(idempotency_key)).await {
            Err(err) if err.is_retryable() => {
                let delay_ms = match calculate_retry_delay(0, &self.inner.config.retry) {
                    RetryDecision::Retry(ms) => ms,
                    RetryDecision::GiveUp => 0,
                };
                warn!(
                    user_id,
                    action = %action,
                    delay_ms,
                    error = %err,
                    "Retrying usage record with the same idempotency key"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                self.consume_at(user_id, action, now, Some(idempotency_key))
                    .await
            }
            other => other,
        }
    }

    /// Begin an action attempt at the current clock time
    pub async fn admit(
        &self,
        user_id: &str,
        action: ActionType,
        strategy: PolicyStrategy,
    ) -> QuotaResult<Admission> {
        self.admit_at(user_id, action, strategy, self.now()).await
    }

    /// Begin an action attempt at `now`.
    ///
    /// With [`Atomicity::Serialized`] the user's lock is taken before the
    /// check and travels with the returned ticket.
    #[instrument(name = "quota_admit", skip_all, fields(user_id = %user_id, action = %action))]
    pub async fn admit_at(
        &self,
        user_id: &str,
        action: ActionType,
        strategy: PolicyStrategy,
        now: DateTime<Utc>,
    ) -> QuotaResult<Admission> {
        let _timer = metrics::start_timer("admit");
        let (lock, decision) = self
            .inner
            .deadline
            .run(async {
                let lock = match self.inner.config.atomicity {
                    Atomicity::Serialized => Some(self.inner.locks.acquire(user_id).await),
                    Atomicity::BestEffort => None,
                };
                let decision = self.evaluate_check(user_id, action, strategy, now).await?;
                Ok::<_, QuotaError>((lock, decision))
            })
            .await?;

        if !decision.allowed {
            return Ok(Admission::Denied(decision));
        }
        Ok(Admission::Allowed(AdmissionTicket {
            guard: self.clone(),
            user_id: user_id.to_string(),
            decision,
            _lock: lock,
        }))
    }

    /// Check and, when allowed, record the action as one step
    pub async fn check_and_consume(
        &self,
        user_id: &str,
        action: ActionType,
        strategy: PolicyStrategy,
        idempotency_key: Option<&str>,
    ) -> QuotaResult<AdmissionOutcome> {
        self.check_and_consume_at(user_id, action, strategy, self.now(), idempotency_key)
            .await
    }

    pub async fn check_and_consume_at(
        &self,
        user_id: &str,
        action: ActionType,
        strategy: PolicyStrategy,
        now: DateTime<Utc>,
        idempotency_key: Option<&str>,
    ) -> QuotaResult<AdmissionOutcome> {
        match self.admit_at(user_id, action, strategy, now).await? {
            Admission::Denied(decision) => Ok(AdmissionOutcome {
                decision,
                recorded: None,
            }),
            Admission::Allowed(ticket) => {
                let decision = ticket.decision().clone();
                let outcome = ticket.consume_at(now, idempotency_key).await?;
                Ok(AdmissionOutcome {
                    decision,
                    recorded: Some(outcome),
                })
            }
        }
    }

    /// Today's usage at the current clock time
    pub async fn stats(&self, user_id: &str) -> QuotaResult<UsageSummary> {
        self.stats_at(user_id, self.now()).await
    }

    /// Today's usage, retrying transient ledger failures with backoff
    pub async fn stats_with_retry(&self, user_id: &str) -> QuotaResult<UsageSummary> {
        let now = self.now();
        retry_read(&self.inner.config.retry, "stats", || self.stats_at(user_id, now)).await
    }

    /// Usage for the calendar day containing `now`. Never writes.
    #[instrument(name = "quota_stats", skip_all, fields(user_id = %user_id))]
    pub async fn stats_at(&self, user_id: &str, now: DateTime<Utc>) -> QuotaResult<UsageSummary> {
        let _timer = metrics::start_timer("stats");
        self.inner
            .deadline
            .run(self.summarize(user_id, now))
            .await
    }

    async fn summarize(&self, user_id: &str, now: DateTime<Utc>) -> QuotaResult<UsageSummary> {
        let user = self.load_user(user_id).await?;
        let tier = user.effective_tier(now);
        let table = &self.inner.config.policy;
        let evaluator = &self.inner.evaluator;

        let reset_hour = table.day_reset_hour(tier);
        let is_first_day = evaluator
            .calendar()
            .is_first_day(user.created_at, now, reset_hour);

        let (range, mut by_action, total_today) = evaluator
            .day_totals(user_id, reset_hour, now)
            .await
            .inspect_err(|err| {
                if err.is_retryable() {
                    metrics::record_storage_error("stats");
                }
            })?;
        for action in ActionType::ALL {
            by_action.entry(action).or_insert(0);
        }

        let limits_by_action: BTreeMap<ActionType, u32> = ActionType::ALL
            .iter()
            .filter_map(|&action| {
                table
                    .entry(tier, action)
                    .ok()
                    .map(|entry| (action, entry.limit_for(is_first_day)))
            })
            .collect();

        let aggregate = table
            .entries
            .iter()
            .find(|e| e.tier == tier && e.scope == UsageScope::AllActions);
        let (daily_limit, remaining) = match aggregate {
            Some(entry) => {
                let limit = u64::from(entry.limit_for(is_first_day));
                (limit, limit.saturating_sub(total_today))
            }
            None => {
                let limit = limits_by_action.values().map(|&l| u64::from(l)).sum();
                let remaining = limits_by_action
                    .iter()
                    .map(|(action, &l)| {
                        u64::from(l).saturating_sub(by_action.get(action).copied().unwrap_or(0))
                    })
                    .sum();
                (limit, remaining)
            }
        };

        Ok(UsageSummary {
            by_action,
            total_today,
            daily_limit,
            remaining,
            limits_by_action,
            is_first_day,
            tier,
            day_start: range.start,
            day_end: range.end,
        })
    }

    async fn load_user(&self, user_id: &str) -> QuotaResult<User> {
        self.inner
            .users
            .get_user(user_id)
            .await?
            .ok_or_else(|| QuotaError::UserNotFound(user_id.to_string()))
    }
}

fn report_configuration_error(err: &QuotaError, user_id: &str, action: ActionType) {
    if let QuotaError::Configuration(msg) = err {
        metrics::record_configuration_error(action.as_str());
        error!(user_id, action = %action, error = %msg, "No usable quota policy");
    }
}
