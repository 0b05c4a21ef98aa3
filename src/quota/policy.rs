//! Policy Table
//!
//! Static, tier-indexed limits. Lookups are pure: no I/O, no clock.
//!
//! Two independent tables live here:
//!
//! - the **tiered** table, keyed by `(tier, scope)`, evaluated over calendar
//!   days with an optional first-day override
//! - the **rolling** table, keyed by action, evaluated over a trailing window
//!
//! Callers pick one per check through [`PolicyStrategy`].

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::{QuotaError, QuotaResult};

/// Default free-tier daily cap across all actions
pub const DEFAULT_FREE_DAILY_LIMIT: u32 = 3;
/// Default free-tier cap on the day the account was created
pub const DEFAULT_FREE_FIRST_DAY_LIMIT: u32 = 20;
pub const DEFAULT_PREMIUM_EXPLANATION_LIMIT: u32 = 100;
pub const DEFAULT_PREMIUM_CHAT_LIMIT: u32 = 500;
pub const DEFAULT_PREMIUM_UPLOAD_LIMIT: u32 = 50;
/// Default interactive chat cap per rolling hour
pub const DEFAULT_CHAT_HOURLY_LIMIT: u32 = 3;

/// Subscription class of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    Free,
    Premium,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Premium => "premium",
        }
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-initiated actions that are metered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Explanation,
    ChatMessage,
    FileUpload,
}

impl ActionType {
    pub const ALL: [ActionType; 3] = [
        ActionType::Explanation,
        ActionType::ChatMessage,
        ActionType::FileUpload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Explanation => "explanation",
            ActionType::ChatMessage => "chat_message",
            ActionType::FileUpload => "file_upload",
        }
    }

    /// Plural noun used in denial messages
    pub fn plural_noun(&self) -> &'static str {
        match self {
            ActionType::Explanation => "explanations",
            ActionType::ChatMessage => "chat messages",
            ActionType::FileUpload => "file uploads",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "explanation" | "explain" => Ok(ActionType::Explanation),
            "chat_message" | "chat" => Ok(ActionType::ChatMessage),
            "file_upload" | "upload" => Ok(ActionType::FileUpload),
            other => Err(format!(
                "unknown action '{}': expected explanation, chat_message or file_upload",
                other
            )),
        }
    }
}

/// Which events count toward a limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageScope {
    /// Every action the user performs
    AllActions,
    /// A single action type
    Action(ActionType),
}

impl UsageScope {
    /// Whether an event of `action` counts in this scope
    pub fn includes(&self, action: ActionType) -> bool {
        match self {
            UsageScope::AllActions => true,
            UsageScope::Action(a) => *a == action,
        }
    }

    pub fn plural_noun(&self) -> &'static str {
        match self {
            UsageScope::AllActions => "interactions",
            UsageScope::Action(a) => a.plural_noun(),
        }
    }
}

/// Time window a limit is evaluated over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowSpec {
    /// Trailing interval `(now - duration, now]`
    Rolling { duration_secs: u64 },
    /// Day in the reference calendar, starting at `reset_hour`
    CalendarDay { reset_hour: u32 },
}

impl WindowSpec {
    pub fn rolling(duration: Duration) -> Self {
        WindowSpec::Rolling {
            duration_secs: duration.num_seconds().max(1) as u64,
        }
    }

    pub fn calendar_day() -> Self {
        WindowSpec::CalendarDay { reset_hour: 0 }
    }

    pub fn kind(&self) -> WindowKind {
        match self {
            WindowSpec::Rolling { .. } => WindowKind::Rolling,
            WindowSpec::CalendarDay { .. } => WindowKind::CalendarDay,
        }
    }
}

/// Window kind without parameters, surfaced in decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Rolling,
    CalendarDay,
}

/// Which policy table a check is evaluated against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStrategy {
    /// Tier table over calendar days
    #[default]
    Tiered,
    /// Flat per-action table over a trailing window
    Rolling,
}

/// One row of the tiered table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub tier: SubscriptionTier,
    pub scope: UsageScope,
    pub limit: u32,
    /// Limit on the calendar day the account was created
    #[serde(default)]
    pub first_day_limit: Option<u32>,
    pub window: WindowSpec,
}

impl PolicyEntry {
    pub fn new(tier: SubscriptionTier, scope: UsageScope, limit: u32, window: WindowSpec) -> Self {
        Self {
            tier,
            scope,
            limit,
            first_day_limit: None,
            window,
        }
    }

    pub fn with_first_day_limit(mut self, limit: u32) -> Self {
        self.first_day_limit = Some(limit);
        self
    }

    /// Limit that applies given first-day status
    pub fn limit_for(&self, is_first_day: bool) -> u32 {
        match self.first_day_limit {
            Some(bonus) if is_first_day => bonus,
            _ => self.limit,
        }
    }
}

/// Longest rolling window a policy may declare
pub const MAX_ROLLING_WINDOW_SECS: u64 = 366 * 24 * 60 * 60;

/// Length of a rolling window, rejecting empty or out-of-range windows
pub fn rolling_duration(duration_secs: u64) -> QuotaResult<Duration> {
    if duration_secs == 0 || duration_secs > MAX_ROLLING_WINDOW_SECS {
        return Err(QuotaError::Configuration(format!(
            "rolling window of {}s must be between 1s and {}s",
            duration_secs, MAX_ROLLING_WINDOW_SECS
        )));
    }
    i64::try_from(duration_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| {
            QuotaError::Configuration(format!("rolling window of {}s is out of range", duration_secs))
        })
}

/// One row of the rolling table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingLimit {
    pub action: ActionType,
    pub limit: u32,
    pub duration_secs: u64,
}

/// Policy resolved for a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub scope: UsageScope,
    pub limit: u32,
    pub window: WindowSpec,
    /// The first-day override replaced the regular limit
    pub first_day_applied: bool,
}

/// Immutable limits table, injected into the guard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyTable {
    pub entries: Vec<PolicyEntry>,
    pub rolling: Vec<RollingLimit>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        use ActionType::*;
        use SubscriptionTier::*;

        let day = WindowSpec::calendar_day();
        Self {
            entries: vec![
                PolicyEntry::new(Free, UsageScope::AllActions, DEFAULT_FREE_DAILY_LIMIT, day)
                    .with_first_day_limit(DEFAULT_FREE_FIRST_DAY_LIMIT),
                PolicyEntry::new(
                    Premium,
                    UsageScope::Action(Explanation),
                    DEFAULT_PREMIUM_EXPLANATION_LIMIT,
                    day,
                ),
                PolicyEntry::new(
                    Premium,
                    UsageScope::Action(ChatMessage),
                    DEFAULT_PREMIUM_CHAT_LIMIT,
                    day,
                ),
                PolicyEntry::new(
                    Premium,
                    UsageScope::Action(FileUpload),
                    DEFAULT_PREMIUM_UPLOAD_LIMIT,
                    day,
                ),
            ],
            rolling: vec![RollingLimit {
                action: ChatMessage,
                limit: DEFAULT_CHAT_HOURLY_LIMIT,
                duration_secs: 3600,
            }],
        }
    }
}

impl PolicyTable {
    /// Create the default product table
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty table, for building test doubles
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            rolling: Vec::new(),
        }
    }

    pub fn with_entry(mut self, entry: PolicyEntry) -> Self {
        self.entries
            .retain(|e| !(e.tier == entry.tier && e.scope == entry.scope));
        self.entries.push(entry);
        self
    }

    pub fn with_rolling(mut self, action: ActionType, limit: u32, duration: Duration) -> Self {
        self.rolling.retain(|r| r.action != action);
        self.rolling.push(RollingLimit {
            action,
            limit,
            duration_secs: duration.num_seconds().max(1) as u64,
        });
        self
    }

    /// Tiered entry for `(tier, action)`.
    ///
    /// An exact action entry wins; otherwise the tier's all-actions entry
    /// applies.
    pub fn entry(&self, tier: SubscriptionTier, action: ActionType) -> QuotaResult<&PolicyEntry> {
        self.entries
            .iter()
            .find(|e| e.tier == tier && e.scope == UsageScope::Action(action))
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|e| e.tier == tier && e.scope == UsageScope::AllActions)
            })
            .ok_or_else(|| {
                QuotaError::Configuration(format!(
                    "no policy for tier '{}' and action '{}'",
                    tier, action
                ))
            })
    }

    /// Limit and window for `(tier, action)` on a regular or first day
    pub fn limit(
        &self,
        tier: SubscriptionTier,
        action: ActionType,
        is_first_day: bool,
    ) -> QuotaResult<(u32, WindowSpec)> {
        let entry = self.entry(tier, action)?;
        Ok((entry.limit_for(is_first_day), entry.window))
    }

    /// Rolling-window entry for `action`
    pub fn rolling_limit(&self, action: ActionType) -> QuotaResult<&RollingLimit> {
        self.rolling
            .iter()
            .find(|r| r.action == action)
            .ok_or_else(|| {
                QuotaError::Configuration(format!("no rolling policy for action '{}'", action))
            })
    }

    /// Resolve the policy for one check
    pub fn resolve(
        &self,
        tier: SubscriptionTier,
        action: ActionType,
        strategy: PolicyStrategy,
        is_first_day: bool,
    ) -> QuotaResult<ResolvedPolicy> {
        match strategy {
            PolicyStrategy::Tiered => {
                let entry = self.entry(tier, action)?;
                Ok(ResolvedPolicy {
                    scope: entry.scope,
                    limit: entry.limit_for(is_first_day),
                    window: entry.window,
                    first_day_applied: is_first_day && entry.first_day_limit.is_some(),
                })
            }
            PolicyStrategy::Rolling => {
                let rolling = self.rolling_limit(action)?;
                Ok(ResolvedPolicy {
                    scope: UsageScope::Action(action),
                    limit: rolling.limit,
                    window: WindowSpec::Rolling {
                        duration_secs: rolling.duration_secs,
                    },
                    first_day_applied: false,
                })
            }
        }
    }

    /// Reset hour used for a tier's "today" in usage summaries.
    ///
    /// [`PolicyTable::validate`] rejects tiers whose calendar-day entries
    /// disagree, so the first one found speaks for the tier.
    pub fn day_reset_hour(&self, tier: SubscriptionTier) -> u32 {
        self.entries
            .iter()
            .filter(|e| e.tier == tier)
            .find_map(|e| match e.window {
                WindowSpec::CalendarDay { reset_hour } => Some(reset_hour),
                WindowSpec::Rolling { .. } => None,
            })
            .unwrap_or(0)
    }

    /// Reject tables that would misbehave at evaluation time
    pub fn validate(&self) -> QuotaResult<()> {
        for (i, entry) in self.entries.iter().enumerate() {
            match entry.window {
                WindowSpec::CalendarDay { reset_hour } if reset_hour > 23 => {
                    return Err(QuotaError::Configuration(format!(
                        "policy for {} {:?}: reset_hour {} is not an hour of the day",
                        entry.tier, entry.scope, reset_hour
                    )));
                }
                WindowSpec::CalendarDay { reset_hour } => {
                    let tier_hour = self.day_reset_hour(entry.tier);
                    if reset_hour != tier_hour {
                        return Err(QuotaError::Configuration(format!(
                            "policy for {} {:?}: reset_hour {} differs from the tier's reset_hour {}",
                            entry.tier, entry.scope, reset_hour, tier_hour
                        )));
                    }
                }
                WindowSpec::Rolling { duration_secs } => {
                    if let Err(QuotaError::Configuration(msg)) = rolling_duration(duration_secs) {
                        return Err(QuotaError::Configuration(format!(
                            "policy for {} {:?}: {}",
                            entry.tier, entry.scope, msg
                        )));
                    }
                }
            }
            let duplicate = self.entries[..i]
                .iter()
                .any(|e| e.tier == entry.tier && e.scope == entry.scope);
            if duplicate {
                return Err(QuotaError::Configuration(format!(
                    "duplicate policy for {} {:?}",
                    entry.tier, entry.scope
                )));
            }
        }
        for rolling in &self.rolling {
            if let Err(QuotaError::Configuration(msg)) = rolling_duration(rolling.duration_secs) {
                return Err(QuotaError::Configuration(format!(
                    "rolling policy for {}: {}",
                    rolling.action, msg
                )));
            }
        }
        Ok(())
    }
}
