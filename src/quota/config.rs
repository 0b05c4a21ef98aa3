//! Quota Guard Configuration
//!
//! Injected configuration for the guard: the policy table, how storage
//! failures are treated, how check and consume are serialized, and the
//! reference calendar.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{QuotaError, QuotaResult};
use super::policy::{ActionType, PolicyTable, SubscriptionTier, UsageScope};
use super::retry::RetryConfig;
use super::window::ReferenceCalendar;

/// What `check` does when the ledger cannot be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageErrorPolicy {
    /// Admit the action and log a warning
    FailOpen,
    /// Surface the storage error; the action is not admitted
    #[default]
    FailClosed,
}

/// How `check_and_consume` isolates concurrent attempts by the same user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Atomicity {
    /// Check and consume run under a per-user lock
    #[default]
    Serialized,
    /// Check and consume run back to back with no isolation; concurrent
    /// attempts can overshoot the limit
    BestEffort,
}

impl std::str::FromStr for StorageErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_open" | "open" => Ok(StorageErrorPolicy::FailOpen),
            "fail_closed" | "closed" => Ok(StorageErrorPolicy::FailClosed),
            other => Err(format!("unknown storage error policy '{}'", other)),
        }
    }
}

impl std::str::FromStr for Atomicity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "serialized" => Ok(Atomicity::Serialized),
            "best_effort" => Ok(Atomicity::BestEffort),
            other => Err(format!("unknown atomicity '{}'", other)),
        }
    }
}

/// Quota guard configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Behavior of `check` on ledger read failures
    pub on_storage_error: StorageErrorPolicy,

    /// Isolation of check-then-consume
    pub atomicity: Atomicity,

    /// Reference calendar offset east of UTC, in seconds
    pub reference_utc_offset_secs: i32,

    /// Per-operation deadline in milliseconds
    pub deadline_ms: Option<u64>,

    /// Backoff for retried reads
    pub retry: RetryConfig,

    /// Limits table
    pub policy: PolicyTable,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            on_storage_error: StorageErrorPolicy::default(),
            atomicity: Atomicity::default(),
            reference_utc_offset_secs: 0,
            deadline_ms: None,
            retry: RetryConfig::default(),
            policy: PolicyTable::default(),
        }
    }
}

impl GuardConfig {
    /// Create a new guard configuration with product defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self::default().apply_env_overrides()
    }

    /// Apply `LECTERN_*` environment overrides; unparsable values are ignored
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("LECTERN_ON_STORAGE_ERROR") {
            if let Ok(policy) = val.parse() {
                self.on_storage_error = policy;
            }
        }

        if let Ok(val) = std::env::var("LECTERN_ATOMICITY") {
            if let Ok(atomicity) = val.parse() {
                self.atomicity = atomicity;
            }
        }

        if let Ok(val) = std::env::var("LECTERN_UTC_OFFSET_SECS") {
            if let Ok(offset) = val.parse() {
                self.reference_utc_offset_secs = offset;
            }
        }

        if let Ok(val) = std::env::var("LECTERN_DEADLINE_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.deadline_ms = (ms > 0).then_some(ms);
            }
        }

        if let Ok(val) = std::env::var("LECTERN_FREE_DAILY_LIMIT") {
            if let Ok(limit) = val.parse() {
                self.set_tier_limit(SubscriptionTier::Free, UsageScope::AllActions, limit);
            }
        }

        if let Ok(val) = std::env::var("LECTERN_FREE_FIRST_DAY_LIMIT") {
            if let Ok(limit) = val.parse() {
                self.set_first_day_limit(SubscriptionTier::Free, UsageScope::AllActions, limit);
            }
        }

        if let Ok(val) = std::env::var("LECTERN_CHAT_HOURLY_LIMIT") {
            if let Ok(limit) = val.parse() {
                self.set_rolling_limit(ActionType::ChatMessage, limit);
            }
        }

        self
    }

    fn set_tier_limit(&mut self, tier: SubscriptionTier, scope: UsageScope, limit: u32) {
        for entry in self.policy.entries.iter_mut() {
            if entry.tier == tier && entry.scope == scope {
                entry.limit = limit;
            }
        }
    }

    fn set_first_day_limit(&mut self, tier: SubscriptionTier, scope: UsageScope, limit: u32) {
        for entry in self.policy.entries.iter_mut() {
            if entry.tier == tier && entry.scope == scope {
                entry.first_day_limit = Some(limit);
            }
        }
    }

    fn set_rolling_limit(&mut self, action: ActionType, limit: u32) {
        for rolling in self.policy.rolling.iter_mut() {
            if rolling.action == action {
                rolling.limit = limit;
            }
        }
    }

    /// Reference calendar for day boundaries
    pub fn calendar(&self) -> QuotaResult<ReferenceCalendar> {
        ReferenceCalendar::with_offset_secs(self.reference_utc_offset_secs)
    }

    /// Per-operation deadline
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> QuotaResult<()> {
        self.calendar()?;
        if self.deadline_ms == Some(0) {
            return Err(QuotaError::Configuration(
                "deadline_ms must be positive when set".to_string(),
            ));
        }
        self.policy.validate()
    }

    /// Strict configuration with a replacement table (for testing)
    pub fn with_policy(policy: PolicyTable) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }
}
