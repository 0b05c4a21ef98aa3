//! Usage Accounting and Quota Module
//!
//! Decides whether a user may perform a metered action and records the
//! action once it has been performed.
//!
//! # Features
//!
//! - Tier-indexed policy table with a first-day bonus
//! - Calendar-day and rolling windows, selectable per check
//! - Append-only usage ledger (in-memory or durable JSON lines)
//! - Per-user serialization of check-then-consume
//! - Idempotent consume and explicit fail-open / fail-closed handling
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Quota Guard                           │
//! │        check / consume / admit / check_and_consume / stats   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────────┐  ┌───────────────┐  │
//! │  │ Policy Table │  │ Window Evaluator │  │ User Directory│  │
//! │  └──────────────┘  └──────────────────┘  └───────────────┘  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │          Usage Ledger (In-Memory + File)             │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod clock;
pub mod config;
pub mod deadline;
pub mod error;
pub mod file_ledger;
pub mod guard;
pub mod ledger;
pub mod locks;
pub mod policy;
pub mod response;
pub mod retry;
pub mod user;
pub mod window;

#[cfg(test)]
mod proptests;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Atomicity, GuardConfig, StorageErrorPolicy};
pub use deadline::OperationDeadline;
pub use error::{QuotaError, QuotaResult};
pub use file_ledger::FileLedger;
pub use guard::{Admission, AdmissionOutcome, AdmissionTicket, Decision, QuotaGuard, UsageSummary};
pub use ledger::{AppendOutcome, InMemoryLedger, TimeRange, UsageEvent, UsageLedger, UsageSum};
pub use policy::{
    ActionType, PolicyEntry, PolicyStrategy, PolicyTable, SubscriptionTier, UsageScope,
    WindowKind, WindowSpec,
};
pub use response::{ErrorPayload, RateLimitPayload};
pub use retry::RetryConfig;
pub use user::{InMemoryUserDirectory, User, UserDirectory};
pub use window::{ReferenceCalendar, WindowEvaluator};
