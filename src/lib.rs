//! Lectern Quota Library
//!
//! Usage accounting and rate limiting for metered learner actions:
//! explanations, chat messages and file uploads.

pub mod config;
pub mod metrics;
pub mod quota;
