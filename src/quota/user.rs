//! User records
//!
//! Users are owned by the auth/billing subsystem. The quota engine only
//! reads them through the [`UserDirectory`] port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::error::QuotaResult;
use super::policy::SubscriptionTier;

/// User record as supplied by auth/billing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub subscription_tier: SubscriptionTier,
    #[serde(default)]
    pub subscription_ends_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>, tier: SubscriptionTier) -> Self {
        Self {
            id: id.into(),
            created_at,
            subscription_tier: tier,
            subscription_ends_at: None,
        }
    }

    pub fn with_subscription_end(mut self, ends_at: DateTime<Utc>) -> Self {
        self.subscription_ends_at = Some(ends_at);
        self
    }

    /// Tier that applies at `now`.
    ///
    /// A premium subscription whose end date has passed is evaluated as free.
    pub fn effective_tier(&self, now: DateTime<Utc>) -> SubscriptionTier {
        match (self.subscription_tier, self.subscription_ends_at) {
            (SubscriptionTier::Premium, Some(ends_at)) if ends_at <= now => SubscriptionTier::Free,
            (tier, _) => tier,
        }
    }
}

/// Read access to user records
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Fetch a user, `None` if the id is unknown
    async fn get_user(&self, user_id: &str) -> QuotaResult<Option<User>>;
}

/// In-memory user directory
#[derive(Debug, Clone, Default)]
pub struct InMemoryUserDirectory {
    users: Arc<RwLock<HashMap<String, User>>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a directory from a list of users
    pub fn from_users(users: impl IntoIterator<Item = User>) -> Self {
        let map = users.into_iter().map(|u| (u.id.clone(), u)).collect();
        Self {
            users: Arc::new(RwLock::new(map)),
        }
    }

    /// Insert or replace a user
    pub async fn upsert(&self, user: User) {
        self.users.write().await.insert(user.id.clone(), user);
    }

    pub async fn remove(&self, user_id: &str) -> Option<User> {
        self.users.write().await.remove(user_id)
    }

    pub async fn count(&self) -> usize {
        self.users.read().await.len()
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn get_user(&self, user_id: &str) -> QuotaResult<Option<User>> {
        Ok(self.users.read().await.get(user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_effective_tier_active_premium() {
        let user = User::new("u1", t0(), SubscriptionTier::Premium)
            .with_subscription_end(t0() + Duration::days(30));
        assert_eq!(user.effective_tier(t0()), SubscriptionTier::Premium);
    }

    #[test]
    fn test_effective_tier_lapsed_premium() {
        let user = User::new("u1", t0(), SubscriptionTier::Premium)
            .with_subscription_end(t0() + Duration::days(1));
        assert_eq!(
            user.effective_tier(t0() + Duration::days(1)),
            SubscriptionTier::Free
        );
    }

    #[test]
    fn test_effective_tier_free_unchanged() {
        let user = User::new("u1", t0(), SubscriptionTier::Free);
        assert_eq!(user.effective_tier(t0()), SubscriptionTier::Free);
    }

    #[tokio::test]
    async fn test_directory_lookup() {
        let dir = InMemoryUserDirectory::from_users([User::new("u1", t0(), SubscriptionTier::Free)]);
        assert!(dir.get_user("u1").await.unwrap().is_some());
        assert!(dir.get_user("missing").await.unwrap().is_none());

        dir.upsert(User::new("u2", t0(), SubscriptionTier::Premium)).await;
        assert_eq!(dir.count().await, 2);
        assert!(dir.remove("u1").await.is_some());
        assert_eq!(dir.count().await, 1);
    }

    #[test]
    fn test_user_json_shape() {
        let json = r#"{"id":"u9","createdAt":"2024-05-10T09:00:00Z","subscriptionTier":"premium"}"#;
        let user: User = serde_json::from_str(json).unwrap();
        assert_eq!(user.subscription_tier, SubscriptionTier::Premium);
        assert!(user.subscription_ends_at.is_none());
    }
}
