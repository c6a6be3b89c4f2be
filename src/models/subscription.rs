//! # Cloud Pod Subscription Model
//!
//! Maps to `cloud_pod_subscriptions`. The status column is derived from the subscription's
//! tasks by the aggregator; the only direct writes are container details recorded in the
//! `CREATE_CONTAINER` completion transaction and the externally driven transitions
//! (suspension, deprovision requests).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Customer-visible pod status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Provisioning,
    Active,
    Degraded,
    Failed,
    Suspended,
    Deprovisioning,
    Deprovisioned,
}

impl SubscriptionStatus {
    pub const ALL: [SubscriptionStatus; 7] = [
        Self::Provisioning,
        Self::Active,
        Self::Degraded,
        Self::Failed,
        Self::Suspended,
        Self::Deprovisioning,
        Self::Deprovisioned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Suspended => "suspended",
            Self::Deprovisioning => "deprovisioning",
            Self::Deprovisioned => "deprovisioned",
        }
    }

    /// Teardown requested or finished; provisioning tasks are no longer actionable.
    pub fn is_tearing_down(&self) -> bool {
        matches!(self, Self::Deprovisioning | Self::Deprovisioned)
    }

    /// Statuses the aggregator never derives away from.
    pub fn is_externally_held(&self) -> bool {
        matches!(self, Self::Suspended | Self::Deprovisioned)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Invalid subscription status: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudPodSubscription {
    pub id: Uuid,
    pub customer_id: String,
    pub plan_code: String,
    pub domain: Option<String>,
    pub status: SubscriptionStatus,
    /// Opaque handle returned by the compute adapter
    pub container_ref: Option<String>,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

impl CloudPodSubscription {
    /// Short, DNS-safe identifier used for platform-assigned names.
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..12].to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscription {
    pub customer_id: String,
    pub plan_code: String,
    pub domain: Option<String>,
}

impl NewSubscription {
    pub fn into_subscription(self, id: Uuid, now: DateTime<Utc>) -> CloudPodSubscription {
        CloudPodSubscription {
            id,
            customer_id: self.customer_id,
            plan_code: self.plan_code,
            domain: self.domain,
            status: SubscriptionStatus::Provisioning,
            container_ref: None,
            ip_address: None,
            created_at: now,
            updated_at: now,
            activated_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        assert_eq!(SubscriptionStatus::Degraded.to_string(), "degraded");
        assert_eq!(
            "deprovisioning".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::Deprovisioning
        );
        assert!("paused".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn test_new_subscription_starts_provisioning() {
        let sub = NewSubscription {
            customer_id: "cust-1".to_string(),
            plan_code: "pod-small".to_string(),
            domain: None,
        }
        .into_subscription(Uuid::new_v4(), Utc::now());

        assert_eq!(sub.status, SubscriptionStatus::Provisioning);
        assert!(sub.container_ref.is_none());
        assert_eq!(sub.short_id().len(), 12);
    }

    #[test]
    fn test_teardown_and_held_flags() {
        assert!(SubscriptionStatus::Deprovisioning.is_tearing_down());
        assert!(!SubscriptionStatus::Suspended.is_tearing_down());
        assert!(SubscriptionStatus::Suspended.is_externally_held());
        assert!(!SubscriptionStatus::Failed.is_externally_held());
    }
}
