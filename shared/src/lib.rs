use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Storefront product identifier.
pub type ProductId = i64;

/// Storefront order identifier.
pub type OrderId = i64;

/// Inventory row identifier.
pub type AccountId = i64;

/// Ledger row identifier.
pub type AssignmentId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    /// Held by exactly one customer at a time.
    Dedicated,
    /// Held by up to `capacity` customers at a time.
    Shared,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Dedicated => "dedicated",
            AccountKind::Shared => "shared",
        }
    }
}

impl FromStr for AccountKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dedicated" => Ok(AccountKind::Dedicated),
            "shared" => Ok(AccountKind::Shared),
            other => Err(UnknownVariant { kind: "account kind", value: other.to_string() }),
        }
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    Free,
    InUse,
    Closed,
}

impl AccountState {
    pub const ALL: [AccountState; 3] = [AccountState::Free, AccountState::InUse, AccountState::Closed];

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountState::Free => "free",
            AccountState::InUse => "in_use",
            AccountState::Closed => "closed",
        }
    }

    /// State of a shared account holding `occupancy` of `capacity` seats.
    pub fn for_occupancy(occupancy: i32, capacity: i32) -> Self {
        if occupancy >= capacity {
            AccountState::Closed
        } else if occupancy > 0 {
            AccountState::InUse
        } else {
            AccountState::Free
        }
    }
}

impl FromStr for AccountState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(AccountState::Free),
            "in_use" => Ok(AccountState::InUse),
            "closed" => Ok(AccountState::Closed),
            other => Err(UnknownVariant { kind: "account state", value: other.to_string() }),
        }
    }
}

impl fmt::Display for AccountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Active,
    Inactive,
    Expired,
    Cancelled,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Active => "active",
            AssignmentStatus::Inactive => "inactive",
            AssignmentStatus::Expired => "expired",
            AssignmentStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for AssignmentStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AssignmentStatus::Active),
            "inactive" => Ok(AssignmentStatus::Inactive),
            "expired" => Ok(AssignmentStatus::Expired),
            "cancelled" => Ok(AssignmentStatus::Cancelled),
            other => Err(UnknownVariant { kind: "assignment status", value: other.to_string() }),
        }
    }
}

/// Who an allocation is made for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerIdentity {
    pub email: String,
    pub user_id: Option<i64>,
}

impl CustomerIdentity {
    pub fn new(email: impl Into<String>) -> Self {
        Self { email: email.into(), user_id: None }
    }

    pub fn with_user_id(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

/// Published by the storefront whenever an order changes status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusChanged {
    pub order_id: OrderId,
    pub status: String,
    pub occurred_at: DateTime<Utc>,
}

impl OrderStatusChanged {
    /// Orders are fulfilled once they are paid, i.e. processing or completed.
    pub fn is_fulfillable(&self) -> bool {
        matches!(self.status.as_str(), "processing" | "completed")
    }
}

/// Access details for one allocated account, with the secret in clear.
#[derive(Clone, Serialize, Deserialize)]
pub struct AccessDetails {
    pub product_id: ProductId,
    pub account_id: AccountId,
    pub kind: AccountKind,
    pub account_email: String,
    pub secret: String,
}

impl fmt::Debug for AccessDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessDetails")
            .field("product_id", &self.product_id)
            .field("account_id", &self.account_id)
            .field("kind", &self.kind)
            .field("account_email", &self.account_email)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerNotification {
    pub id: Uuid,
    pub order_id: OrderId,
    pub customer: CustomerIdentity,
    pub items: Vec<AccessDetails>,
    pub created_at: DateTime<Utc>,
}

impl CustomerNotification {
    pub fn new(order_id: OrderId, customer: CustomerIdentity, items: Vec<AccessDetails>) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            customer,
            items,
            created_at: Utc::now(),
        }
    }
}
