use diesel::prelude::*;
use serde::Serialize;
use chrono::{DateTime, Utc};
use shared::*;
use crate::error::StoreError;
use crate::secrets::SealedSecret;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = crate::schema::inventory_accounts)]
pub struct AccountRow {
    pub id: i64,
    pub product_id: i64,
    pub account_email: String,
    pub sealed_secret: String,
    pub kind: String,
    pub capacity: i32,
    pub occupancy: i32,
    pub state: String,
    pub notes: String,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::inventory_accounts)]
pub struct NewAccountRow {
    pub product_id: i64,
    pub account_email: String,
    pub sealed_secret: String,
    pub kind: String,
    pub capacity: i32,
    pub occupancy: i32,
    pub state: String,
    pub notes: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = crate::schema::assignments)]
pub struct AssignmentRow {
    pub id: i64,
    pub customer_email: String,
    pub customer_user_id: Option<i64>,
    pub account_id: i64,
    pub order_id: i64,
    pub product_id: i64,
    pub unit: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: String,
    pub notified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::assignments)]
pub struct NewAssignmentRow {
    pub customer_email: String,
    pub customer_user_id: Option<i64>,
    pub account_id: i64,
    pub order_id: i64,
    pub product_id: i64,
    pub unit: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub status: String,
}

/// An inventory row with its enums decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct InventoryAccount {
    pub id: AccountId,
    pub product_id: ProductId,
    pub account_email: String,
    pub sealed_secret: SealedSecret,
    pub kind: AccountKind,
    pub capacity: i32,
    pub occupancy: i32,
    pub state: AccountState,
    pub notes: String,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Version-guarded write of an account's occupancy and state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountMutation {
    pub account_id: AccountId,
    pub expected_version: i32,
    pub occupancy: i32,
    pub state: AccountState,
}

impl InventoryAccount {
    /// Whether one more holder fits on this row.
    pub fn has_room(&self) -> bool {
        match self.kind {
            AccountKind::Dedicated => self.state == AccountState::Free,
            AccountKind::Shared => {
                self.occupancy < self.capacity && self.state != AccountState::Closed
            }
        }
    }

    /// The write that adds one holder, or `None` when the row is full.
    pub fn claim(&self) -> Option<AccountMutation> {
        if !self.has_room() {
            return None;
        }
        let (occupancy, state) = match self.kind {
            AccountKind::Dedicated => (1, AccountState::InUse),
            AccountKind::Shared => {
                let occupancy = self.occupancy + 1;
                (occupancy, AccountState::for_occupancy(occupancy, self.capacity))
            }
        };
        Some(self.mutation(occupancy, state))
    }

    /// The write that removes one holder, or `None` when nobody holds the row.
    pub fn release(&self) -> Option<AccountMutation> {
        let (occupancy, state) = match self.kind {
            AccountKind::Dedicated if self.state == AccountState::InUse => (0, AccountState::Free),
            AccountKind::Shared if self.occupancy > 0 => {
                let occupancy = self.occupancy - 1;
                (occupancy, AccountState::for_occupancy(occupancy, self.capacity))
            }
            _ => return None,
        };
        Some(self.mutation(occupancy, state))
    }

    /// Apply a mutation that the store accepted.
    pub fn apply(&mut self, mutation: &AccountMutation, at: DateTime<Utc>) {
        self.occupancy = mutation.occupancy;
        self.state = mutation.state;
        self.version = mutation.expected_version + 1;
        self.updated_at = at;
    }

    fn mutation(&self, occupancy: i32, state: AccountState) -> AccountMutation {
        AccountMutation {
            account_id: self.id,
            expected_version: self.version,
            occupancy,
            state,
        }
    }
}

impl TryFrom<AccountRow> for InventoryAccount {
    type Error = StoreError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        let kind = row
            .kind
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("account {}: {}", row.id, e)))?;
        let state = row
            .state
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("account {}: {}", row.id, e)))?;

        Ok(Self {
            id: row.id,
            product_id: row.product_id,
            account_email: row.account_email,
            sealed_secret: SealedSecret::from_stored(row.sealed_secret),
            kind,
            capacity: row.capacity,
            occupancy: row.occupancy,
            state,
            notes: row.notes,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Input for a new inventory row (admin entry or bulk import).
#[derive(Debug, Clone, PartialEq)]
pub struct NewInventoryAccount {
    pub product_id: ProductId,
    pub account_email: String,
    pub sealed_secret: SealedSecret,
    pub kind: AccountKind,
    pub capacity: i32,
    pub occupancy: i32,
    pub state: AccountState,
    pub notes: String,
}

impl From<NewInventoryAccount> for NewAccountRow {
    fn from(account: NewInventoryAccount) -> Self {
        Self {
            product_id: account.product_id,
            account_email: account.account_email,
            sealed_secret: account.sealed_secret.into_inner(),
            kind: account.kind.as_str().to_string(),
            capacity: account.capacity,
            occupancy: account.occupancy,
            state: account.state.as_str().to_string(),
            notes: account.notes,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub id: AssignmentId,
    pub customer: CustomerIdentity,
    pub account_id: AccountId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub unit: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: AssignmentStatus,
    /// When the customer was sent the access details; `None` until then.
    pub notified_at: Option<DateTime<Utc>>,
}

impl TryFrom<AssignmentRow> for Assignment {
    type Error = StoreError;

    fn try_from(row: AssignmentRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("assignment {}: {}", row.id, e)))?;

        Ok(Self {
            id: row.id,
            customer: CustomerIdentity {
                email: row.customer_email,
                user_id: row.customer_user_id,
            },
            account_id: row.account_id,
            order_id: row.order_id,
            product_id: row.product_id,
            unit: row.unit,
            started_at: row.started_at,
            ended_at: row.ended_at,
            status,
            notified_at: row.notified_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAssignment {
    pub customer: CustomerIdentity,
    pub account_id: AccountId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub unit: Option<i32>,
    pub started_at: DateTime<Utc>,
}

impl From<NewAssignment> for NewAssignmentRow {
    fn from(assignment: NewAssignment) -> Self {
        Self {
            customer_email: assignment.customer.email,
            customer_user_id: assignment.customer.user_id,
            account_id: assignment.account_id,
            order_id: assignment.order_id,
            product_id: assignment.product_id,
            unit: assignment.unit,
            started_at: assignment.started_at,
            status: AssignmentStatus::Active.as_str().to_string(),
        }
    }
}

/// Assignment joined with the public parts of its account, for read APIs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssignmentView {
    pub assignment_id: AssignmentId,
    pub customer_email: String,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub account_id: AccountId,
    pub account_email: String,
    pub kind: AccountKind,
    pub status: AssignmentStatus,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub free: i64,
    pub in_use: i64,
    pub closed: i64,
}

impl StateCounts {
    pub fn add(&mut self, state: AccountState, count: i64) {
        match state {
            AccountState::Free => self.free += count,
            AccountState::InUse => self.in_use += count,
            AccountState::Closed => self.closed += count,
        }
    }

    pub fn total(&self) -> i64 {
        self.free + self.in_use + self.closed
    }
}
