//! Storage seams of the allocation engine.
//!
//! The allocator only talks to these traits. `postgres` is the production
//! backend; `memory` backs tests and local runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::*;

use crate::error::StoreError;
use crate::models::*;

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::{DbPool, PgStore};

/// Most assignments returned for one customer.
pub const CUSTOMER_VIEW_LIMIT: i64 = 100;

/// Inventory rows and their version-guarded mutations.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Whether any dedicated row exists for the product, whatever its state.
    async fn has_dedicated(&self, product_id: ProductId) -> Result<bool, StoreError>;

    /// Best row to allocate from under the given kind's policy:
    /// dedicated picks the oldest free row, shared picks the fullest row that
    /// still has room (ties by lowest id).
    async fn find_candidate(
        &self,
        product_id: ProductId,
        kind: AccountKind,
    ) -> Result<Option<InventoryAccount>, StoreError>;

    /// Write occupancy and state only if the row is still at
    /// `expected_version`. Returns `false` when it moved on. Used for
    /// dedicated rows.
    async fn commit_mutation(&self, mutation: &AccountMutation) -> Result<bool, StoreError>;

    /// Take one seat on a shared row in a single conditional write that also
    /// derives the new state. Returns the updated row, or `None` when the row
    /// is full, closed or not shared. Seats taken by others do not make this
    /// fail while room remains.
    async fn claim_seat(&self, account_id: AccountId) -> Result<Option<InventoryAccount>, StoreError>;

    /// Give back one seat on a shared row. Returns `false` when it held none.
    async fn release_seat(&self, account_id: AccountId) -> Result<bool, StoreError>;

    async fn load(&self, account_id: AccountId) -> Result<Option<InventoryAccount>, StoreError>;

    async fn insert(&self, accounts: Vec<NewInventoryAccount>) -> Result<Vec<InventoryAccount>, StoreError>;

    async fn count_by_state(&self) -> Result<StateCounts, StoreError>;
}

/// Append-mostly log of customer/account bindings.
#[async_trait]
pub trait AssignmentLedger: Send + Sync {
    /// Record an active assignment. Fails with `StoreError::DuplicateUnit`
    /// when the order already holds that unit of the product.
    async fn append(&self, assignment: NewAssignment) -> Result<Assignment, StoreError>;

    /// Active assignments created for an order, oldest first.
    async fn active_for_order(&self, order_id: OrderId) -> Result<Vec<Assignment>, StoreError>;

    /// Stamp assignments whose access details reached the customer.
    async fn mark_notified(&self, ids: &[AssignmentId], at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Newest first, at most `CUSTOMER_VIEW_LIMIT` rows.
    async fn active_for_customer(&self, email: &str) -> Result<Vec<AssignmentView>, StoreError>;

    /// Latest assignments first.
    async fn recent(&self, limit: i64) -> Result<Vec<AssignmentView>, StoreError>;

    async fn count_active(&self) -> Result<i64, StoreError>;
}

/// Explicit per-product kind declarations.
#[async_trait]
pub trait PolicyDirectory: Send + Sync {
    async fn declared_kind(&self, product_id: ProductId) -> Result<Option<AccountKind>, StoreError>;
}
