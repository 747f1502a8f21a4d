//! Error types for the inventory store and the allocator.

use shared::{OrderId, ProductId};
use thiserror::Error;

/// Failure talking to the inventory store or the assignment ledger.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("order {order_id} already holds unit {unit} of product {product_id}")]
    DuplicateUnit {
        order_id: OrderId,
        product_id: ProductId,
        unit: i32,
    },

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Map a diesel insert failure, recognising the per-unit uniqueness guard.
    pub fn from_insert(err: diesel::result::Error, order_id: OrderId, product_id: ProductId, unit: Option<i32>) -> Self {
        use diesel::result::{DatabaseErrorKind, Error as DieselError};

        match (err, unit) {
            (DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _), Some(unit)) => {
                StoreError::DuplicateUnit { order_id, product_id, unit }
            }
            (err, _) => StoreError::Database(err),
        }
    }
}

impl From<bb8::RunError<diesel_async::pooled_connection::PoolError>> for StoreError {
    fn from(err: bb8::RunError<diesel_async::pooled_connection::PoolError>) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Outcome of a failed `Allocator::allocate` call.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("invalid allocation request: {0}")]
    InvalidInput(String),

    #[error("no capacity left for product {product_id}")]
    NoCapacity { product_id: ProductId },

    #[error("product {product_id}: gave up after {attempts} conflicting attempts")]
    ConcurrentConflict { product_id: ProductId, attempts: u32 },

    #[error("order {order_id} already holds unit {unit} of product {product_id}")]
    AlreadyAllocated {
        order_id: OrderId,
        product_id: ProductId,
        unit: i32,
    },

    #[error("persistence failure: {0}")]
    PersistenceFailure(#[source] StoreError),
}

impl From<StoreError> for AllocationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateUnit { order_id, product_id, unit } => {
                AllocationError::AlreadyAllocated { order_id, product_id, unit }
            }
            other => AllocationError::PersistenceFailure(other),
        }
    }
}
