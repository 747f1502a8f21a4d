//! Account-credential allocation for a storefront selling access to shared
//! and dedicated accounts.
//!
//! When an order is paid, [`handlers::OrderEventHandler`] asks the
//! [`allocator::Allocator`] for one inventory row per purchased unit, records
//! each binding in the assignment ledger and hands the access details to the
//! customer notifier.

pub mod allocator;
pub mod api;
pub mod error;
pub mod handlers;
pub mod import;
pub mod models;
pub mod notifier;
pub mod orders;
pub mod schema;
pub mod secrets;
pub mod store;

pub use allocator::{AllocationRequest, Allocator, AssignmentPayload};
pub use error::{AllocationError, StoreError};
pub use handlers::{FulfillmentReport, OrderEventHandler};
pub use secrets::{SealedSecret, SecretBox};
pub use store::{AssignmentLedger, InMemoryStore, InventoryStore, PgStore, PolicyDirectory};
