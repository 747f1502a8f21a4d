#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use inventory_service::models::*;
use inventory_service::{
    AssignmentLedger, InMemoryStore, InventoryStore, PolicyDirectory, SealedSecret, SecretBox, StoreError,
};
use shared::*;
use tokio::task::yield_now;

pub fn secrets() -> SecretBox {
    SecretBox::from_base64(&SecretBox::generate_key()).unwrap()
}

pub fn customer(email: &str) -> CustomerIdentity {
    CustomerIdentity::new(email)
}

pub fn new_shared(secrets: &SecretBox, product_id: ProductId, capacity: i32, occupancy: i32) -> NewInventoryAccount {
    NewInventoryAccount {
        product_id,
        account_email: format!("shared-{product_id}-{capacity}-{occupancy}@pool.example"),
        sealed_secret: secrets.seal(&format!("pw-shared-{product_id}")).unwrap(),
        kind: AccountKind::Shared,
        capacity,
        occupancy,
        state: AccountState::for_occupancy(occupancy, capacity),
        notes: String::new(),
    }
}

pub fn new_dedicated(secrets: &SecretBox, product_id: ProductId, login: &str) -> NewInventoryAccount {
    NewInventoryAccount {
        product_id,
        account_email: format!("{login}@pool.example"),
        sealed_secret: secrets.seal(&format!("pw-{login}")).unwrap(),
        kind: AccountKind::Dedicated,
        capacity: 1,
        occupancy: 0,
        state: AccountState::Free,
        notes: String::new(),
    }
}

/// A row with a caller-chosen id, for `InMemoryStore::put`.
pub fn account(id: AccountId, product_id: ProductId, kind: AccountKind, capacity: i32, occupancy: i32) -> InventoryAccount {
    let state = match kind {
        AccountKind::Shared => AccountState::for_occupancy(occupancy, capacity),
        AccountKind::Dedicated if occupancy > 0 => AccountState::InUse,
        AccountKind::Dedicated => AccountState::Free,
    };
    InventoryAccount {
        id,
        product_id,
        account_email: format!("account-{id}@pool.example"),
        sealed_secret: SealedSecret::from_stored("v1.unused.unused"),
        kind,
        capacity,
        occupancy,
        state,
        notes: String::new(),
        version: 0,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// `InMemoryStore` that suspends once per call, like a database round trip,
/// so concurrent tasks interleave between reading a row and writing it.
pub struct YieldingStore(pub Arc<InMemoryStore>);

impl YieldingStore {
    pub fn wrap(store: &Arc<InMemoryStore>) -> Arc<Self> {
        Arc::new(Self(store.clone()))
    }
}

#[async_trait]
impl InventoryStore for YieldingStore {
    async fn has_dedicated(&self, product_id: ProductId) -> Result<bool, StoreError> {
        yield_now().await;
        self.0.has_dedicated(product_id).await
    }

    async fn find_candidate(&self, product_id: ProductId, kind: AccountKind) -> Result<Option<InventoryAccount>, StoreError> {
        yield_now().await;
        self.0.find_candidate(product_id, kind).await
    }

    async fn commit_mutation(&self, mutation: &AccountMutation) -> Result<bool, StoreError> {
        yield_now().await;
        self.0.commit_mutation(mutation).await
    }

    async fn claim_seat(&self, account_id: AccountId) -> Result<Option<InventoryAccount>, StoreError> {
        yield_now().await;
        self.0.claim_seat(account_id).await
    }

    async fn release_seat(&self, account_id: AccountId) -> Result<bool, StoreError> {
        yield_now().await;
        self.0.release_seat(account_id).await
    }

    async fn load(&self, account_id: AccountId) -> Result<Option<InventoryAccount>, StoreError> {
        yield_now().await;
        self.0.load(account_id).await
    }

    async fn insert(&self, accounts: Vec<NewInventoryAccount>) -> Result<Vec<InventoryAccount>, StoreError> {
        yield_now().await;
        self.0.insert(accounts).await
    }

    async fn count_by_state(&self) -> Result<StateCounts, StoreError> {
        yield_now().await;
        self.0.count_by_state().await
    }
}

#[async_trait]
impl AssignmentLedger for YieldingStore {
    async fn append(&self, assignment: NewAssignment) -> Result<Assignment, StoreError> {
        yield_now().await;
        self.0.append(assignment).await
    }

    async fn active_for_order(&self, order_id: OrderId) -> Result<Vec<Assignment>, StoreError> {
        yield_now().await;
        self.0.active_for_order(order_id).await
    }

    async fn mark_notified(&self, ids: &[AssignmentId], at: DateTime<Utc>) -> Result<(), StoreError> {
        yield_now().await;
        self.0.mark_notified(ids, at).await
    }

    async fn active_for_customer(&self, email: &str) -> Result<Vec<AssignmentView>, StoreError> {
        yield_now().await;
        self.0.active_for_customer(email).await
    }

    async fn recent(&self, limit: i64) -> Result<Vec<AssignmentView>, StoreError> {
        yield_now().await;
        self.0.recent(limit).await
    }

    async fn count_active(&self) -> Result<i64, StoreError> {
        yield_now().await;
        self.0.count_active().await
    }
}

#[async_trait]
impl PolicyDirectory for YieldingStore {
    async fn declared_kind(&self, product_id: ProductId) -> Result<Option<AccountKind>, StoreError> {
        yield_now().await;
        self.0.declared_kind(product_id).await
    }
}
