use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::*;

use super::{AssignmentLedger, InventoryStore, PolicyDirectory, CUSTOMER_VIEW_LIMIT};
use crate::error::StoreError;
use crate::models::*;

#[derive(Debug, Default)]
struct State {
    accounts: BTreeMap<AccountId, InventoryAccount>,
    assignments: Vec<Assignment>,
    policies: HashMap<ProductId, AccountKind>,
}

/// In-memory inventory, ledger and policy directory.
///
/// Emulates the conditional update of the database under one lock. Intended
/// for tests/dev; it cannot coordinate several processes.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a row with a caller-chosen id.
    pub fn put(&self, account: InventoryAccount) -> Result<(), StoreError> {
        self.write()?.accounts.insert(account.id, account);
        Ok(())
    }

    pub fn declare_policy(&self, product_id: ProductId, kind: AccountKind) -> Result<(), StoreError> {
        self.write()?.policies.insert(product_id, kind);
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }

    fn view(state: &State, assignment: &Assignment) -> Option<AssignmentView> {
        let account = state.accounts.get(&assignment.account_id)?;
        Some(AssignmentView {
            assignment_id: assignment.id,
            customer_email: assignment.customer.email.clone(),
            order_id: assignment.order_id,
            product_id: assignment.product_id,
            account_id: account.id,
            account_email: account.account_email.clone(),
            kind: account.kind,
            status: assignment.status,
            started_at: assignment.started_at,
        })
    }
}

#[async_trait]
impl InventoryStore for InMemoryStore {
    async fn has_dedicated(&self, product_id: ProductId) -> Result<bool, StoreError> {
        Ok(self
            .read()?
            .accounts
            .values()
            .any(|a| a.product_id == product_id && a.kind == AccountKind::Dedicated))
    }

    async fn find_candidate(
        &self,
        product_id: ProductId,
        kind: AccountKind,
    ) -> Result<Option<InventoryAccount>, StoreError> {
        let state = self.read()?;
        let eligible = state
            .accounts
            .values()
            .filter(|a| a.product_id == product_id && a.kind == kind && a.has_room());

        // Reverse(id) makes the lowest id win occupancy ties.
        let candidate = match kind {
            AccountKind::Dedicated => eligible.min_by_key(|a| a.id),
            AccountKind::Shared => eligible.max_by_key(|a| (a.occupancy, Reverse(a.id))),
        };
        Ok(candidate.cloned())
    }

    async fn commit_mutation(&self, mutation: &AccountMutation) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        match state.accounts.get_mut(&mutation.account_id) {
            Some(account) if account.version == mutation.expected_version => {
                account.apply(mutation, Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_seat(&self, account_id: AccountId) -> Result<Option<InventoryAccount>, StoreError> {
        let mut state = self.write()?;
        let Some(account) = state.accounts.get_mut(&account_id) else {
            return Ok(None);
        };
        if account.kind != AccountKind::Shared {
            return Ok(None);
        }
        let Some(claim) = account.claim() else {
            return Ok(None);
        };
        account.apply(&claim, Utc::now());
        Ok(Some(account.clone()))
    }

    async fn release_seat(&self, account_id: AccountId) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let Some(account) = state.accounts.get_mut(&account_id) else {
            return Ok(false);
        };
        if account.kind != AccountKind::Shared {
            return Ok(false);
        }
        let Some(undo) = account.release() else {
            return Ok(false);
        };
        account.apply(&undo, Utc::now());
        Ok(true)
    }

    async fn load(&self, account_id: AccountId) -> Result<Option<InventoryAccount>, StoreError> {
        Ok(self.read()?.accounts.get(&account_id).cloned())
    }

    async fn insert(&self, accounts: Vec<NewInventoryAccount>) -> Result<Vec<InventoryAccount>, StoreError> {
        let mut state = self.write()?;
        let mut next_id = state.accounts.keys().next_back().copied().unwrap_or(0) + 1;
        let now = Utc::now();

        let mut inserted = Vec::with_capacity(accounts.len());
        for new in accounts {
            let account = InventoryAccount {
                id: next_id,
                product_id: new.product_id,
                account_email: new.account_email,
                sealed_secret: new.sealed_secret,
                kind: new.kind,
                capacity: new.capacity,
                occupancy: new.occupancy,
                state: new.state,
                notes: new.notes,
                version: 0,
                created_at: now,
                updated_at: now,
            };
            next_id += 1;
            state.accounts.insert(account.id, account.clone());
            inserted.push(account);
        }
        Ok(inserted)
    }

    async fn count_by_state(&self) -> Result<StateCounts, StoreError> {
        let mut counts = StateCounts::default();
        for account in self.read()?.accounts.values() {
            counts.add(account.state, 1);
        }
        Ok(counts)
    }
}

#[async_trait]
impl AssignmentLedger for InMemoryStore {
    async fn append(&self, new: NewAssignment) -> Result<Assignment, StoreError> {
        let mut state = self.write()?;

        if let Some(unit) = new.unit {
            let taken = state.assignments.iter().any(|a| {
                a.status == AssignmentStatus::Active
                    && a.order_id == new.order_id
                    && a.product_id == new.product_id
                    && a.unit == Some(unit)
            });
            if taken {
                return Err(StoreError::DuplicateUnit {
                    order_id: new.order_id,
                    product_id: new.product_id,
                    unit,
                });
            }
        }

        let assignment = Assignment {
            id: state.assignments.len() as i64 + 1,
            customer: new.customer,
            account_id: new.account_id,
            order_id: new.order_id,
            product_id: new.product_id,
            unit: new.unit,
            started_at: new.started_at,
            ended_at: None,
            status: AssignmentStatus::Active,
            notified_at: None,
        };
        state.assignments.push(assignment.clone());
        Ok(assignment)
    }

    async fn active_for_order(&self, order_id: OrderId) -> Result<Vec<Assignment>, StoreError> {
        Ok(self
            .read()?
            .assignments
            .iter()
            .filter(|a| a.order_id == order_id && a.status == AssignmentStatus::Active)
            .cloned()
            .collect())
    }

    async fn mark_notified(&self, ids: &[AssignmentId], at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.write()?;
        for assignment in state.assignments.iter_mut().filter(|a| ids.contains(&a.id)) {
            assignment.notified_at = Some(at);
        }
        Ok(())
    }

    async fn active_for_customer(&self, email: &str) -> Result<Vec<AssignmentView>, StoreError> {
        let state = self.read()?;
        Ok(state
            .assignments
            .iter()
            .rev()
            .filter(|a| a.customer.email == email && a.status == AssignmentStatus::Active)
            .filter_map(|a| Self::view(&state, a))
            .take(CUSTOMER_VIEW_LIMIT as usize)
            .collect())
    }

    async fn recent(&self, limit: i64) -> Result<Vec<AssignmentView>, StoreError> {
        let state = self.read()?;
        Ok(state
            .assignments
            .iter()
            .rev()
            .filter_map(|a| Self::view(&state, a))
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count_active(&self) -> Result<i64, StoreError> {
        Ok(self
            .read()?
            .assignments
            .iter()
            .filter(|a| a.status == AssignmentStatus::Active)
            .count() as i64)
    }
}

#[async_trait]
impl PolicyDirectory for InMemoryStore {
    async fn declared_kind(&self, product_id: ProductId) -> Result<Option<AccountKind>, StoreError> {
        Ok(self.read()?.policies.get(&product_id).copied())
    }
}
