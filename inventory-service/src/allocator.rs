//! Allocation engine.
//!
//! Picks an inventory row for one purchased unit, claims it and records the
//! assignment. A shared row gains a seat through one conditional write, so
//! buyers of different seats never conflict. A dedicated row is claimed with a
//! version-guarded update. A lost claim re-runs the whole selection against
//! fresh rows; only `max_attempts` consecutive losses on the same row give up.
//! If the ledger refuses the assignment, the claim is undone before returning.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::*;
use tracing::{debug, error, info, warn};

use crate::error::AllocationError;
use crate::models::*;
use crate::secrets::SealedSecret;
use crate::store::{AssignmentLedger, InventoryStore, PolicyDirectory};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const RELEASE_ATTEMPTS: u32 = 5;

/// One unit of a product to allocate for an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    pub product_id: ProductId,
    pub customer: CustomerIdentity,
    pub order_id: OrderId,
    /// Ordinal of the unit within the order for this product. When set, the
    /// ledger refuses a second active assignment for the same unit.
    pub unit: Option<i32>,
}

impl AllocationRequest {
    pub fn new(product_id: ProductId, customer: CustomerIdentity, order_id: OrderId) -> Self {
        Self { product_id, customer, order_id, unit: None }
    }

    pub fn for_unit(mut self, unit: i32) -> Self {
        self.unit = Some(unit);
        self
    }

    fn validate(&self) -> Result<(), AllocationError> {
        if self.product_id <= 0 {
            return Err(AllocationError::InvalidInput(format!("product id {}", self.product_id)));
        }
        if self.order_id <= 0 {
            return Err(AllocationError::InvalidInput(format!("order id {}", self.order_id)));
        }
        let email = self.customer.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(AllocationError::InvalidInput(format!(
                "customer email '{}'",
                self.customer.email
            )));
        }
        if matches!(self.unit, Some(unit) if unit < 0) {
            return Err(AllocationError::InvalidInput("negative unit".to_string()));
        }
        Ok(())
    }
}

/// What a successful allocation hands back for relaying to the customer.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentPayload {
    pub assignment_id: AssignmentId,
    pub account_id: AccountId,
    pub product_id: ProductId,
    pub order_id: OrderId,
    pub unit: Option<i32>,
    pub kind: AccountKind,
    pub customer: CustomerIdentity,
    pub account_email: String,
    pub sealed_secret: SealedSecret,
    pub started_at: DateTime<Utc>,
}

pub struct Allocator {
    inventory: Arc<dyn InventoryStore>,
    ledger: Arc<dyn AssignmentLedger>,
    policies: Arc<dyn PolicyDirectory>,
    max_attempts: u32,
}

impl Allocator {
    pub fn new(
        inventory: Arc<dyn InventoryStore>,
        ledger: Arc<dyn AssignmentLedger>,
        policies: Arc<dyn PolicyDirectory>,
    ) -> Self {
        Self {
            inventory,
            ledger,
            policies,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Allocator over a backend that provides all three seams.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: InventoryStore + AssignmentLedger + PolicyDirectory + 'static,
    {
        Self::new(store.clone(), store.clone(), store)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub async fn allocate(&self, request: &AllocationRequest) -> Result<AssignmentPayload, AllocationError> {
        request.validate()?;
        let product_id = request.product_id;
        let kind = self.resolve_kind(product_id).await?;

        let mut contended: Option<AccountId> = None;
        let mut misses = 0u32;

        loop {
            let candidate = self
                .inventory
                .find_candidate(product_id, kind)
                .await?
                .ok_or(AllocationError::NoCapacity { product_id })?;

            // Moving on to another row means someone else used up the last one.
            if contended != Some(candidate.id) {
                contended = Some(candidate.id);
                misses = 0;
            }

            let Some(account) = self.claim(&candidate).await? else {
                misses += 1;
                debug!(product_id, account_id = candidate.id, misses, "claim lost, retrying");
                if misses >= self.max_attempts {
                    return Err(AllocationError::ConcurrentConflict { product_id, attempts: misses });
                }
                continue;
            };

            let started_at = Utc::now();
            let appended = self
                .ledger
                .append(NewAssignment {
                    customer: request.customer.clone(),
                    account_id: account.id,
                    order_id: request.order_id,
                    product_id,
                    unit: request.unit,
                    started_at,
                })
                .await;

            let assignment = match appended {
                Ok(assignment) => assignment,
                Err(e) => {
                    warn!(
                        order_id = request.order_id,
                        product_id,
                        account_id = account.id,
                        error = %e,
                        "assignment not recorded, releasing account"
                    );
                    self.release(&account).await;
                    return Err(e.into());
                }
            };

            info!(
                order_id = request.order_id,
                product_id,
                account_id = account.id,
                assignment_id = assignment.id,
                kind = %kind,
                occupancy = account.occupancy,
                state = %account.state,
                "account allocated"
            );

            return Ok(AssignmentPayload {
                assignment_id: assignment.id,
                account_id: account.id,
                product_id,
                order_id: request.order_id,
                unit: request.unit,
                kind,
                customer: request.customer.clone(),
                account_email: account.account_email,
                sealed_secret: account.sealed_secret,
                started_at: assignment.started_at,
            });
        }
    }

    /// Take the candidate. Shared rows gain one seat in a single conditional
    /// write; dedicated rows flip to in use only if nobody touched them since
    /// they were read. Returns the row as written, or `None` if the claim lost.
    async fn claim(&self, candidate: &InventoryAccount) -> Result<Option<InventoryAccount>, AllocationError> {
        match candidate.kind {
            AccountKind::Shared => Ok(self.inventory.claim_seat(candidate.id).await?),
            AccountKind::Dedicated => {
                let Some(claim) = candidate.claim() else {
                    return Ok(None);
                };
                if !self.inventory.commit_mutation(&claim).await? {
                    return Ok(None);
                }
                let mut account = candidate.clone();
                account.apply(&claim, Utc::now());
                Ok(Some(account))
            }
        }
    }

    /// Declared policy wins; otherwise any dedicated row makes the product dedicated.
    pub async fn resolve_kind(&self, product_id: ProductId) -> Result<AccountKind, AllocationError> {
        if let Some(kind) = self.policies.declared_kind(product_id).await? {
            return Ok(kind);
        }
        if self.inventory.has_dedicated(product_id).await? {
            Ok(AccountKind::Dedicated)
        } else {
            Ok(AccountKind::Shared)
        }
    }

    /// Undo a committed claim after the ledger refused it.
    async fn release(&self, account: &InventoryAccount) {
        let account_id = account.id;
        if account.kind == AccountKind::Shared {
            match self.inventory.release_seat(account_id).await {
                Ok(true) => info!(account_id, "seat released"),
                Ok(false) => error!(account_id, "nothing to release, account needs manual reconciliation"),
                Err(e) => error!(account_id, error = %e, "release failed, account needs manual reconciliation"),
            }
            return;
        }

        for _ in 0..RELEASE_ATTEMPTS {
            let current = match self.inventory.load(account_id).await {
                Ok(Some(account)) => account,
                Ok(None) => {
                    error!(account_id, "account vanished before release");
                    return;
                }
                Err(e) => {
                    error!(account_id, error = %e, "release failed, account needs manual reconciliation");
                    return;
                }
            };

            let Some(undo) = current.release() else {
                error!(account_id, "nothing to release, account needs manual reconciliation");
                return;
            };

            match self.inventory.commit_mutation(&undo).await {
                Ok(true) => {
                    info!(account_id, occupancy = undo.occupancy, state = %undo.state, "account released");
                    return;
                }
                Ok(false) => continue,
                Err(e) => {
                    error!(account_id, error = %e, "release failed, account needs manual reconciliation");
                    return;
                }
            }
        }
        error!(account_id, "release kept conflicting, account needs manual reconciliation");
    }
}
