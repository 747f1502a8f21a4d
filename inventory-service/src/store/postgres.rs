use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::dsl::{count_star, exists, sql};
use diesel::sql_types::Text;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use shared::*;

use super::{AssignmentLedger, InventoryStore, PolicyDirectory, CUSTOMER_VIEW_LIMIT};
use crate::error::StoreError;
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

const FREE: &str = "free";
const IN_USE: &str = "in_use";
const ACTIVE: &str = "active";
const SHARED: &str = "shared";

// Right-hand sides of an UPDATE see the row before the write.
const STATE_AFTER_CLAIM: &str = "CASE WHEN occupancy + 1 >= capacity THEN 'closed' ELSE 'in_use' END";
const STATE_AFTER_RELEASE: &str = "CASE WHEN occupancy - 1 = 0 THEN 'free' ELSE 'in_use' END";

/// Postgres-backed inventory, ledger and policy directory.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn views(rows: Vec<(AssignmentRow, (String, String))>) -> Result<Vec<AssignmentView>, StoreError> {
        rows.into_iter()
            .map(|(row, (account_email, kind))| {
                let assignment = Assignment::try_from(row)?;
                let kind = kind
                    .parse()
                    .map_err(|e| StoreError::Corrupt(format!("account {}: {}", assignment.account_id, e)))?;
                Ok(AssignmentView {
                    assignment_id: assignment.id,
                    customer_email: assignment.customer.email,
                    order_id: assignment.order_id,
                    product_id: assignment.product_id,
                    account_id: assignment.account_id,
                    account_email,
                    kind,
                    status: assignment.status,
                    started_at: assignment.started_at,
                })
            })
            .collect()
    }
}

#[async_trait]
impl InventoryStore for PgStore {
    async fn has_dedicated(&self, product_id: ProductId) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;

        let found = diesel::select(exists(
            inventory_accounts::table
                .filter(inventory_accounts::product_id.eq(product_id))
                .filter(inventory_accounts::kind.eq(AccountKind::Dedicated.as_str())),
        ))
        .get_result::<bool>(&mut conn)
        .await?;

        Ok(found)
    }

    async fn find_candidate(
        &self,
        product_id: ProductId,
        kind: AccountKind,
    ) -> Result<Option<InventoryAccount>, StoreError> {
        let mut conn = self.pool.get().await?;

        let rows = inventory_accounts::table
            .filter(inventory_accounts::product_id.eq(product_id))
            .filter(inventory_accounts::kind.eq(kind.as_str()));

        let row = match kind {
            AccountKind::Dedicated => {
                rows.filter(inventory_accounts::state.eq(FREE))
                    .order(inventory_accounts::id.asc())
                    .first::<AccountRow>(&mut conn)
                    .await
                    .optional()?
            }
            AccountKind::Shared => {
                rows.filter(inventory_accounts::occupancy.lt(inventory_accounts::capacity))
                    .filter(inventory_accounts::state.eq_any(vec![FREE, IN_USE]))
                    .order((inventory_accounts::occupancy.desc(), inventory_accounts::id.asc()))
                    .first::<AccountRow>(&mut conn)
                    .await
                    .optional()?
            }
        };

        row.map(InventoryAccount::try_from).transpose()
    }

    async fn commit_mutation(&self, mutation: &AccountMutation) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;

        let updated = diesel::update(
            inventory_accounts::table
                .filter(inventory_accounts::id.eq(mutation.account_id))
                .filter(inventory_accounts::version.eq(mutation.expected_version)),
        )
        .set((
            inventory_accounts::occupancy.eq(mutation.occupancy),
            inventory_accounts::state.eq(mutation.state.as_str()),
            inventory_accounts::version.eq(inventory_accounts::version + 1),
            inventory_accounts::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await?;

        Ok(updated == 1)
    }

    async fn claim_seat(&self, account_id: AccountId) -> Result<Option<InventoryAccount>, StoreError> {
        let mut conn = self.pool.get().await?;

        let row = diesel::update(
            inventory_accounts::table
                .filter(inventory_accounts::id.eq(account_id))
                .filter(inventory_accounts::kind.eq(SHARED))
                .filter(inventory_accounts::occupancy.lt(inventory_accounts::capacity))
                .filter(inventory_accounts::state.eq_any(vec![FREE, IN_USE])),
        )
        .set((
            inventory_accounts::occupancy.eq(inventory_accounts::occupancy + 1),
            inventory_accounts::state.eq(sql::<Text>(STATE_AFTER_CLAIM)),
            inventory_accounts::version.eq(inventory_accounts::version + 1),
            inventory_accounts::updated_at.eq(Utc::now()),
        ))
        .get_result::<AccountRow>(&mut conn)
        .await
        .optional()?;

        row.map(InventoryAccount::try_from).transpose()
    }

    async fn release_seat(&self, account_id: AccountId) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;

        let updated = diesel::update(
            inventory_accounts::table
                .filter(inventory_accounts::id.eq(account_id))
                .filter(inventory_accounts::kind.eq(SHARED))
                .filter(inventory_accounts::occupancy.gt(0)),
        )
        .set((
            inventory_accounts::occupancy.eq(inventory_accounts::occupancy - 1),
            inventory_accounts::state.eq(sql::<Text>(STATE_AFTER_RELEASE)),
            inventory_accounts::version.eq(inventory_accounts::version + 1),
            inventory_accounts::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await?;

        Ok(updated == 1)
    }

    async fn load(&self, account_id: AccountId) -> Result<Option<InventoryAccount>, StoreError> {
        let mut conn = self.pool.get().await?;

        let row = inventory_accounts::table
            .filter(inventory_accounts::id.eq(account_id))
            .first::<AccountRow>(&mut conn)
            .await
            .optional()?;

        row.map(InventoryAccount::try_from).transpose()
    }

    async fn insert(&self, accounts: Vec<NewInventoryAccount>) -> Result<Vec<InventoryAccount>, StoreError> {
        if accounts.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.get().await?;

        let rows: Vec<NewAccountRow> = accounts.into_iter().map(NewAccountRow::from).collect();
        let inserted = diesel::insert_into(inventory_accounts::table)
            .values(&rows)
            .get_results::<AccountRow>(&mut conn)
            .await?;

        inserted.into_iter().map(InventoryAccount::try_from).collect()
    }

    async fn count_by_state(&self) -> Result<StateCounts, StoreError> {
        let mut conn = self.pool.get().await?;

        let grouped = inventory_accounts::table
            .group_by(inventory_accounts::state)
            .select((inventory_accounts::state, count_star()))
            .load::<(String, i64)>(&mut conn)
            .await?;

        let mut counts = StateCounts::default();
        for (state, count) in grouped {
            let state = state
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("{}", e)))?;
            counts.add(state, count);
        }
        Ok(counts)
    }
}

#[async_trait]
impl AssignmentLedger for PgStore {
    async fn append(&self, assignment: NewAssignment) -> Result<Assignment, StoreError> {
        let mut conn = self.pool.get().await?;
        let (order_id, product_id, unit) = (assignment.order_id, assignment.product_id, assignment.unit);

        let row = diesel::insert_into(assignments::table)
            .values(&NewAssignmentRow::from(assignment))
            .get_result::<AssignmentRow>(&mut conn)
            .await
            .map_err(|e| StoreError::from_insert(e, order_id, product_id, unit))?;

        Assignment::try_from(row)
    }

    async fn active_for_order(&self, order_id: OrderId) -> Result<Vec<Assignment>, StoreError> {
        let mut conn = self.pool.get().await?;

        let rows = assignments::table
            .filter(assignments::order_id.eq(order_id))
            .filter(assignments::status.eq(ACTIVE))
            .order(assignments::id.asc())
            .load::<AssignmentRow>(&mut conn)
            .await?;

        rows.into_iter().map(Assignment::try_from).collect()
    }

    async fn mark_notified(&self, ids: &[AssignmentId], at: DateTime<Utc>) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().await?;

        diesel::update(assignments::table.filter(assignments::id.eq_any(ids)))
            .set(assignments::notified_at.eq(Some(at)))
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    async fn active_for_customer(&self, email: &str) -> Result<Vec<AssignmentView>, StoreError> {
        let mut conn = self.pool.get().await?;

        let rows = assignments::table
            .inner_join(inventory_accounts::table)
            .filter(assignments::customer_email.eq(email))
            .filter(assignments::status.eq(ACTIVE))
            .order(assignments::id.desc())
            .limit(CUSTOMER_VIEW_LIMIT)
            .select((
                assignments::all_columns,
                (inventory_accounts::account_email, inventory_accounts::kind),
            ))
            .load::<(AssignmentRow, (String, String))>(&mut conn)
            .await?;

        Self::views(rows)
    }

    async fn recent(&self, limit: i64) -> Result<Vec<AssignmentView>, StoreError> {
        let mut conn = self.pool.get().await?;

        let rows = assignments::table
            .inner_join(inventory_accounts::table)
            .order(assignments::id.desc())
            .limit(limit)
            .select((
                assignments::all_columns,
                (inventory_accounts::account_email, inventory_accounts::kind),
            ))
            .load::<(AssignmentRow, (String, String))>(&mut conn)
            .await?;

        Self::views(rows)
    }

    async fn count_active(&self) -> Result<i64, StoreError> {
        let mut conn = self.pool.get().await?;

        let count = assignments::table
            .filter(assignments::status.eq(ACTIVE))
            .count()
            .get_result::<i64>(&mut conn)
            .await?;

        Ok(count)
    }
}

#[async_trait]
impl PolicyDirectory for PgStore {
    async fn declared_kind(&self, product_id: ProductId) -> Result<Option<AccountKind>, StoreError> {
        let mut conn = self.pool.get().await?;

        let kind = product_policies::table
            .filter(product_policies::product_id.eq(product_id))
            .select(product_policies::kind)
            .first::<String>(&mut conn)
            .await
            .optional()?;

        kind.map(|k| {
            k.parse()
                .map_err(|e| StoreError::Corrupt(format!("policy for product {}: {}", product_id, e)))
        })
        .transpose()
    }
}
