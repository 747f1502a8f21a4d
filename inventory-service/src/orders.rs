//! Lookup of completed orders in the storefront's tables.

use async_trait::async_trait;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use shared::*;

use crate::error::StoreError;
use crate::schema::*;
use crate::store::DbPool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineItem {
    pub product_id: ProductId,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedOrder {
    pub order_id: OrderId,
    pub billing_email: Option<String>,
    pub user_id: Option<i64>,
    pub user_email: Option<String>,
    pub items: Vec<LineItem>,
}

impl CompletedOrder {
    /// Billing e-mail first, then the e-mail of the ordering user.
    pub fn customer(&self) -> Option<CustomerIdentity> {
        let email = [&self.billing_email, &self.user_email]
            .into_iter()
            .flatten()
            .map(|e| e.trim())
            .find(|e| !e.is_empty())?;

        Some(CustomerIdentity {
            email: email.to_string(),
            user_id: self.user_id,
        })
    }
}

#[async_trait]
pub trait OrderSource: Send + Sync {
    async fn fetch(&self, order_id: OrderId) -> Result<Option<CompletedOrder>, StoreError>;
}

pub struct PgOrderSource {
    pool: DbPool,
}

impl PgOrderSource {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderSource for PgOrderSource {
    async fn fetch(&self, order_id: OrderId) -> Result<Option<CompletedOrder>, StoreError> {
        let mut conn = self.pool.get().await?;

        let order = commerce_orders::table
            .filter(commerce_orders::id.eq(order_id))
            .select((
                commerce_orders::billing_email,
                commerce_orders::user_id,
                commerce_orders::user_email,
            ))
            .first::<(Option<String>, Option<i64>, Option<String>)>(&mut conn)
            .await
            .optional()?;

        let Some((billing_email, user_id, user_email)) = order else {
            return Ok(None);
        };

        let items = commerce_order_items::table
            .filter(commerce_order_items::order_id.eq(order_id))
            .order(commerce_order_items::id.asc())
            .select((commerce_order_items::product_id, commerce_order_items::quantity))
            .load::<(i64, i32)>(&mut conn)
            .await?
            .into_iter()
            .map(|(product_id, quantity)| LineItem { product_id, quantity })
            .collect();

        Ok(Some(CompletedOrder {
            order_id,
            billing_email,
            user_id,
            user_email,
            items,
        }))
    }
}
