use anyhow::{Context, Result};
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::Message;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use shared::*;
use crate::allocator::{AllocationRequest, Allocator, AssignmentPayload};
use crate::error::AllocationError;
use crate::models::Assignment;
use crate::notifier::Notifier;
use crate::orders::{LineItem, OrderSource};
use crate::secrets::SecretBox;
use crate::store::{AssignmentLedger, InventoryStore};

const RETRY_INITIAL: Duration = Duration::from_millis(500);
const RETRY_MAX: Duration = Duration::from_secs(30);

/// A unit that could not be allocated and needs manual fulfilment.
#[derive(Debug)]
pub struct UnitFailure {
    pub product_id: ProductId,
    pub unit: i32,
    pub error: AllocationError,
}

#[derive(Debug, Default)]
pub struct FulfillmentReport {
    pub order_id: OrderId,
    pub allocated: Vec<AssignmentPayload>,
    /// Units already covered by an earlier delivery of the same order.
    pub already_satisfied: usize,
    pub failures: Vec<UnitFailure>,
    /// Assignments whose access details reached the customer in this call.
    pub notified: usize,
    /// Active assignments of the order the customer has still not been told about.
    pub unnotified: usize,
    /// The notifier refused the batch; the event should be handled again.
    pub notify_failed: bool,
}

/// Units of an order still waiting for an account, numbered per product.
#[derive(Debug, Default, PartialEq, Eq)]
struct UnitPlan {
    pending: Vec<(ProductId, i32)>,
    satisfied: usize,
}

impl UnitPlan {
    fn build(order_id: OrderId, items: &[LineItem], held: &HashSet<(ProductId, i32)>) -> Self {
        let mut plan = UnitPlan::default();
        let mut next_unit: HashMap<ProductId, i32> = HashMap::new();

        for item in items {
            if item.product_id <= 0 {
                continue;
            }
            if item.quantity <= 0 {
                warn!(order_id, product_id = item.product_id, quantity = item.quantity, "skipping line item without quantity");
                continue;
            }
            let first = next_unit.get(&item.product_id).copied().unwrap_or(0);
            let Some(end) = first.checked_add(item.quantity) else {
                warn!(order_id, product_id = item.product_id, quantity = item.quantity, "skipping line item, unit count overflows");
                continue;
            };
            next_unit.insert(item.product_id, end);

            for unit in first..end {
                if held.contains(&(item.product_id, unit)) {
                    plan.satisfied += 1;
                } else {
                    plan.pending.push((item.product_id, unit));
                }
            }
        }
        plan
    }
}

#[derive(Debug, Default)]
struct Delivery {
    notified: usize,
    unnotified: usize,
    failed: bool,
}

pub struct OrderEventHandler {
    allocator: Allocator,
    inventory: Arc<dyn InventoryStore>,
    ledger: Arc<dyn AssignmentLedger>,
    orders: Arc<dyn OrderSource>,
    notifier: Arc<dyn Notifier>,
    secrets: SecretBox,
    retry_initial: Duration,
    retry_max: Duration,
}

impl OrderEventHandler {
    pub fn new(
        allocator: Allocator,
        inventory: Arc<dyn InventoryStore>,
        ledger: Arc<dyn AssignmentLedger>,
        orders: Arc<dyn OrderSource>,
        notifier: Arc<dyn Notifier>,
        secrets: SecretBox,
    ) -> Self {
        Self {
            allocator,
            inventory,
            ledger,
            orders,
            notifier,
            secrets,
            retry_initial: RETRY_INITIAL,
            retry_max: RETRY_MAX,
        }
    }

    /// Delay before the first retry of a failed event, doubling up to `max`.
    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial = initial;
        self.retry_max = max.max(initial);
        self
    }

    pub async fn run(&self, consumer: StreamConsumer) {
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            match message {
                Ok(m) => {
                    match m.payload_view::<str>() {
                        Some(Ok(json_str)) => self.process(json_str).await,
                        Some(Err(e)) => error!("Error parsing payload: {}", e),
                        None => {}
                    }

                    // Only reached once the event is handled, so the offset never
                    // skips an unhandled order.
                    if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                        error!("Error committing message: {}", e);
                    }
                }
                Err(e) => error!("Error receiving message: {}", e),
            }
        }
    }

    /// Handle one raw order event. Failures are retried in place with capped
    /// exponential backoff until they succeed, holding back the partition
    /// meanwhile. Malformed payloads are dropped.
    pub async fn process(&self, payload: &str) {
        let event = match serde_json::from_str::<OrderStatusChanged>(payload) {
            Ok(event) => event,
            Err(e) => {
                error!("Dropping malformed order event: {}", e);
                return;
            }
        };

        let mut delay = self.retry_initial;
        let mut attempt = 1u32;
        loop {
            match self.handle_event(&event).await {
                Ok(()) => return,
                Err(e) => {
                    error!(
                        order_id = event.order_id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "Error handling order event: {:#}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.retry_max);
                    attempt += 1;
                }
            }
        }
    }

    async fn handle_event(&self, event: &OrderStatusChanged) -> Result<()> {
        if !event.is_fulfillable() {
            info!(order_id = event.order_id, status = %event.status, "order not paid yet, ignoring");
            return Ok(());
        }
        let report = self.on_order_completed(event.order_id).await?;
        info!(
            order_id = report.order_id,
            allocated = report.allocated.len(),
            already_satisfied = report.already_satisfied,
            failed = report.failures.len(),
            notified = report.notified,
            unnotified = report.unnotified,
            "order fulfilment finished"
        );
        if report.notify_failed {
            anyhow::bail!("customer of order {} not notified", report.order_id);
        }
        Ok(())
    }

    /// Allocate every purchased unit of the order that holds no account yet,
    /// one independent allocation per unit, then send the customer the access
    /// details of every active assignment of the order they have not received.
    ///
    /// Safe to call repeatedly: units already holding an active assignment are
    /// skipped, the ledger refuses a unit that a concurrent delivery won, and
    /// assignments are stamped once their notification is accepted.
    pub async fn on_order_completed(&self, order_id: OrderId) -> Result<FulfillmentReport> {
        let mut report = FulfillmentReport { order_id, ..Default::default() };

        let Some(order) = self.orders.fetch(order_id).await? else {
            warn!(order_id, "order not found, nothing to allocate");
            return Ok(report);
        };
        let Some(customer) = order.customer() else {
            warn!(order_id, "order has no customer e-mail, nothing to allocate");
            return Ok(report);
        };

        let held: HashSet<(ProductId, i32)> = self
            .ledger
            .active_for_order(order_id)
            .await?
            .into_iter()
            .filter_map(|a| a.unit.map(|unit| (a.product_id, unit)))
            .collect();

        let plan = UnitPlan::build(order_id, &order.items, &held);
        report.already_satisfied = plan.satisfied;

        for (product_id, unit) in plan.pending {
            let request = AllocationRequest::new(product_id, customer.clone(), order_id).for_unit(unit);
            match self.allocator.allocate(&request).await {
                Ok(payload) => report.allocated.push(payload),
                Err(AllocationError::AlreadyAllocated { .. }) => {
                    info!(order_id, product_id, unit, "unit allocated by a concurrent delivery");
                    report.already_satisfied += 1;
                }
                Err(e) => {
                    error!(order_id, product_id, unit, error = %e, "allocation failed, needs manual fulfilment");
                    report.failures.push(UnitFailure { product_id, unit, error: e });
                }
            }
        }

        let delivery = self.deliver(order_id, &customer).await?;
        report.notified = delivery.notified;
        report.unnotified = delivery.unnotified;
        report.notify_failed = delivery.failed;
        Ok(report)
    }

    async fn deliver(&self, order_id: OrderId, customer: &CustomerIdentity) -> Result<Delivery> {
        let waiting: Vec<Assignment> = self
            .ledger
            .active_for_order(order_id)
            .await?
            .into_iter()
            .filter(|a| a.notified_at.is_none())
            .collect();
        if waiting.is_empty() {
            return Ok(Delivery::default());
        }

        let mut items = Vec::with_capacity(waiting.len());
        let mut ids = Vec::with_capacity(waiting.len());
        for assignment in &waiting {
            match self.access_details(assignment).await {
                Ok(details) => {
                    items.push(details);
                    ids.push(assignment.id);
                }
                Err(e) => error!(
                    order_id,
                    assignment_id = assignment.id,
                    account_id = assignment.account_id,
                    "cannot prepare access details, customer needs manual follow-up: {:#}",
                    e
                ),
            }
        }
        let mut delivery = Delivery { unnotified: waiting.len(), ..Default::default() };
        if items.is_empty() {
            return Ok(delivery);
        }

        let notification = CustomerNotification::new(order_id, customer.clone(), items);
        if let Err(e) = self.notifier.notify_customer(&notification).await {
            error!(order_id, error = %e, "customer notification failed, allocation kept");
            delivery.failed = true;
            return Ok(delivery);
        }

        self.ledger
            .mark_notified(&ids, notification.created_at)
            .await
            .context("notification sent but not recorded")?;
        delivery.notified = ids.len();
        delivery.unnotified -= ids.len();
        Ok(delivery)
    }

    async fn access_details(&self, assignment: &Assignment) -> Result<AccessDetails> {
        let account = self
            .inventory
            .load(assignment.account_id)
            .await?
            .with_context(|| format!("account {} not found", assignment.account_id))?;
        let secret = self.secrets.open(&account.sealed_secret)?;

        Ok(AccessDetails {
            product_id: assignment.product_id,
            account_id: account.id,
            kind: account.kind,
            account_email: account.account_email,
            secret,
        })
    }
}
