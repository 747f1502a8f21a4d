mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use inventory_service::notifier::Notifier;
use inventory_service::orders::{CompletedOrder, LineItem, OrderSource};
use inventory_service::{
    AllocationError, Allocator, AssignmentLedger, InMemoryStore, InventoryStore, OrderEventHandler, SecretBox,
    StoreError,
};
use shared::*;

/// Storefront orders; the first `outages` lookups fail like an unreachable database.
#[derive(Default)]
struct FakeOrders {
    orders: HashMap<OrderId, CompletedOrder>,
    outages: usize,
    fetches: AtomicUsize,
}

impl FakeOrders {
    fn with(mut self, order_id: OrderId, email: Option<&str>, items: &[(ProductId, i32)]) -> Self {
        self.orders.insert(
            order_id,
            CompletedOrder {
                order_id,
                billing_email: email.map(str::to_string),
                user_id: Some(77),
                user_email: None,
                items: items
                    .iter()
                    .map(|&(product_id, quantity)| LineItem { product_id, quantity })
                    .collect(),
            },
        );
        self
    }

    fn unreachable_for(mut self, outages: usize) -> Self {
        self.outages = outages;
        self
    }
}

#[async_trait]
impl OrderSource for FakeOrders {
    async fn fetch(&self, order_id: OrderId) -> Result<Option<CompletedOrder>, StoreError> {
        if self.fetches.fetch_add(1, Ordering::SeqCst) < self.outages {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(self.orders.get(&order_id).cloned())
    }
}

/// Records accepted notifications; refuses the first `refusals` calls.
#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<CustomerNotification>>,
    refusals: usize,
    calls: AtomicUsize,
}

impl RecordingNotifier {
    fn failing() -> Self {
        Self::refusing(usize::MAX)
    }

    fn refusing(refusals: usize) -> Self {
        Self { refusals, ..Default::default() }
    }

    fn sent(&self) -> Vec<CustomerNotification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_customer(&self, notification: &CustomerNotification) -> anyhow::Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.refusals {
            anyhow::bail!("mail relay down");
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

struct Fixture {
    store: Arc<InMemoryStore>,
    orders: Arc<FakeOrders>,
    notifier: Arc<RecordingNotifier>,
    handler: Arc<OrderEventHandler>,
}

fn fixture(store: Arc<InMemoryStore>, orders: FakeOrders, notifier: RecordingNotifier, secrets: SecretBox) -> Fixture {
    let orders = Arc::new(orders);
    let notifier = Arc::new(notifier);
    let backend = YieldingStore::wrap(&store);
    let allocator = Allocator::from_store(backend.clone());
    let handler = OrderEventHandler::new(allocator, backend.clone(), backend, orders.clone(), notifier.clone(), secrets)
        .with_retry_backoff(Duration::from_millis(1), Duration::from_millis(4));
    Fixture { store, orders, notifier, handler: Arc::new(handler) }
}

fn paid_event(order_id: OrderId) -> String {
    serde_json::json!({
        "order_id": order_id,
        "status": "completed",
        "occurred_at": "2026-01-05T10:00:00Z",
    })
    .to_string()
}

async fn seeded_store(secrets: &SecretBox) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store
        .insert(vec![
            new_shared(secrets, 5, 3, 0),
            new_dedicated(secrets, 6, "alpha"),
            new_dedicated(secrets, 6, "beta"),
        ])
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn paid_order_gets_one_account_per_unit_and_one_notification() {
    let secrets = secrets();
    let store = seeded_store(&secrets).await;
    let orders = FakeOrders::default().with(100, Some("buyer@example.com"), &[(5, 2), (6, 1)]);
    let f = fixture(store, orders, RecordingNotifier::default(), secrets);

    let report = f.handler.on_order_completed(100).await.unwrap();

    assert_eq!(report.allocated.len(), 3);
    assert!(report.failures.is_empty());
    assert_eq!((report.notified, report.unnotified), (3, 0));

    let sent = f.notifier.sent();
    assert_eq!(sent.len(), 1);
    let notification = &sent[0];
    assert_eq!(notification.order_id, 100);
    assert_eq!(notification.customer, CustomerIdentity::new("buyer@example.com").with_user_id(77));

    let mut secrets_sent: Vec<&str> = notification.items.iter().map(|i| i.secret.as_str()).collect();
    secrets_sent.sort_unstable();
    assert_eq!(secrets_sent, vec!["pw-alpha", "pw-shared-5", "pw-shared-5"]);

    let shared_row = f.store.find_candidate(5, AccountKind::Shared).await.unwrap().unwrap();
    assert_eq!((shared_row.occupancy, shared_row.state), (2, AccountState::InUse));
}

#[tokio::test]
async fn redelivered_event_changes_nothing() {
    let secrets = secrets();
    let store = seeded_store(&secrets).await;
    let orders = FakeOrders::default().with(100, Some("buyer@example.com"), &[(5, 2), (6, 1)]);
    let f = fixture(store, orders, RecordingNotifier::default(), secrets);

    f.handler.on_order_completed(100).await.unwrap();
    let before = f.store.active_for_order(100).await.unwrap();
    let counts_before = f.store.count_by_state().await.unwrap();

    let again = f.handler.on_order_completed(100).await.unwrap();

    assert!(again.allocated.is_empty());
    assert_eq!(again.already_satisfied, 3);
    assert_eq!(again.notified, 0);
    assert_eq!(f.store.active_for_order(100).await.unwrap(), before);
    assert_eq!(f.store.count_by_state().await.unwrap(), counts_before);
    assert_eq!(f.notifier.sent().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deliveries_allocate_each_unit_once() {
    let secrets = secrets();
    let store = seeded_store(&secrets).await;
    let orders = FakeOrders::default().with(100, Some("buyer@example.com"), &[(5, 2), (6, 1)]);
    let f = fixture(store, orders, RecordingNotifier::default(), secrets);

    let (a, b) = tokio::join!(
        tokio::spawn({
            let handler = f.handler.clone();
            async move { handler.on_order_completed(100).await }
        }),
        tokio::spawn({
            let handler = f.handler.clone();
            async move { handler.on_order_completed(100).await }
        }),
    );
    let (a, b) = (a.unwrap().unwrap(), b.unwrap().unwrap());

    assert_eq!(a.allocated.len() + b.allocated.len(), 3);
    assert!(a.failures.is_empty() && b.failures.is_empty());
    assert_eq!(f.store.active_for_order(100).await.unwrap().len(), 3);

    let counts = f.store.count_by_state().await.unwrap();
    assert_eq!(counts.in_use, 2);
    assert_eq!(counts.free, 1);
    let shared_row = f.store.load(1).await.unwrap().unwrap();
    assert_eq!(shared_row.occupancy, 2);
}

#[tokio::test]
async fn shortage_is_reported_per_unit_and_the_rest_is_kept() {
    let secrets = secrets();
    let store = seeded_store(&secrets).await;
    let orders = FakeOrders::default().with(200, Some("buyer@example.com"), &[(6, 3)]);
    let f = fixture(store, orders, RecordingNotifier::default(), secrets);

    let report = f.handler.on_order_completed(200).await.unwrap();

    assert_eq!(report.allocated.len(), 2);
    assert_eq!(report.failures.len(), 1);
    let failure = &report.failures[0];
    assert_eq!((failure.product_id, failure.unit), (6, 2));
    assert!(matches!(failure.error, AllocationError::NoCapacity { product_id: 6 }));
    assert_eq!(report.notified, 2);
    assert_eq!(f.notifier.sent()[0].items.len(), 2);
}

#[tokio::test]
async fn notification_failure_keeps_the_allocation() {
    let secrets = secrets();
    let store = seeded_store(&secrets).await;
    let orders = FakeOrders::default().with(300, Some("buyer@example.com"), &[(6, 1)]);
    let f = fixture(store, orders, RecordingNotifier::failing(), secrets);

    let report = f.handler.on_order_completed(300).await.unwrap();

    assert_eq!(report.allocated.len(), 1);
    assert!(report.notify_failed);
    assert_eq!((report.notified, report.unnotified), (0, 1));
    let held = f.store.active_for_order(300).await.unwrap();
    assert_eq!(held.len(), 1);
    assert!(held[0].notified_at.is_none());
}

#[tokio::test]
async fn redelivery_sends_details_that_never_reached_the_customer() {
    let secrets = secrets();
    let store = seeded_store(&secrets).await;
    let orders = FakeOrders::default().with(300, Some("buyer@example.com"), &[(6, 1)]);
    let f = fixture(store, orders, RecordingNotifier::refusing(1), secrets);

    let first = f.handler.on_order_completed(300).await.unwrap();
    assert!(first.notify_failed);

    let second = f.handler.on_order_completed(300).await.unwrap();
    assert!(second.allocated.is_empty());
    assert_eq!(second.already_satisfied, 1);
    assert_eq!((second.notified, second.unnotified), (1, 0));
    assert!(!second.notify_failed);

    let sent = f.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].items[0].secret, "pw-alpha");
    assert!(f.store.active_for_order(300).await.unwrap()[0].notified_at.is_some());

    let third = f.handler.on_order_completed(300).await.unwrap();
    assert_eq!(third.notified, 0);
    assert_eq!(f.notifier.sent().len(), 1);
}

#[tokio::test]
async fn event_is_retried_until_the_customer_is_notified() {
    let secrets = secrets();
    let store = seeded_store(&secrets).await;
    let orders = FakeOrders::default().with(310, Some("buyer@example.com"), &[(5, 1)]);
    let f = fixture(store, orders, RecordingNotifier::refusing(2), secrets);

    f.handler.process(&paid_event(310)).await;

    assert_eq!(f.notifier.calls.load(Ordering::SeqCst), 3);
    assert_eq!(f.notifier.sent().len(), 1);
    assert_eq!(f.store.active_for_order(310).await.unwrap().len(), 1);
}

#[tokio::test]
async fn event_is_retried_while_the_order_database_is_down() {
    let secrets = secrets();
    let store = seeded_store(&secrets).await;
    let orders = FakeOrders::default()
        .with(320, Some("buyer@example.com"), &[(6, 1)])
        .unreachable_for(2);
    let f = fixture(store, orders, RecordingNotifier::default(), secrets);

    f.handler.process(&paid_event(320)).await;

    assert_eq!(f.orders.fetches.load(Ordering::SeqCst), 3);
    assert_eq!(f.store.active_for_order(320).await.unwrap().len(), 1);
    assert_eq!(f.notifier.sent().len(), 1);
}

#[tokio::test]
async fn unpaid_and_malformed_events_are_skipped() {
    let secrets = secrets();
    let store = seeded_store(&secrets).await;
    let orders = FakeOrders::default().with(330, Some("buyer@example.com"), &[(6, 1)]);
    let f = fixture(store, orders, RecordingNotifier::default(), secrets);

    let pending = serde_json::json!({
        "order_id": 330,
        "status": "pending",
        "occurred_at": "2026-01-05T10:00:00Z",
    });
    f.handler.process(&pending.to_string()).await;
    f.handler.process("{not json").await;

    assert_eq!(f.orders.fetches.load(Ordering::SeqCst), 0);
    assert_eq!(f.store.count_active().await.unwrap(), 0);
}

#[tokio::test]
async fn unusable_orders_allocate_nothing() {
    let secrets = secrets();
    let store = seeded_store(&secrets).await;
    let orders = FakeOrders::default().with(400, None, &[(6, 1)]);
    let f = fixture(store, orders, RecordingNotifier::default(), secrets);

    let missing = f.handler.on_order_completed(999).await.unwrap();
    assert!(missing.allocated.is_empty() && missing.failures.is_empty());

    let anonymous = f.handler.on_order_completed(400).await.unwrap();
    assert!(anonymous.allocated.is_empty());

    assert_eq!(f.store.count_active().await.unwrap(), 0);
    assert!(f.notifier.sent().is_empty());
}

#[tokio::test]
async fn customer_view_shows_the_new_assignments() {
    let secrets = secrets();
    let store = seeded_store(&secrets).await;
    let orders = FakeOrders::default()
        .with(100, Some("buyer@example.com"), &[(6, 1)])
        .with(101, Some("other@example.com"), &[(5, 1)]);
    let f = fixture(store, orders, RecordingNotifier::default(), secrets);

    f.handler.on_order_completed(100).await.unwrap();
    f.handler.on_order_completed(101).await.unwrap();

    let views = f.store.active_for_customer("buyer@example.com").await.unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].account_email, "alpha@pool.example");
    assert_eq!(views[0].kind, AccountKind::Dedicated);
}
