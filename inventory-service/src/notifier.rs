use anyhow::Result;
use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use shared::CustomerNotification;
use std::time::Duration;

/// Delivers access details to the customer. At-least-once is enough; callers
/// do not retry.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_customer(&self, notification: &CustomerNotification) -> Result<()>;
}

/// Publishes notifications for the mail collaborator, keyed by customer e-mail.
pub struct KafkaNotifier {
    producer: FutureProducer,
    topic: String,
}

impl KafkaNotifier {
    pub fn new(producer: FutureProducer, topic: String) -> Self {
        Self { producer, topic }
    }
}

#[async_trait]
impl Notifier for KafkaNotifier {
    async fn notify_customer(&self, notification: &CustomerNotification) -> Result<()> {
        let json = serde_json::to_string(notification)?;
        let key = notification.customer.email.as_str();
        let record = FutureRecord::to(&self.topic)
            .payload(&json)
            .key(key);

        self.producer.send(record, Duration::from_secs(5)).await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to publish notification: {}", e))?;

        Ok(())
    }
}
