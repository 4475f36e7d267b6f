use mandi_core::events::EventPublisher;
use mandi_shared::DomainEvent;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct EventProducer {
    producer: FutureProducer,
}

impl EventProducer {
    pub fn new(brokers: &str) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("enable.idempotence", "true")
            .create()?;

        Ok(Self { producer })
    }

    pub async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<(), rdkafka::error::KafkaError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        match self.producer.send(record, Timeout::After(Duration::from_secs(0))).await {
            Ok(delivery) => {
                debug!(
                    "Sent message to {}/{}: partition {} offset {}",
                    topic, key, delivery.partition, delivery.offset
                );
                Ok(())
            }
            Err((e, _msg)) => {
                error!("Failed to send message to {}: {}", topic, e);
                Err(e)
            }
        }
    }
}

/// Hands events to a background task that forwards them to Kafka, so a
/// slow broker never holds up a committed unit of work. Delivery is best
/// effort: failures are logged and the event is dropped.
pub struct KafkaEventPublisher {
    sender: mpsc::UnboundedSender<DomainEvent>,
}

impl KafkaEventPublisher {
    /// Must be called inside a tokio runtime.
    pub fn spawn(producer: EventProducer) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(drain(producer, receiver));
        Self { sender }
    }
}

async fn drain(producer: EventProducer, mut receiver: mpsc::UnboundedReceiver<DomainEvent>) {
    info!("Event publisher started");
    while let Some(event) = receiver.recv().await {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Could not serialize {} event: {}", event.name(), e);
                continue;
            }
        };
        if let Err(e) = producer.publish(event.topic(), &event.key(), &payload).await {
            warn!("Dropped {} event for {}: {}", event.name(), event.key(), e);
        }
    }
    info!("Event publisher stopped");
}

impl EventPublisher for KafkaEventPublisher {
    fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.sender.send(event) {
            warn!("Event queue closed, dropping {} event", e.0.name());
        }
    }
}
