use std::sync::Arc;

use mandi_core::CoreError;
use mandi_finance::{GatewayEvent, PaymentOrchestrator};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::app_config::KafkaConfig;

const MAX_ATTEMPTS: u32 = 5;

/// Consumes gateway status reports and feeds them to the orchestrator.
/// Offsets are committed only after an event was handled, so a crash
/// replays it; the orchestrator treats replays as duplicates. Transient
/// failures are retried in place before moving on.
pub async fn start_gateway_worker(config: KafkaConfig, orchestrator: Arc<PaymentOrchestrator>) -> Result<(), KafkaError> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .set("group.id", &config.group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .create()?;

    consumer.subscribe(&[config.gateway_topic.as_str()])?;
    info!("Gateway worker listening on {}", config.gateway_topic);

    loop {
        let message = match consumer.recv().await {
            Ok(m) => m,
            Err(e) => {
                error!("Kafka error: {}", e);
                continue;
            }
        };

        match message.payload_view::<str>() {
            Some(Ok(payload)) => {
                let mut attempt = 0;
                while handle_payload(&orchestrator, payload).await {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        error!("Giving up on gateway event after {} attempts: {}", attempt, payload);
                        break;
                    }
                    sleep(Duration::from_millis(200 * u64::from(attempt))).await;
                }
            }
            Some(Err(e)) => error!("Gateway event is not UTF-8: {}", e),
            None => warn!("Gateway event without payload"),
        }
        if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
            warn!("Failed to commit gateway event offset: {}", e);
        }
    }
}

/// Returns true when the event should be redelivered.
async fn handle_payload(orchestrator: &PaymentOrchestrator, payload: &str) -> bool {
    let event: GatewayEvent = match serde_json::from_str(payload) {
        Ok(event) => event,
        Err(e) => {
            error!("Discarding malformed gateway event: {}", e);
            return false;
        }
    };

    match orchestrator.handle_gateway_event(event).await {
        Ok(payment) => {
            info!("Gateway event applied, payment {} is {}", payment.payment_reference, payment.status);
            false
        }
        Err(CoreError::Validation(e)) => {
            warn!("Rejected gateway event: {}", e);
            false
        }
        Err(e @ CoreError::NotFound { .. }) => {
            warn!("Gateway event for unknown payment: {}", e);
            false
        }
        Err(e) => {
            error!("Gateway event failed, will retry: {}", e);
            true
        }
    }
}
