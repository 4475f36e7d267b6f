use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use mandi_api::{app, AppState};
use mandi_core::events::{EventPublisher, NoopPublisher};
use mandi_core::gateway::MockPaymentGateway;
use mandi_store::{DbClient, EventProducer, KafkaEventPublisher, PgInvoiceRepository, PgOrderRepository, PgPaymentRepository};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mandi_api=debug,mandi_order=info,mandi_finance=info,mandi_store=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = mandi_store::Config::load().context("Failed to load config")?;
    tracing::info!("Starting Mandi engine on port {}", config.server.port);

    let events: Arc<dyn EventPublisher> = if config.kafka.brokers.is_empty() {
        tracing::warn!("No Kafka brokers configured, status events are dropped");
        Arc::new(NoopPublisher)
    } else {
        let producer = EventProducer::new(&config.kafka.brokers).context("Failed to create Kafka producer")?;
        Arc::new(KafkaEventPublisher::spawn(producer))
    };

    // The deployment's real gateway adapter plugs in here.
    let gateway = Arc::new(MockPaymentGateway::new());

    let state = if config.database.url.is_empty() {
        tracing::warn!("No database configured, using in-memory repositories");
        AppState::in_memory(gateway, events, config.engine.clone())
    } else {
        let db = DbClient::new(&config.database.url, config.database.max_connections)
            .await
            .context("Failed to connect to Postgres")?;
        db.migrate().await.context("Failed to run migrations")?;
        AppState::new(
            Arc::new(PgOrderRepository::new(db.clone())),
            Arc::new(PgPaymentRepository::new(db.clone())),
            Arc::new(PgInvoiceRepository::new(db)),
            gateway,
            events,
            config.engine.clone(),
        )
    };

    if !config.kafka.brokers.is_empty() {
        let kafka = config.kafka.clone();
        let orchestrator = state.payments.clone();
        tokio::spawn(async move {
            if let Err(e) = mandi_store::start_gateway_worker(kafka, orchestrator).await {
                tracing::error!("Gateway worker stopped: {}", e);
            }
        });
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}
