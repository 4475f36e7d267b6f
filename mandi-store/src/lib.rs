pub mod app_config;
pub mod database;
pub mod events;
pub mod invoice_repo;
pub mod order_repo;
pub mod payment_repo;
pub mod worker;

pub use app_config::Config;
pub use database::DbClient;
pub use events::{EventProducer, KafkaEventPublisher};
pub use invoice_repo::PgInvoiceRepository;
pub use order_repo::PgOrderRepository;
pub use payment_repo::PgPaymentRepository;
pub use worker::start_gateway_worker;
