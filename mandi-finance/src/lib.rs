pub mod invoice;
pub mod models;
pub mod orchestrator;
pub mod payment;
pub mod refund;
pub mod repository;

pub use invoice::{InvoiceError, InvoiceGenerator};
pub use models::{
    CapturePaymentRequest, FeeSchedule, GatewayEvent, Invoice, InvoiceSource, Payment, PaymentFees, PaymentRefund,
    RefundRequestInput, SubscriptionCharge, TaxContext,
};
pub use orchestrator::{FinanceSettings, PaymentOrchestrator};
pub use payment::{EventOutcome, PaymentError};
pub use refund::RefundError;
pub use repository::{InMemoryInvoiceRepository, InMemoryPaymentRepository, InvoiceRepository, PaymentRepository};
