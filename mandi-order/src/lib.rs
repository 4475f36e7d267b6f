pub mod changes;
pub mod fulfillment;
pub mod manager;
pub mod models;
pub mod repository;

pub use changes::ChangeHandler;
pub use fulfillment::FulfillmentUpdate;
pub use manager::{OrderManager, OrderUnitOfWork};
pub use models::{CreateOrder, NewOrderItem, Order, OrderError, OrderItem, PaymentApplication};
pub use repository::{InMemoryOrderRepository, OrderRepository};
