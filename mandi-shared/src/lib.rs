pub mod events;
pub mod pii;

pub use events::DomainEvent;
pub use pii::Masked;
