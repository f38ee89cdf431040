pub mod address;
pub mod audit;
pub mod context;
pub mod controller;
pub mod delivery;
pub mod domain;
pub mod envelope;
pub mod error;
pub mod haproxy;
pub mod listener;
pub mod logging;
pub mod status;
pub mod traits;

pub use delivery::{DeliveryAttempt, DeliveryContext, DeliveryStatus, QueueAdmission, QueueFull};
pub use domain::Domain;
pub use tracing;

#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
    Reload,
}
