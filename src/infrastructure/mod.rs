//! Adapters for the domain ports.

pub mod in_memory;
pub mod metrics;
#[cfg(feature = "storage-postgres")]
pub mod postgres;
#[cfg(feature = "broker-rabbitmq")]
pub mod rabbitmq;
