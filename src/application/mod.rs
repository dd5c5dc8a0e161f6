//! Application layer containing the core business logic orchestration.
//!
//! [`payments::PaymentService`] creates and resolves payments inside units of
//! work; [`relay::OutboxRelay`] delivers what those units of work committed to
//! the outbox.

pub mod payments;
pub mod relay;
