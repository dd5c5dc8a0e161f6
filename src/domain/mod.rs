//! Domain types and the ports the payment core is written against.

pub mod balance;
pub mod event;
pub mod payment;
pub mod ports;
