//! CSV adapters used by the batch binary.

pub mod balance_io;
pub mod request_reader;
