//! Supporting utilities shared across the crate.

pub mod timeout;
