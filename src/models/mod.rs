//! Built-in model implementations.

pub mod gateway;
pub mod mock;
