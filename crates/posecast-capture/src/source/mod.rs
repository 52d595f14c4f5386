//! Frame source implementations.

pub mod channel;
pub mod synthetic;
