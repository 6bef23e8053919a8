//! Session gateway port plus the outbound throttling decorator.

pub mod port;
pub mod throttled;
pub mod types;

pub use port::SessionGateway;
pub use types::*;
