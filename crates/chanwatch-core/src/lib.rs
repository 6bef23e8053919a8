//! Core domain + application logic for chanwatch.
//!
//! This crate is framework-agnostic. The messaging backend and the durable
//! store live behind ports (traits) implemented in adapter crates.

pub mod channel_list;
pub mod commands;
pub mod config;
pub mod crawler;
pub mod domain;
pub mod errors;
pub mod export;
pub mod filter;
pub mod gateway;
pub mod identity;
pub mod logging;
pub mod media;
pub mod monitor;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use errors::{Error, Result};
