//! Core forwarding/delivery pipeline for the channel relay.
//!
//! This crate is intentionally framework-agnostic. Telegram (and any other
//! transport) lives behind ports (traits) implemented in adapter crates; the
//! persistence backing the ledger and offsets sits behind the [`store::Store`]
//! port with an in-memory reference implementation.

pub mod config;
pub mod domain;
pub mod errors;
pub mod executor;
pub mod filter;
pub mod journal;
pub mod ledger;
pub mod logging;
pub mod notify;
pub mod offsets;
pub mod pipeline;
pub mod ports;
pub mod store;
pub mod window;

pub use errors::{DeliveryError, Error, ErrorCategory, Result};
