//! Persistence port backing the dedup ledger and offset tracker.

pub mod memory;
pub mod port;

pub use memory::MemoryStore;
pub use port::{ClaimOutcome, Store};
