//! Persistent execution history
//!
//! Remembers, per identity, which input fingerprint produced which
//! outputs. It survives restarts and lets a new process reuse a workspace
//! without recomputing it. History is an optimisation only: anything that
//! cannot be read is a miss.

pub mod record;
pub mod store;

pub use record::HistoryRecord;
pub use store::ExecutionHistoryStore;
