//! Storage ports for the Waypoint progression engine.
//!
//! The catalog is read-only during evaluation; the ledger is the only
//! mutated shared resource. Ledger rows carry a version and saves are
//! compare-and-swap, so concurrent writers to the same `(user, entity)`
//! row never lose updates.

mod memory;
mod retry;
mod trait_;

pub use memory::MemoryStore;
pub use retry::{
    update_lesson_progress, update_mission_progress, update_module_progress,
    update_track_progress, MAX_SAVE_ATTEMPTS,
};
pub use trait_::{CatalogStore, ProgressLedger, Result, StorageError, Versioned};
