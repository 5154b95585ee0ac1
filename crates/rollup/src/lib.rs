//! Rollup and aggregation of per-learner progress.
//!
//! Recomputes module- and track-level percentages and counters whenever a
//! lesson, mission or subtask completes, then re-derives tier completion
//! through the rule evaluator.

mod service;

pub use service::{RollupError, RollupService};
