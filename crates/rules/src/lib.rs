//! Completion rule evaluation for track tiers.
//!
//! Pure given a consistent snapshot of catalog and ledger, with one side
//! effect: persisting a newly-met tier's flag and unlocking the next
//! tier. Negative results are itemized, not exceptional.

mod evaluator;

pub use evaluator::{RulesError, TierEvaluation, TierEvaluator, RUBRIC_PASS_SCORE};
