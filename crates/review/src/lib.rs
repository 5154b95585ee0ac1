//! Review and scoring coordination.
//!
//! Thin orchestration gluing AI-review output and mentor-review input
//! into mission attempts, plus the one-time side effects that fire
//! exactly once when an attempt first becomes approved.

mod ai;
mod coordinator;
mod hooks;

pub use ai::{
    fallback_outcome, AiReviewOutcome, AiReviewRequest, AiReviewer, CompetencySignal,
    ReviewArtifact, ReviewerError, StaticReviewer, DEFAULT_AI_SCORE,
};
pub use coordinator::{IngestedStatus, ReviewCoordinator, ReviewError, SubmissionRecord};
pub use hooks::{CompletionHooks, NoopCompletionHooks};
