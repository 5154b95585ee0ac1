//! Waypoint core data models.
//!
//! This crate defines the catalog definitions (tracks, modules, lessons,
//! missions) and the per-learner progress ledger records that the
//! progression engine reads and writes.

#![warn(missing_docs)]

// Core identities
mod id;

// Catalog definitions
mod catalog;

// Per-learner progress ledger
mod ledger;

// Activity timeline
mod event;

// Re-exports
pub use id::*;

// Catalog
pub use catalog::{
    CatalogError, Choice, Consequence, DecisionPoint, Lesson, LessonKind, Mission, MissionTier,
    Module, ModuleMission, ProgramKey, ProgressionMode, SubtaskDef, Tier, Track,
    TrackRequirements,
};

// Ledger
pub use ledger::{
    AiFeedback, AttemptStatus, DecisionRecord, FinalStatus, MentorReview, MissionProgress,
    ProgressStatus, ReviewDecision, SubtaskRecord, TierGate, UserLessonProgress,
    UserModuleProgress, UserTrackProgress, QUIZ_PASS_SCORE,
};

// Events
pub use event::{ActivityEvent, ActivityKind};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
