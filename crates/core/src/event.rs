//! Activity events - append-only records emitted for external consumers.

use serde::{Deserialize, Serialize};

use crate::id::{EventId, LessonId, MissionId, ModuleId, TrackId, UserId};
use crate::Time;

/// What kind of activity happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityKind {
    /// A lesson reached completion
    LessonCompleted,
    /// A mission attempt was approved
    MissionCompleted,
    /// A reflection was submitted with mission work
    ReflectionSubmitted,
    /// A tier's completion requirements were met
    TierCompleted,
}

impl ActivityKind {
    /// Points awarded for this activity.
    pub fn points(&self) -> u32 {
        match self {
            ActivityKind::LessonCompleted => 10,
            ActivityKind::MissionCompleted => 25,
            ActivityKind::ReflectionSubmitted => 5,
            ActivityKind::TierCompleted => 100,
        }
    }
}

/// An activity record consumed by notifications and analytics.
///
/// Events are append-only and never read back by the progression engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Unique identifier
    pub id: EventId,

    /// Learner the activity belongs to
    pub user: UserId,

    /// Activity type
    pub kind: ActivityKind,

    /// Related track, when applicable
    pub track: Option<TrackId>,

    /// Related module, when applicable
    pub module: Option<ModuleId>,

    /// Related lesson, when applicable
    pub lesson: Option<LessonId>,

    /// Related mission, when applicable
    pub mission: Option<MissionId>,

    /// Points awarded
    pub points_awarded: u32,

    /// Free-form context for consumers
    pub metadata: serde_json::Value,

    /// When the activity happened
    pub occurred_at: Time,
}

impl ActivityEvent {
    /// Create a new event with the kind's default points.
    pub fn new(user: UserId, kind: ActivityKind) -> Self {
        Self {
            id: EventId::new(),
            user,
            kind,
            track: None,
            module: None,
            lesson: None,
            mission: None,
            points_awarded: kind.points(),
            metadata: serde_json::Value::Null,
            occurred_at: chrono::Utc::now(),
        }
    }

    /// Attach a track reference.
    pub fn with_track(mut self, track: TrackId) -> Self {
        self.track = Some(track);
        self
    }

    /// Attach a module reference.
    pub fn with_module(mut self, module: ModuleId) -> Self {
        self.module = Some(module);
        self
    }

    /// Attach a lesson reference.
    pub fn with_lesson(mut self, lesson: LessonId) -> Self {
        self.lesson = Some(lesson);
        self
    }

    /// Attach a mission reference.
    pub fn with_mission(mut self, mission: MissionId) -> Self {
        self.mission = Some(mission);
        self
    }
}
