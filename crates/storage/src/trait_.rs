//! Storage trait abstractions.

use async_trait::async_trait;
use waypoint_core::{
    ActivityEvent, Lesson, LessonId, Mission, MissionId, MissionProgress, MissionTier, Module,
    ModuleId, ModuleMission, ModuleMissionId, Track, TrackId, UserId, UserLessonProgress,
    UserModuleProgress, UserTrackProgress,
};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Item not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency violation on a versioned row
    #[error("version conflict on {key}")]
    Conflict {
        /// Row key the conflicting save targeted
        key: String,
    },

    /// Catalog validation failure at load time
    #[error(transparent)]
    Catalog(#[from] waypoint_core::CatalogError),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// A ledger row together with its optimistic-concurrency version.
///
/// Version 0 marks a row that has never been persisted; saving it inserts.
/// Saving any other version succeeds only if the stored version still
/// matches, and bumps it by one.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    /// Version the row was loaded at
    pub version: u64,

    /// Row contents
    pub record: T,
}

impl<T> Versioned<T> {
    /// Wrap a fresh, never-persisted record.
    pub fn new(record: T) -> Self {
        Self { version: 0, record }
    }
}

/// Read-only catalog access.
///
/// Listing methods return deterministic orderings (modules by order index
/// then id, missions by id) so requirement sets derived from them are
/// stable for identical catalog state.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Load a track by id.
    async fn track(&self, id: TrackId) -> Result<Option<Track>>;

    /// Load a module by id.
    async fn module(&self, id: ModuleId) -> Result<Option<Module>>;

    /// Load a lesson by id.
    async fn lesson(&self, id: LessonId) -> Result<Option<Lesson>>;

    /// Load a mission by id.
    async fn mission(&self, id: MissionId) -> Result<Option<Mission>>;

    /// Load a module-mission link by id.
    async fn link(&self, id: ModuleMissionId) -> Result<Option<ModuleMission>>;

    /// Modules belonging to a track, ordered by order index then id.
    async fn modules_for_track(&self, track: TrackId) -> Result<Vec<Module>>;

    /// Lessons belonging to a module, ordered by id.
    async fn lessons_for_module(&self, module: ModuleId) -> Result<Vec<Lesson>>;

    /// Module-mission links under a module, ordered by recommended order
    /// then id.
    async fn links_for_module(&self, module: ModuleId) -> Result<Vec<ModuleMission>>;

    /// Module-mission links under all modules of a track.
    async fn links_for_track(&self, track: TrackId) -> Result<Vec<ModuleMission>>;

    /// Module-mission links referencing a mission, across all modules.
    async fn links_for_mission(&self, mission: MissionId) -> Result<Vec<ModuleMission>>;

    /// Active missions of a tier, ordered by id.
    async fn missions_by_tier(&self, tier: MissionTier) -> Result<Vec<Mission>>;

    /// Tracks that reference a mission through module links.
    async fn tracks_for_mission(&self, mission: MissionId) -> Result<Vec<TrackId>>;
}

/// Per-learner progress ledger.
///
/// Rows are keyed `(user, entity)` and versioned; `save_*` methods are
/// compare-and-swap. Locking is per row, never global across users.
#[async_trait]
pub trait ProgressLedger: Send + Sync {
    /// Load a module progress row.
    async fn load_module_progress(
        &self,
        user: UserId,
        module: ModuleId,
    ) -> Result<Option<Versioned<UserModuleProgress>>>;

    /// Save a module progress row (compare-and-swap).
    async fn save_module_progress(
        &self,
        row: Versioned<UserModuleProgress>,
    ) -> Result<Versioned<UserModuleProgress>>;

    /// Load a lesson progress row.
    async fn load_lesson_progress(
        &self,
        user: UserId,
        lesson: LessonId,
    ) -> Result<Option<Versioned<UserLessonProgress>>>;

    /// Save a lesson progress row (compare-and-swap).
    async fn save_lesson_progress(
        &self,
        row: Versioned<UserLessonProgress>,
    ) -> Result<Versioned<UserLessonProgress>>;

    /// Load a mission attempt row.
    async fn load_attempt(
        &self,
        user: UserId,
        mission: MissionId,
    ) -> Result<Option<Versioned<MissionProgress>>>;

    /// Save a mission attempt row (compare-and-swap).
    async fn save_attempt(
        &self,
        row: Versioned<MissionProgress>,
    ) -> Result<Versioned<MissionProgress>>;

    /// All mission attempts for a learner.
    async fn list_attempts(&self, user: UserId) -> Result<Vec<MissionProgress>>;

    /// Load a track progress row.
    async fn load_track_progress(
        &self,
        user: UserId,
        track: TrackId,
    ) -> Result<Option<Versioned<UserTrackProgress>>>;

    /// Save a track progress row (compare-and-swap).
    async fn save_track_progress(
        &self,
        row: Versioned<UserTrackProgress>,
    ) -> Result<Versioned<UserTrackProgress>>;

    /// Append an activity event. Events are never read back by the
    /// engine; external consumers drain them.
    async fn append_event(&self, event: &ActivityEvent) -> Result<()>;
}
