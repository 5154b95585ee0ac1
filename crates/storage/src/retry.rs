//! Bounded-retry update helpers for versioned ledger rows.
//!
//! Each helper loads a row (initializing a fresh one on first touch),
//! applies the caller's mutation, and saves with compare-and-swap. A
//! conflicting save reloads and retries; after [`MAX_SAVE_ATTEMPTS`] the
//! conflict surfaces to the caller as a transient failure.

use waypoint_core::{
    LessonId, MissionId, MissionProgress, ModuleId, TrackId, UserId, UserLessonProgress,
    UserModuleProgress, UserTrackProgress,
};

use crate::trait_::{ProgressLedger, Result, StorageError, Versioned};

/// Retries before a version conflict is surfaced.
pub const MAX_SAVE_ATTEMPTS: usize = 5;

/// Atomically update a learner's track progress row.
pub async fn update_track_progress<F>(
    ledger: &dyn ProgressLedger,
    user: UserId,
    track: TrackId,
    mut mutate: F,
) -> Result<Versioned<UserTrackProgress>>
where
    F: FnMut(&mut UserTrackProgress) + Send,
{
    for _ in 0..MAX_SAVE_ATTEMPTS {
        let mut row = match ledger.load_track_progress(user, track).await? {
            Some(row) => row,
            None => Versioned::new(UserTrackProgress::new(user, track)),
        };
        mutate(&mut row.record);
        row.record.updated_at = chrono::Utc::now();

        match ledger.save_track_progress(row).await {
            Ok(saved) => return Ok(saved),
            Err(StorageError::Conflict { .. }) => continue,
            Err(e) => return Err(e),
        }
    }

    Err(StorageError::Conflict {
        key: format!("track-progress/{}/{}", user, track),
    })
}

/// Atomically update a learner's module progress row.
pub async fn update_module_progress<F>(
    ledger: &dyn ProgressLedger,
    user: UserId,
    module: ModuleId,
    mut mutate: F,
) -> Result<Versioned<UserModuleProgress>>
where
    F: FnMut(&mut UserModuleProgress) + Send,
{
    for _ in 0..MAX_SAVE_ATTEMPTS {
        let mut row = match ledger.load_module_progress(user, module).await? {
            Some(row) => row,
            None => Versioned::new(UserModuleProgress::new(user, module)),
        };
        mutate(&mut row.record);
        row.record.updated_at = chrono::Utc::now();

        match ledger.save_module_progress(row).await {
            Ok(saved) => return Ok(saved),
            Err(StorageError::Conflict { .. }) => continue,
            Err(e) => return Err(e),
        }
    }

    Err(StorageError::Conflict {
        key: format!("module-progress/{}/{}", user, module),
    })
}

/// Atomically update a learner's lesson progress row.
pub async fn update_lesson_progress<F>(
    ledger: &dyn ProgressLedger,
    user: UserId,
    lesson: LessonId,
    mut mutate: F,
) -> Result<Versioned<UserLessonProgress>>
where
    F: FnMut(&mut UserLessonProgress) + Send,
{
    for _ in 0..MAX_SAVE_ATTEMPTS {
        let mut row = match ledger.load_lesson_progress(user, lesson).await? {
            Some(row) => row,
            None => Versioned::new(UserLessonProgress::new(user, lesson)),
        };
        mutate(&mut row.record);
        row.record.updated_at = chrono::Utc::now();

        match ledger.save_lesson_progress(row).await {
            Ok(saved) => return Ok(saved),
            Err(StorageError::Conflict { .. }) => continue,
            Err(e) => return Err(e),
        }
    }

    Err(StorageError::Conflict {
        key: format!("lesson-progress/{}/{}", user, lesson),
    })
}

/// Atomically update an existing mission attempt row.
///
/// Unlike the other helpers this one does not initialize missing rows;
/// attempts are created only by the mission runtime's `start`.
pub async fn update_mission_progress<F>(
    ledger: &dyn ProgressLedger,
    user: UserId,
    mission: MissionId,
    mut mutate: F,
) -> Result<Versioned<MissionProgress>>
where
    F: FnMut(&mut MissionProgress) + Send,
{
    for _ in 0..MAX_SAVE_ATTEMPTS {
        let mut row = ledger
            .load_attempt(user, mission)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("attempt/{}/{}", user, mission)))?;
        mutate(&mut row.record);

        match ledger.save_attempt(row).await {
            Ok(saved) => return Ok(saved),
            Err(StorageError::Conflict { .. }) => continue,
            Err(e) => return Err(e),
        }
    }

    Err(StorageError::Conflict {
        key: format!("attempt/{}/{}", user, mission),
    })
}
