//! Rollup service implementation.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};
use waypoint_core::{
    ActivityEvent, ActivityKind, LessonId, MissionId, MissionTier, Module, ModuleId,
    ProgressStatus, TrackId, UserId, UserLessonProgress, UserModuleProgress, UserTrackProgress,
};
use waypoint_rules::{RulesError, TierEvaluation, TierEvaluator};
use waypoint_storage::{
    update_lesson_progress, update_module_progress, update_track_progress, CatalogStore,
    ProgressLedger, StorageError,
};

/// Errors from rollup recomputation.
#[derive(Debug, thiserror::Error)]
pub enum RollupError {
    /// Module does not exist or is inactive
    #[error("module not found: {0}")]
    ModuleNotFound(ModuleId),

    /// Lesson does not exist or is inactive
    #[error("lesson not found: {0}")]
    LessonNotFound(LessonId),

    /// Mission does not exist or is inactive
    #[error("mission not found: {0}")]
    MissionNotFound(MissionId),

    /// Track does not exist
    #[error("track not found: {0}")]
    TrackNotFound(TrackId),

    /// Underlying storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Tier evaluation failure
    #[error(transparent)]
    Rules(#[from] RulesError),
}

/// Recomputes module and track aggregates from the ledger.
///
/// Safe to call redundantly: every recomputation derives purely from the
/// current ledger rows, so repeated invocations with no intervening
/// writes produce identical results.
pub struct RollupService {
    catalog: Arc<dyn CatalogStore>,
    ledger: Arc<dyn ProgressLedger>,
    evaluator: Arc<TierEvaluator>,
}

impl RollupService {
    /// Create a rollup service.
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        ledger: Arc<dyn ProgressLedger>,
        evaluator: Arc<TierEvaluator>,
    ) -> Self {
        Self {
            catalog,
            ledger,
            evaluator,
        }
    }

    /// Record lesson progress and roll the change up to the module and
    /// track.
    ///
    /// Quiz scores keep their best value; a required quiz passing for the
    /// first time increments the track's counter exactly once.
    pub async fn record_lesson_progress(
        &self,
        user: UserId,
        lesson_id: LessonId,
        percent: f32,
        quiz_score: Option<f32>,
    ) -> Result<UserLessonProgress, RollupError> {
        let lesson = self
            .catalog
            .lesson(lesson_id)
            .await?
            .filter(|l| l.active)
            .ok_or(RollupError::LessonNotFound(lesson_id))?;
        let module = self
            .catalog
            .module(lesson.module_id)
            .await?
            .ok_or(RollupError::ModuleNotFound(lesson.module_id))?;

        let mut newly_completed = false;
        let mut newly_passed_quiz = false;
        let row = update_lesson_progress(self.ledger.as_ref(), user, lesson_id, |row| {
            let was_completed = row.status == ProgressStatus::Completed;
            let had_passed = row.passed_quiz();

            if quiz_score.is_some() {
                row.quiz_attempts += 1;
            }
            if let Some(score) = quiz_score {
                let score = score.clamp(0.0, 100.0);
                row.quiz_score = Some(row.quiz_score.map_or(score, |old| old.max(score)));
            }

            let percent = percent.clamp(0.0, 100.0);
            row.progress_percentage = row.progress_percentage.max(percent);
            if row.progress_percentage >= 100.0 {
                row.status = ProgressStatus::Completed;
            } else if row.status == ProgressStatus::NotStarted {
                row.status = ProgressStatus::InProgress;
            }

            newly_completed = !was_completed && row.status == ProgressStatus::Completed;
            newly_passed_quiz = !had_passed && row.passed_quiz();
        })
        .await?;

        if newly_completed {
            let event = ActivityEvent::new(user, ActivityKind::LessonCompleted)
                .with_track(module.track_id)
                .with_module(module.id)
                .with_lesson(lesson_id);
            self.ledger.append_event(&event).await?;
        }

        if newly_passed_quiz && lesson.is_required {
            update_track_progress(self.ledger.as_ref(), user, module.track_id, |row| {
                row.quizzes_passed += 1;
            })
            .await?;
        }

        self.recompute_module(user, module.id).await?;
        self.recompute_track(user, module.track_id).await?;

        Ok(row.record)
    }

    /// Fold an approved mission into every module and track that links
    /// it.
    ///
    /// Called once per attempt by the review coordinator, behind its
    /// exactly-once completion guard.
    pub async fn on_mission_approved(
        &self,
        user: UserId,
        mission_id: MissionId,
    ) -> Result<(), RollupError> {
        let mission = self
            .catalog
            .mission(mission_id)
            .await?
            .ok_or(RollupError::MissionNotFound(mission_id))?;

        let links = self.catalog.links_for_mission(mission_id).await?;
        let mut tracks: BTreeSet<TrackId> = BTreeSet::new();
        for link in &links {
            self.recompute_module(user, link.module_id).await?;
            if let Some(module) = self.catalog.module(link.module_id).await? {
                tracks.insert(module.track_id);
            }
        }

        let event = ActivityEvent::new(user, ActivityKind::MissionCompleted)
            .with_mission(mission_id);
        let event = match tracks.iter().next() {
            Some(track) if tracks.len() == 1 => event.with_track(*track),
            _ => event,
        };
        self.ledger.append_event(&event).await?;

        for track_id in tracks {
            if mission.tier == MissionTier::Beginner {
                update_track_progress(self.ledger.as_ref(), user, track_id, |row| {
                    row.mini_missions_completed += 1;
                })
                .await?;
            }
            self.recompute_track(user, track_id).await?;
        }

        info!(%user, mission = %mission_id, "mission approval rolled up");
        Ok(())
    }

    /// Count a submitted reflection against every track linking the
    /// mission.
    pub async fn on_reflection_submitted(
        &self,
        user: UserId,
        mission_id: MissionId,
    ) -> Result<(), RollupError> {
        let tracks = self.catalog.tracks_for_mission(mission_id).await?;
        for track_id in &tracks {
            update_track_progress(self.ledger.as_ref(), user, *track_id, |row| {
                row.reflections_submitted += 1;
            })
            .await?;
        }

        let event = ActivityEvent::new(user, ActivityKind::ReflectionSubmitted)
            .with_mission(mission_id);
        self.ledger.append_event(&event).await?;
        Ok(())
    }

    /// Recompute a module's counters and completion percentage from its
    /// required lessons and missions.
    ///
    /// Percentage is completed-required over total-required, 0 when the
    /// module has no required content; the status flips to completed only
    /// when both lessons and missions are fully done.
    pub async fn recompute_module(
        &self,
        user: UserId,
        module_id: ModuleId,
    ) -> Result<UserModuleProgress, RollupError> {
        let module = self
            .catalog
            .module(module_id)
            .await?
            .ok_or(RollupError::ModuleNotFound(module_id))?;

        let mut lessons_total = 0u32;
        let mut lessons_done = 0u32;
        for lesson in self.catalog.lessons_for_module(module_id).await? {
            if !(lesson.is_required && lesson.active) {
                continue;
            }
            lessons_total += 1;
            let done = self
                .ledger
                .load_lesson_progress(user, lesson.id)
                .await?
                .is_some_and(|row| row.record.status == ProgressStatus::Completed);
            if done {
                lessons_done += 1;
            }
        }

        let mut missions_total = 0u32;
        let mut missions_done = 0u32;
        let mut seen: BTreeSet<MissionId> = BTreeSet::new();
        for link in self.catalog.links_for_module(module_id).await? {
            if !link.is_required || !seen.insert(link.mission_id) {
                continue;
            }
            missions_total += 1;
            let passed = self
                .ledger
                .load_attempt(user, link.mission_id)
                .await?
                .is_some_and(|row| row.record.passed());
            if passed {
                missions_done += 1;
            }
        }

        let total = lessons_total + missions_total;
        let done = lessons_done + missions_done;
        let percentage = if total == 0 {
            0.0
        } else {
            done as f32 / total as f32 * 100.0
        };
        let completed = total > 0 && lessons_done == lessons_total && missions_done == missions_total;

        let row = update_module_progress(self.ledger.as_ref(), user, module_id, |row| {
            row.lessons_completed = lessons_done;
            row.missions_completed = missions_done;
            row.completion_percentage = percentage;
            row.status = if completed {
                ProgressStatus::Completed
            } else if done > 0 {
                ProgressStatus::InProgress
            } else {
                ProgressStatus::NotStarted
            };
            if done > 0 && row.started_at.is_none() {
                row.started_at = Some(chrono::Utc::now());
            }
            if completed {
                if row.completed_at.is_none() {
                    row.completed_at = Some(chrono::Utc::now());
                }
            } else {
                row.completed_at = None;
            }
        })
        .await?;

        debug!(%user, module = %module_id, percentage, "module progress recomputed");
        Ok(row.record)
    }

    /// Recompute a track's counters and invoke tier evaluation for the
    /// track's own tier.
    ///
    /// Triggered synchronously after the underlying module-progress write
    /// commits, so the recomputation always observes it.
    pub async fn recompute_track(
        &self,
        user: UserId,
        track_id: TrackId,
    ) -> Result<(UserTrackProgress, TierEvaluation), RollupError> {
        let track = self
            .catalog
            .track(track_id)
            .await?
            .ok_or(RollupError::TrackNotFound(track_id))?;

        let required_modules: Vec<Module> = self
            .catalog
            .modules_for_track(track_id)
            .await?
            .into_iter()
            .filter(|m| m.is_required && m.active)
            .collect();

        let mut modules_done = 0u32;
        let mut lessons_done = 0u32;
        for module in &required_modules {
            if let Some(row) = self.ledger.load_module_progress(user, module.id).await? {
                if row.record.status == ProgressStatus::Completed {
                    modules_done += 1;
                }
                lessons_done += row.record.lessons_completed;
            }
        }

        let mut missions_done = 0u32;
        let mut seen: BTreeSet<MissionId> = BTreeSet::new();
        for link in self.catalog.links_for_track(track_id).await? {
            if !link.is_required || !seen.insert(link.mission_id) {
                continue;
            }
            let passed = self
                .ledger
                .load_attempt(user, link.mission_id)
                .await?
                .is_some_and(|row| row.record.passed());
            if passed {
                missions_done += 1;
            }
        }

        let total = required_modules.len() as u32;
        let percentage = if total == 0 {
            0.0
        } else {
            modules_done as f32 / total as f32 * 100.0
        };

        let row = update_track_progress(self.ledger.as_ref(), user, track_id, |row| {
            row.modules_completed = modules_done;
            row.lessons_completed = lessons_done;
            row.missions_completed = missions_done;
            row.completion_percentage = percentage;
        })
        .await?;

        let evaluation = self
            .evaluator
            .evaluate_tier(user, track_id, track.tier, false)
            .await?;

        Ok((row.record, evaluation))
    }
}
