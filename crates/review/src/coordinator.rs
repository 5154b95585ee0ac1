//! Review coordination over the mission runtime and rollup service.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use waypoint_core::{
    MentorReview, Mission, MissionId, MissionProgress, ModuleMissionId, ReviewDecision, UserId,
};
use waypoint_mission::{MissionError, MissionRuntime};
use waypoint_rollup::{RollupError, RollupService};
use waypoint_storage::{CatalogStore, StorageError};

use crate::ai::{fallback_outcome, AiReviewRequest, AiReviewer, ReviewArtifact};
use crate::hooks::CompletionHooks;

/// Errors from review coordination.
#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    /// Module-mission link referenced by an ingested record is unknown
    #[error("module mission link not found: {0}")]
    LinkNotFound(ModuleMissionId),

    /// Mission definition missing from the catalog
    #[error("mission not found: {0}")]
    MissionNotFound(MissionId),

    /// State machine rejection
    #[error(transparent)]
    Mission(#[from] MissionError),

    /// Rollup failure
    #[error(transparent)]
    Rollup(#[from] RollupError),

    /// Underlying storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Status reported by the external mission-submission pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestedStatus {
    /// Work submitted, review pending
    Submitted,
    /// Externally graded as passing
    Passed,
    /// Externally graded as failing
    Failed,
}

/// A record ingested from the external submission pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRecord {
    /// Learner the submission belongs to
    pub user: UserId,

    /// Link identifying module and mission
    pub module_mission_id: ModuleMissionId,

    /// Reported status
    pub status: IngestedStatus,

    /// Upstream submission identifier
    pub mission_submission_id: Option<String>,

    /// Score, 0-100, when graded
    pub score: Option<f32>,

    /// Letter grade, when the upstream system uses one
    pub grade: Option<String>,

    /// Reviewer feedback
    pub feedback: Option<String>,
}

/// Coordinates AI review dispatch, mentor decisions and the exactly-once
/// completion side effects.
#[derive(Clone)]
pub struct ReviewCoordinator {
    catalog: Arc<dyn CatalogStore>,
    runtime: Arc<MissionRuntime>,
    rollup: Arc<RollupService>,
    reviewer: Arc<dyn AiReviewer>,
    hooks: Arc<dyn CompletionHooks>,
}

impl ReviewCoordinator {
    /// Create a coordinator.
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        runtime: Arc<MissionRuntime>,
        rollup: Arc<RollupService>,
        reviewer: Arc<dyn AiReviewer>,
        hooks: Arc<dyn CompletionHooks>,
    ) -> Self {
        Self {
            catalog,
            runtime,
            rollup,
            reviewer,
            hooks,
        }
    }

    /// Submit an attempt and dispatch the AI review.
    ///
    /// The review runs as a fire-and-forget task; the submit caller never
    /// waits on the reviewer, and reviewer failures resolve to the
    /// documented fallback score instead of leaving the attempt stuck in
    /// `Submitted`.
    pub async fn submit(
        &self,
        user: UserId,
        mission_id: MissionId,
        reflection: Option<String>,
    ) -> Result<MissionProgress, ReviewError> {
        let had_reflection = self
            .runtime
            .snapshot(user, mission_id)
            .await?
            .progress
            .reflection_submitted;

        let progress = self.runtime.submit(user, mission_id, reflection).await?;

        if progress.reflection_submitted && !had_reflection {
            self.rollup.on_reflection_submitted(user, mission_id).await?;
        }

        let coordinator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.run_ai_review(user, mission_id).await {
                error!(%user, mission = %mission_id, error = %e, "ai review task failed");
            }
        });

        Ok(progress)
    }

    /// Run the AI review for a submitted attempt and apply its result.
    ///
    /// Normally invoked by the task `submit` spawns; callable directly by
    /// a retry worker. Reviewer failures substitute the fallback outcome.
    pub async fn run_ai_review(
        &self,
        user: UserId,
        mission_id: MissionId,
    ) -> Result<MissionProgress, ReviewError> {
        let mission = self.mission_def(mission_id).await?;
        let snapshot = self.runtime.snapshot(user, mission_id).await?;
        let request = build_request(&mission, &snapshot.progress);

        let outcome = match self.reviewer.review(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%user, mission = %mission_id, error = %e,
                    "ai reviewer unavailable; substituting fallback score");
                fallback_outcome()
            }
        };

        let progress = self
            .runtime
            .apply_ai_review(user, mission_id, outcome.score, Some(outcome.feedback()))
            .await?;
        Ok(progress)
    }

    /// Apply a mentor decision and, on the first transition into
    /// approved, fire the one-time completion side effects.
    ///
    /// The idempotency key is the attempt plus the approved status: a
    /// second invocation for the same transition finds the completion
    /// already recorded and fires nothing again.
    pub async fn finalize_mentor_review(
        &self,
        user: UserId,
        mission_id: MissionId,
        review: MentorReview,
    ) -> Result<MissionProgress, ReviewError> {
        let progress = self
            .runtime
            .apply_mentor_review(user, mission_id, review)
            .await?;

        if progress.approved_and_passed() {
            self.fire_completion_effects(user, mission_id, &progress)
                .await?;
        }

        Ok(progress)
    }

    /// Ingest a record from the external submission pipeline.
    pub async fn ingest_submission(
        &self,
        record: SubmissionRecord,
    ) -> Result<MissionProgress, ReviewError> {
        let link = self
            .catalog
            .link(record.module_mission_id)
            .await?
            .ok_or(ReviewError::LinkNotFound(record.module_mission_id))?;

        info!(
            user = %record.user,
            mission = %link.mission_id,
            submission = record.mission_submission_id.as_deref().unwrap_or("-"),
            status = ?record.status,
            "ingesting external submission"
        );

        match record.status {
            IngestedStatus::Submitted => {
                let progress = self
                    .runtime
                    .submit(record.user, link.mission_id, None)
                    .await?;
                Ok(progress)
            }
            IngestedStatus::Passed | IngestedStatus::Failed => {
                // The external grade is authoritative; make sure the
                // attempt has left `InProgress` before applying it.
                let snapshot = self.runtime.snapshot(record.user, link.mission_id).await?;
                if snapshot.progress.status == waypoint_core::AttemptStatus::InProgress {
                    self.runtime
                        .submit(record.user, link.mission_id, None)
                        .await?;
                }

                let decision = if record.status == IngestedStatus::Passed {
                    ReviewDecision::Pass
                } else {
                    ReviewDecision::Fail
                };
                let review = MentorReview {
                    subtask_scores: Default::default(),
                    overall_override: record.score,
                    decision,
                    recommended_recipes: Vec::new(),
                };

                self.finalize_mentor_review(record.user, link.mission_id, review)
                    .await
            }
        }
    }

    /// Fire portfolio, skill-signal and dashboard hooks plus the rollup,
    /// exactly once per approved attempt.
    async fn fire_completion_effects(
        &self,
        user: UserId,
        mission_id: MissionId,
        progress: &MissionProgress,
    ) -> Result<(), ReviewError> {
        let newly = self
            .runtime
            .record_completion_effects(user, mission_id)
            .await?;
        if !newly {
            info!(%user, mission = %mission_id,
                "completion effects already recorded; skipping replay");
            return Ok(());
        }

        let mission = self.mission_def(mission_id).await?;
        self.hooks.portfolio_entry(user, &mission, progress).await;
        self.hooks.skill_signal(user, &mission, progress).await;
        self.hooks.invalidate_dashboards(user).await;

        self.rollup.on_mission_approved(user, mission_id).await?;
        Ok(())
    }

    async fn mission_def(&self, mission_id: MissionId) -> Result<Mission, ReviewError> {
        self.catalog
            .mission(mission_id)
            .await?
            .ok_or(ReviewError::MissionNotFound(mission_id))
    }
}

/// Build the reviewer request from the catalog mission and the attempt.
fn build_request(mission: &Mission, progress: &MissionProgress) -> AiReviewRequest {
    let artifacts = progress
        .subtasks
        .values()
        .filter_map(|record| record.evidence.as_ref())
        .map(|url| ReviewArtifact {
            kind: "evidence".to_string(),
            url: url.clone(),
            filename: None,
        })
        .collect();

    AiReviewRequest {
        mission_id: mission.id,
        title: mission.title.clone(),
        description: mission.description.clone(),
        skill_tags: mission.skill_tags.clone(),
        submission_notes: progress.reflection.clone(),
        artifacts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{AiReviewOutcome, ReviewerError, StaticReviewer, DEFAULT_AI_SCORE};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use waypoint_core::{
        AttemptStatus, Lesson, LessonId, LessonKind, MissionTier, Module, ModuleId, ModuleMission,
        ProgramKey, ProgressionMode, Tier, Track, TrackId, TrackRequirements,
    };
    use waypoint_rules::TierEvaluator;
    use waypoint_storage::{MemoryStore, ProgressLedger};

    struct FailingReviewer;

    #[async_trait]
    impl AiReviewer for FailingReviewer {
        async fn review(
            &self,
            _request: AiReviewRequest,
        ) -> Result<AiReviewOutcome, ReviewerError> {
            Err(ReviewerError::Unavailable("provider down".to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        portfolio: AtomicUsize,
        signals: AtomicUsize,
        dashboards: AtomicUsize,
    }

    #[async_trait]
    impl CompletionHooks for RecordingHooks {
        async fn portfolio_entry(
            &self,
            _user: UserId,
            _mission: &Mission,
            _progress: &MissionProgress,
        ) {
            self.portfolio.fetch_add(1, Ordering::SeqCst);
        }

        async fn skill_signal(
            &self,
            _user: UserId,
            _mission: &Mission,
            _progress: &MissionProgress,
        ) {
            self.signals.fetch_add(1, Ordering::SeqCst);
        }

        async fn invalidate_dashboards(&self, _user: UserId) {
            self.dashboards.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        coordinator: ReviewCoordinator,
        hooks: Arc<RecordingHooks>,
        user: UserId,
        track_id: TrackId,
        mission_id: MissionId,
        link_id: ModuleMissionId,
    }

    async fn fixture(reviewer: Arc<dyn AiReviewer>) -> Fixture {
        let store = Arc::new(MemoryStore::new());

        let track = Track {
            id: TrackId::new(),
            name: "Defender".to_string(),
            program: ProgramKey::Defender,
            tier: Tier::Beginner,
            progression_mode: ProgressionMode::Flexible,
            requirements: TrackRequirements::default(),
            active: true,
        };
        store.insert_track(track.clone()).await.unwrap();

        let module = Module {
            id: ModuleId::new(),
            track_id: track.id,
            name: "Foundations".to_string(),
            is_required: true,
            order_index: 0,
            active: true,
        };
        store.insert_module(module.clone()).await.unwrap();

        store
            .insert_lesson(Lesson {
                id: LessonId::new(),
                module_id: module.id,
                title: "Foundations quiz".to_string(),
                kind: LessonKind::Quiz,
                is_required: true,
                active: true,
            })
            .await
            .unwrap();

        let mission = Mission {
            id: MissionId::new(),
            title: "Contain a compromised host".to_string(),
            description: "Incident response walk-through".to_string(),
            difficulty: 2,
            tier: MissionTier::Beginner,
            program: None,
            skill_tags: vec!["incident-response".to_string()],
            active: true,
            time_constraint_hours: None,
            reflection_required: true,
            subtasks: vec![],
            decision_points: BTreeMap::new(),
        };
        store.insert_mission(mission.clone()).await.unwrap();

        let link_id = ModuleMissionId::new();
        store
            .insert_link(ModuleMission {
                id: link_id,
                module_id: module.id,
                mission_id: mission.id,
                is_required: true,
                recommended_order: 0,
            })
            .await
            .unwrap();

        let runtime = Arc::new(MissionRuntime::new(store.clone(), store.clone()));
        let evaluator = Arc::new(TierEvaluator::new(store.clone(), store.clone()));
        let rollup = Arc::new(RollupService::new(store.clone(), store.clone(), evaluator));
        let hooks = Arc::new(RecordingHooks::default());

        let coordinator = ReviewCoordinator::new(
            store.clone(),
            runtime,
            rollup,
            reviewer,
            hooks.clone(),
        );

        Fixture {
            store,
            coordinator,
            hooks,
            user: UserId::new(),
            track_id: track.id,
            mission_id: mission.id,
            link_id,
        }
    }

    fn scored_outcome(score: f32) -> AiReviewOutcome {
        AiReviewOutcome {
            score,
            strengths: vec!["Clear containment decision".to_string()],
            gaps: vec![],
            suggestions: vec![],
            competencies: vec![],
        }
    }

    async fn start_attempt(f: &Fixture) {
        let runtime = MissionRuntime::new(f.store.clone(), f.store.clone());
        runtime.start(f.user, f.mission_id).await.unwrap();
    }

    #[tokio::test]
    async fn ai_review_applies_the_reviewer_score() {
        let f = fixture(Arc::new(StaticReviewer::new(scored_outcome(88.0)))).await;
        start_attempt(&f).await;

        f.coordinator
            .submit(f.user, f.mission_id, Some("Reflection text".to_string()))
            .await
            .unwrap();

        let progress = f
            .coordinator
            .run_ai_review(f.user, f.mission_id)
            .await
            .unwrap();
        assert_eq!(progress.status, AttemptStatus::AiReviewed);
        assert_eq!(progress.ai_score, Some(88.0));
    }

    #[tokio::test]
    async fn reviewer_failure_substitutes_the_fallback_score() {
        let f = fixture(Arc::new(FailingReviewer)).await;
        start_attempt(&f).await;

        f.coordinator
            .submit(f.user, f.mission_id, None)
            .await
            .unwrap();
        let progress = f
            .coordinator
            .run_ai_review(f.user, f.mission_id)
            .await
            .unwrap();

        assert_eq!(progress.status, AttemptStatus::AiReviewed);
        assert_eq!(progress.ai_score, Some(DEFAULT_AI_SCORE));
        let feedback = progress.ai_feedback.unwrap();
        assert_eq!(feedback.strengths, vec!["Submission received".to_string()]);
    }

    #[tokio::test]
    async fn approval_fires_hooks_and_rollup_exactly_once() {
        let f = fixture(Arc::new(StaticReviewer::neutral())).await;
        start_attempt(&f).await;
        f.coordinator
            .submit(f.user, f.mission_id, Some("Done".to_string()))
            .await
            .unwrap();

        let progress = f
            .coordinator
            .finalize_mentor_review(
                f.user,
                f.mission_id,
                MentorReview::decision(ReviewDecision::Pass),
            )
            .await
            .unwrap();
        assert_eq!(progress.status, AttemptStatus::Approved);

        assert_eq!(f.hooks.portfolio.load(Ordering::SeqCst), 1);
        assert_eq!(f.hooks.signals.load(Ordering::SeqCst), 1);
        assert_eq!(f.hooks.dashboards.load(Ordering::SeqCst), 1);

        let row = f
            .store
            .load_track_progress(f.user, f.track_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.record.mini_missions_completed, 1);

        // A replayed finalize is rejected by the state machine and fires
        // nothing again.
        let err = f
            .coordinator
            .finalize_mentor_review(
                f.user,
                f.mission_id,
                MentorReview::decision(ReviewDecision::Pass),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReviewError::Mission(MissionError::InvalidTransition { .. })
        ));
        assert_eq!(f.hooks.portfolio.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reflection_is_counted_once_per_attempt() {
        let f = fixture(Arc::new(StaticReviewer::neutral())).await;
        start_attempt(&f).await;

        f.coordinator
            .submit(f.user, f.mission_id, Some("First thoughts".to_string()))
            .await
            .unwrap();

        let row = f
            .store
            .load_track_progress(f.user, f.track_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.record.reflections_submitted, 1);
    }

    #[tokio::test]
    async fn ingesting_unknown_link_is_not_found() {
        let f = fixture(Arc::new(StaticReviewer::neutral())).await;

        let err = f
            .coordinator
            .ingest_submission(SubmissionRecord {
                user: f.user,
                module_mission_id: ModuleMissionId::new(),
                status: IngestedStatus::Submitted,
                mission_submission_id: None,
                score: None,
                grade: None,
                feedback: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReviewError::LinkNotFound(_)));
    }

    #[tokio::test]
    async fn ingested_pass_approves_and_scores_the_attempt() {
        let f = fixture(Arc::new(StaticReviewer::neutral())).await;
        start_attempt(&f).await;

        let progress = f
            .coordinator
            .ingest_submission(SubmissionRecord {
                user: f.user,
                module_mission_id: f.link_id,
                status: IngestedStatus::Passed,
                mission_submission_id: Some("sub-42".to_string()),
                score: Some(91.0),
                grade: Some("A".to_string()),
                feedback: Some("Strong work".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(progress.status, AttemptStatus::Approved);
        assert_eq!(progress.mentor_score, Some(91.0));
        assert_eq!(f.hooks.portfolio.load(Ordering::SeqCst), 1);
    }
}
