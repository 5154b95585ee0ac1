//! Mission attempt lifecycle service.

use std::sync::Arc;

use tracing::{debug, info, warn};
use waypoint_core::{
    AiFeedback, AttemptStatus, Consequence, ChoiceId, DecisionId, DecisionRecord, FinalStatus,
    MentorReview, Mission, MissionId, MissionProgress, ReviewDecision, SubtaskId, UserId,
};
use waypoint_storage::{
    update_mission_progress, CatalogStore, ProgressLedger, StorageError, Versioned,
    MAX_SAVE_ATTEMPTS,
};

use crate::graph::{self, UnlockCheck};

/// Errors from mission attempt operations.
///
/// State-machine violations reject the request and leave stored state
/// unchanged.
#[derive(Debug, thiserror::Error)]
pub enum MissionError {
    /// Mission does not exist or is inactive
    #[error("mission not found: {0}")]
    MissionNotFound(MissionId),

    /// No attempt exists for this (user, mission)
    #[error("no attempt found for mission {0}")]
    AttemptNotFound(MissionId),

    /// Subtask index outside the catalog range
    #[error("subtask index {index} outside 1..={count}")]
    InvalidSubtask {
        /// 1-indexed position requested
        index: u32,
        /// Number of subtasks the mission declares
        count: u32,
    },

    /// Subtask id not declared by the mission
    #[error("unknown subtask id {0}")]
    UnknownSubtask(SubtaskId),

    /// Decision id not declared by the mission
    #[error("decision not found: {0}")]
    DecisionNotFound(DecisionId),

    /// Choice not among the decision's declared options
    #[error("choice {choice} is not declared for decision {decision}")]
    InvalidChoice {
        /// Decision the choice was recorded against
        decision: DecisionId,
        /// Undeclared choice id
        choice: ChoiceId,
    },

    /// Submit called on an attempt that already left `InProgress`
    #[error("attempt already submitted")]
    AlreadySubmitted,

    /// Operation not legal in the attempt's current state
    #[error("{operation} is not allowed while the attempt is {status:?}")]
    InvalidTransition {
        /// Operation that was rejected
        operation: &'static str,
        /// State the attempt was in
        status: AttemptStatus,
    },

    /// Underlying storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// An attempt together with its lazily-derived expiry flag.
///
/// Expired attempts are surfaced, never auto-failed; failing one takes an
/// explicit [`MissionRuntime::expire`] call.
#[derive(Debug, Clone)]
pub struct AttemptSnapshot {
    /// The attempt row
    pub progress: MissionProgress,

    /// Whether the deadline has passed while still in progress
    pub expired: bool,
}

/// Result of completing a subtask.
#[derive(Debug, Clone)]
pub struct SubtaskOutcome {
    /// Updated attempt
    pub progress: MissionProgress,

    /// Every subtask is now complete; the attempt can be submitted
    pub ready_to_submit: bool,
}

/// Drives mission attempts through their state machine.
///
/// Safe under concurrent invocation for the same (user, mission): every
/// mutation is a load-validate-save cycle with compare-and-swap, retried
/// a bounded number of times on conflict.
pub struct MissionRuntime {
    catalog: Arc<dyn CatalogStore>,
    ledger: Arc<dyn ProgressLedger>,
}

impl MissionRuntime {
    /// Create a runtime over the given catalog and ledger.
    pub fn new(catalog: Arc<dyn CatalogStore>, ledger: Arc<dyn ProgressLedger>) -> Self {
        Self { catalog, ledger }
    }

    /// Load the active mission definition.
    async fn mission_def(&self, id: MissionId) -> Result<Mission, MissionError> {
        self.catalog
            .mission(id)
            .await?
            .ok_or(MissionError::MissionNotFound(id))
    }

    /// Load, validate + mutate, and CAS-save an existing attempt.
    ///
    /// The mutation runs on a loaded copy; a rejected operation therefore
    /// never touches stored state.
    async fn mutate_attempt<R, F>(
        &self,
        user: UserId,
        mission_id: MissionId,
        mut apply: F,
    ) -> Result<(MissionProgress, R), MissionError>
    where
        F: FnMut(&Mission, &mut MissionProgress) -> Result<R, MissionError>,
    {
        let mission = self.mission_def(mission_id).await?;

        for _ in 0..MAX_SAVE_ATTEMPTS {
            let mut row = self
                .ledger
                .load_attempt(user, mission_id)
                .await?
                .ok_or(MissionError::AttemptNotFound(mission_id))?;

            let out = apply(&mission, &mut row.record)?;

            match self.ledger.save_attempt(row).await {
                Ok(saved) => return Ok((saved.record, out)),
                Err(StorageError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(MissionError::Storage(StorageError::Conflict {
            key: format!("attempt/{}/{}", user, mission_id),
        }))
    }

    /// Start a mission attempt.
    ///
    /// Idempotent: an existing attempt in a non-terminal state (or an
    /// approved one) is returned unchanged. A failed attempt is
    /// re-initialized in place so the learner can retry; the row stays
    /// unique per (user, mission).
    pub async fn start(
        &self,
        user: UserId,
        mission_id: MissionId,
    ) -> Result<MissionProgress, MissionError> {
        let mission = self.mission_def(mission_id).await?;
        if !mission.active {
            return Err(MissionError::MissionNotFound(mission_id));
        }

        for _ in 0..MAX_SAVE_ATTEMPTS {
            match self.ledger.load_attempt(user, mission_id).await? {
                Some(row) if row.record.status != AttemptStatus::Failed => {
                    debug!(%user, mission = %mission_id, status = ?row.record.status,
                        "start is a no-op for existing attempt");
                    return Ok(row.record);
                }
                Some(mut row) => {
                    row.record = MissionProgress::start(user, &mission, chrono::Utc::now());
                    match self.ledger.save_attempt(row).await {
                        Ok(saved) => {
                            info!(%user, mission = %mission_id, "restarted failed attempt");
                            return Ok(saved.record);
                        }
                        Err(StorageError::Conflict { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                None => {
                    let fresh = Versioned::new(MissionProgress::start(
                        user,
                        &mission,
                        chrono::Utc::now(),
                    ));
                    match self.ledger.save_attempt(fresh).await {
                        Ok(saved) => {
                            info!(%user, mission = %mission_id, "started mission attempt");
                            return Ok(saved.record);
                        }
                        // Lost a concurrent create; the winner's attempt
                        // is the one to return.
                        Err(StorageError::Conflict { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        Err(MissionError::Storage(StorageError::Conflict {
            key: format!("attempt/{}/{}", user, mission_id),
        }))
    }

    /// Read an attempt with its expiry derived lazily at read time.
    pub async fn snapshot(
        &self,
        user: UserId,
        mission_id: MissionId,
    ) -> Result<AttemptSnapshot, MissionError> {
        let row = self
            .ledger
            .load_attempt(user, mission_id)
            .await?
            .ok_or(MissionError::AttemptNotFound(mission_id))?;

        let expired = row.record.is_expired(chrono::Utc::now());
        Ok(AttemptSnapshot {
            progress: row.record,
            expired,
        })
    }

    /// Mark a subtask complete by its 1-indexed position.
    ///
    /// Advances `current_subtask` to the next index; on the last subtask
    /// it stays at the final index and the outcome signals readiness to
    /// submit.
    pub async fn complete_subtask(
        &self,
        user: UserId,
        mission_id: MissionId,
        subtask_index: u32,
        notes: Option<String>,
    ) -> Result<SubtaskOutcome, MissionError> {
        let notes_in = notes;
        let (progress, ready) = self
            .mutate_attempt(user, mission_id, move |mission, progress| {
                if progress.status != AttemptStatus::InProgress {
                    return Err(MissionError::InvalidTransition {
                        operation: "complete_subtask",
                        status: progress.status,
                    });
                }

                let count = mission.subtasks.len() as u32;
                if subtask_index == 0 || subtask_index > count {
                    return Err(MissionError::InvalidSubtask {
                        index: subtask_index,
                        count,
                    });
                }

                let subtask_id = mission.subtasks[(subtask_index - 1) as usize].id;
                let now = chrono::Utc::now();

                let elapsed = (now - progress.last_activity_at).num_seconds().max(0);
                *progress.time_per_stage.entry(subtask_id).or_insert(0) += elapsed;

                let record = progress.subtasks.entry(subtask_id).or_default();
                record.completed = true;
                record.completed_at = Some(now);
                if notes_in.is_some() {
                    record.notes = notes_in.clone();
                }

                if subtask_index < count {
                    progress.current_subtask = subtask_index + 1;
                }
                progress.last_activity_at = now;

                Ok(progress.all_subtasks_completed())
            })
            .await?;

        Ok(SubtaskOutcome {
            progress,
            ready_to_submit: ready,
        })
    }

    /// Check whether a subtask's declared dependencies are all met.
    pub async fn check_subtask_unlockable(
        &self,
        user: UserId,
        mission_id: MissionId,
        subtask: SubtaskId,
    ) -> Result<UnlockCheck, MissionError> {
        let mission = self.mission_def(mission_id).await?;
        let row = self
            .ledger
            .load_attempt(user, mission_id)
            .await?
            .ok_or(MissionError::AttemptNotFound(mission_id))?;

        graph::missing_dependencies(&mission, &row.record, subtask)
    }

    /// Record a decision choice; last write wins per decision point.
    ///
    /// Returns the catalog-declared consequence for the chosen option.
    pub async fn record_decision(
        &self,
        user: UserId,
        mission_id: MissionId,
        decision_id: DecisionId,
        choice_id: ChoiceId,
    ) -> Result<Consequence, MissionError> {
        let (_, consequence) = self
            .mutate_attempt(user, mission_id, move |mission, progress| {
                if progress.status != AttemptStatus::InProgress {
                    return Err(MissionError::InvalidTransition {
                        operation: "record_decision",
                        status: progress.status,
                    });
                }

                let decision = mission
                    .decision_points
                    .get(&decision_id)
                    .ok_or_else(|| MissionError::DecisionNotFound(decision_id.clone()))?;

                let choice =
                    decision
                        .choice(&choice_id)
                        .ok_or_else(|| MissionError::InvalidChoice {
                            decision: decision_id.clone(),
                            choice: choice_id.clone(),
                        })?;

                let now = chrono::Utc::now();
                progress.decisions.insert(
                    decision_id.clone(),
                    DecisionRecord {
                        choice: choice_id.clone(),
                        decided_at: now,
                    },
                );
                progress.last_activity_at = now;

                Ok(choice.consequence.clone())
            })
            .await?;

        Ok(consequence)
    }

    /// Submit an attempt for review.
    ///
    /// Legal only from `InProgress`. Stores the reflection when provided.
    /// Dispatching the asynchronous AI review belongs to the review
    /// coordinator, which wraps this call.
    pub async fn submit(
        &self,
        user: UserId,
        mission_id: MissionId,
        reflection: Option<String>,
    ) -> Result<MissionProgress, MissionError> {
        let (progress, _) = self
            .mutate_attempt(user, mission_id, move |_, progress| {
                if progress.status != AttemptStatus::InProgress {
                    return Err(MissionError::AlreadySubmitted);
                }

                let now = chrono::Utc::now();
                progress.status = AttemptStatus::Submitted;
                progress.submitted_at = Some(now);
                progress.last_activity_at = now;
                if let Some(text) = reflection.clone() {
                    progress.reflection = Some(text);
                    progress.reflection_submitted = true;
                }

                Ok(())
            })
            .await?;

        info!(%user, mission = %mission_id, "attempt submitted");
        Ok(progress)
    }

    /// Apply an AI review result.
    ///
    /// Idempotent per review batch: an attempt already at or past
    /// `AiReviewed` is returned unchanged so replays cannot double-count
    /// downstream side effects.
    pub async fn apply_ai_review(
        &self,
        user: UserId,
        mission_id: MissionId,
        score: f32,
        feedback: Option<AiFeedback>,
    ) -> Result<MissionProgress, MissionError> {
        let (progress, _) = self
            .mutate_attempt(user, mission_id, move |_, progress| {
                match progress.status {
                    AttemptStatus::Submitted => {
                        progress.status = AttemptStatus::AiReviewed;
                        progress.ai_score = Some(score);
                        progress.ai_feedback = feedback.clone();
                        progress.ai_reviewed_at = Some(chrono::Utc::now());
                    }
                    AttemptStatus::AiReviewed
                    | AttemptStatus::MentorReview
                    | AttemptStatus::Approved
                    | AttemptStatus::Failed
                    | AttemptStatus::RevisionRequested => {
                        debug!(%user, mission = %mission_id,
                            "ai review already applied; ignoring replay");
                    }
                    _ => {
                        return Err(MissionError::InvalidTransition {
                            operation: "apply_ai_review",
                            status: progress.status,
                        });
                    }
                }
                Ok(())
            })
            .await?;

        Ok(progress)
    }

    /// Claim an attempt for mentor review.
    pub async fn begin_mentor_review(
        &self,
        user: UserId,
        mission_id: MissionId,
    ) -> Result<MissionProgress, MissionError> {
        let (progress, _) = self
            .mutate_attempt(user, mission_id, |_, progress| {
                match progress.status {
                    AttemptStatus::Submitted | AttemptStatus::AiReviewed => {
                        progress.status = AttemptStatus::MentorReview;
                    }
                    AttemptStatus::MentorReview => {}
                    _ => {
                        return Err(MissionError::InvalidTransition {
                            operation: "begin_mentor_review",
                            status: progress.status,
                        });
                    }
                }
                Ok(())
            })
            .await?;

        Ok(progress)
    }

    /// Apply a mentor's decision, the single authoritative point where an
    /// attempt becomes terminal for completion-rule purposes.
    ///
    /// The mentor score is the mean of provided subtask scores, else the
    /// supplied aggregate, else the AI score.
    pub async fn apply_mentor_review(
        &self,
        user: UserId,
        mission_id: MissionId,
        review: MentorReview,
    ) -> Result<MissionProgress, MissionError> {
        let (progress, _) = self
            .mutate_attempt(user, mission_id, move |_, progress| {
                if !progress.status.mentor_reviewable() {
                    return Err(MissionError::InvalidTransition {
                        operation: "apply_mentor_review",
                        status: progress.status,
                    });
                }

                let mentor_score = if !review.subtask_scores.is_empty() {
                    let sum: f32 = review.subtask_scores.values().sum();
                    Some(sum / review.subtask_scores.len() as f32)
                } else if review.overall_override.is_some() {
                    review.overall_override
                } else {
                    progress.ai_score
                };

                progress.mentor_score = mentor_score;
                progress.recommended_recipes = review.recommended_recipes.clone();
                progress.mentor_reviewed_at = Some(chrono::Utc::now());
                match review.decision {
                    ReviewDecision::Pass => {
                        progress.status = AttemptStatus::Approved;
                        progress.final_status = FinalStatus::Pass;
                    }
                    ReviewDecision::Fail => {
                        progress.status = AttemptStatus::Failed;
                        progress.final_status = FinalStatus::Fail;
                    }
                }

                Ok(())
            })
            .await?;

        info!(%user, mission = %mission_id, status = ?progress.status, "mentor review applied");
        Ok(progress)
    }

    /// Send an attempt back to the learner for revision.
    pub async fn request_revision(
        &self,
        user: UserId,
        mission_id: MissionId,
        feedback: String,
    ) -> Result<MissionProgress, MissionError> {
        let (progress, _) = self
            .mutate_attempt(user, mission_id, move |_, progress| {
                if !progress.status.mentor_reviewable() {
                    return Err(MissionError::InvalidTransition {
                        operation: "request_revision",
                        status: progress.status,
                    });
                }

                progress.status = AttemptStatus::RevisionRequested;
                progress.mentor_feedback = Some(feedback.clone());
                progress.mentor_reviewed_at = Some(chrono::Utc::now());
                Ok(())
            })
            .await?;

        Ok(progress)
    }

    /// Resume a revision-requested attempt.
    pub async fn resume(
        &self,
        user: UserId,
        mission_id: MissionId,
    ) -> Result<MissionProgress, MissionError> {
        let (progress, _) = self
            .mutate_attempt(user, mission_id, |_, progress| {
                if progress.status != AttemptStatus::RevisionRequested {
                    return Err(MissionError::InvalidTransition {
                        operation: "resume",
                        status: progress.status,
                    });
                }

                progress.status = AttemptStatus::InProgress;
                progress.submitted_at = None;
                progress.last_activity_at = chrono::Utc::now();
                Ok(())
            })
            .await?;

        Ok(progress)
    }

    /// Fail an expired in-progress attempt.
    ///
    /// This is the explicit caller decision that follows a `snapshot`
    /// reporting expiry; nothing expires attempts in the background.
    pub async fn expire(
        &self,
        user: UserId,
        mission_id: MissionId,
    ) -> Result<MissionProgress, MissionError> {
        let (progress, _) = self
            .mutate_attempt(user, mission_id, |_, progress| {
                if !progress.is_expired(chrono::Utc::now()) {
                    return Err(MissionError::InvalidTransition {
                        operation: "expire",
                        status: progress.status,
                    });
                }

                progress.status = AttemptStatus::Failed;
                progress.final_status = FinalStatus::Fail;
                Ok(())
            })
            .await?;

        warn!(%user, mission = %mission_id, "attempt expired past its deadline");
        Ok(progress)
    }

    /// Count a hint against the attempt.
    pub async fn log_hint(
        &self,
        user: UserId,
        mission_id: MissionId,
    ) -> Result<MissionProgress, MissionError> {
        let (progress, _) = self
            .mutate_attempt(user, mission_id, |_, progress| {
                if progress.status != AttemptStatus::InProgress {
                    return Err(MissionError::InvalidTransition {
                        operation: "log_hint",
                        status: progress.status,
                    });
                }
                progress.hints_used += 1;
                progress.last_activity_at = chrono::Utc::now();
                Ok(())
            })
            .await?;

        Ok(progress)
    }

    /// Record a tool the learner reported using.
    pub async fn log_tool(
        &self,
        user: UserId,
        mission_id: MissionId,
        tool: impl Into<String>,
    ) -> Result<MissionProgress, MissionError> {
        let tool = tool.into();
        let (progress, _) = self
            .mutate_attempt(user, mission_id, move |_, progress| {
                if progress.status != AttemptStatus::InProgress {
                    return Err(MissionError::InvalidTransition {
                        operation: "log_tool",
                        status: progress.status,
                    });
                }
                if !progress.tools_used.contains(&tool) {
                    progress.tools_used.push(tool.clone());
                }
                progress.last_activity_at = chrono::Utc::now();
                Ok(())
            })
            .await?;

        Ok(progress)
    }

    /// Record the drop-off stage for an attempt inactive past the window.
    ///
    /// Analytics only; the attempt's status never changes here. Returns
    /// the recorded stage, if any.
    pub async fn flag_drop_off(
        &self,
        user: UserId,
        mission_id: MissionId,
        inactive_after: chrono::Duration,
    ) -> Result<Option<u32>, MissionError> {
        let row = update_mission_progress(self.ledger.as_ref(), user, mission_id, |progress| {
            let now = chrono::Utc::now();
            if progress.status == AttemptStatus::InProgress
                && progress.drop_off_stage.is_none()
                && now - progress.last_activity_at >= inactive_after
            {
                progress.drop_off_stage = Some(progress.current_subtask);
            }
        })
        .await
        .map_err(|e| match e {
            StorageError::NotFound(_) => MissionError::AttemptNotFound(mission_id),
            e => MissionError::Storage(e),
        })?;

        Ok(row.record.drop_off_stage)
    }

    /// Claim the one-time completion side effects for an approved attempt.
    ///
    /// Returns true exactly once per attempt; the timestamp doubles as
    /// the idempotency key for portfolio/skill-signal emission.
    pub async fn record_completion_effects(
        &self,
        user: UserId,
        mission_id: MissionId,
    ) -> Result<bool, MissionError> {
        let (_, newly) = self
            .mutate_attempt(user, mission_id, |_, progress| {
                if progress.status != AttemptStatus::Approved {
                    return Err(MissionError::InvalidTransition {
                        operation: "record_completion_effects",
                        status: progress.status,
                    });
                }

                if progress.completion_recorded_at.is_none() {
                    progress.completion_recorded_at = Some(chrono::Utc::now());
                    Ok(true)
                } else {
                    Ok(false)
                }
            })
            .await?;

        Ok(newly)
    }
}
