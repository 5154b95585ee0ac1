//! Progress ledger models - per-learner mutable records.
//!
//! Ledger rows are keyed by `(user, entity)`, created lazily on first
//! interaction and never deleted. They are mutated only by the mission
//! runtime, the lesson-progress handlers and the rollup service.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::catalog::{Mission, Tier};
use crate::id::{ChoiceId, DecisionId, LessonId, MissionId, ModuleId, SubtaskId, TrackId, UserId};
use crate::Time;

/// Generic progress status shared by module and lesson records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressStatus {
    /// No interaction yet
    NotStarted,
    /// Some required content done
    InProgress,
    /// All required content done
    Completed,
    /// Blocked by an unmet prerequisite
    Blocked,
}

/// Per-user module progress, `(user, module)` unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserModuleProgress {
    /// Learner
    pub user: UserId,

    /// Module
    pub module: ModuleId,

    /// Current status
    pub status: ProgressStatus,

    /// Completed-required over total-required, 0-100
    pub completion_percentage: f32,

    /// Required lessons completed
    pub lessons_completed: u32,

    /// Required missions completed
    pub missions_completed: u32,

    /// First interaction
    pub started_at: Option<Time>,

    /// When the module completed
    pub completed_at: Option<Time>,

    /// Last mutation
    pub updated_at: Time,
}

impl UserModuleProgress {
    /// Fresh row for a first interaction.
    pub fn new(user: UserId, module: ModuleId) -> Self {
        Self {
            user,
            module,
            status: ProgressStatus::NotStarted,
            completion_percentage: 0.0,
            lessons_completed: 0,
            missions_completed: 0,
            started_at: None,
            completed_at: None,
            updated_at: chrono::Utc::now(),
        }
    }
}

/// Per-user lesson progress, `(user, lesson)` unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserLessonProgress {
    /// Learner
    pub user: UserId,

    /// Lesson
    pub lesson: LessonId,

    /// Current status
    pub status: ProgressStatus,

    /// Content progress, 0-100
    pub progress_percentage: f32,

    /// Best quiz score, when the lesson is a quiz
    pub quiz_score: Option<f32>,

    /// Quiz attempts made
    pub quiz_attempts: u32,

    /// Last mutation
    pub updated_at: Time,
}

/// Minimum quiz score counted as passing.
pub const QUIZ_PASS_SCORE: f32 = 70.0;

impl UserLessonProgress {
    /// Fresh row for a first interaction.
    pub fn new(user: UserId, lesson: LessonId) -> Self {
        Self {
            user,
            lesson,
            status: ProgressStatus::NotStarted,
            progress_percentage: 0.0,
            quiz_score: None,
            quiz_attempts: 0,
            updated_at: chrono::Utc::now(),
        }
    }

    /// Whether this lesson was completed with a passing quiz score.
    pub fn passed_quiz(&self) -> bool {
        self.status == ProgressStatus::Completed
            && self.quiz_score.is_some_and(|s| s >= QUIZ_PASS_SCORE)
    }
}

/// Mission attempt state machine.
///
/// `locked → available → in_progress → submitted → ai_reviewed →
/// mentor_review → {approved | failed | revision_requested}`. The first
/// `start` call creates the attempt directly in `InProgress`; `Locked` and
/// `Available` gate the catalog surface before an attempt exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttemptStatus {
    /// Gated behind tier progression
    Locked,
    /// Open for starting
    Available,
    /// Attempt underway
    InProgress,
    /// Submitted, awaiting AI review
    Submitted,
    /// AI review applied, awaiting mentor
    AiReviewed,
    /// Claimed by a mentor
    MentorReview,
    /// Passed and mentor-approved
    Approved,
    /// Failed or expired
    Failed,
    /// Mentor sent the attempt back for revision
    RevisionRequested,
}

impl AttemptStatus {
    /// Whether the attempt is terminal for completion-rule purposes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptStatus::Approved | AttemptStatus::Failed)
    }

    /// Whether a mentor decision may be applied in this state.
    pub fn mentor_reviewable(&self) -> bool {
        matches!(
            self,
            AttemptStatus::Submitted | AttemptStatus::AiReviewed | AttemptStatus::MentorReview
        )
    }

    /// Operations legal in this state.
    pub fn allowed_operations(&self) -> Vec<&'static str> {
        match self {
            AttemptStatus::Locked => vec![],
            AttemptStatus::Available => vec!["start"],
            AttemptStatus::InProgress => vec![
                "complete_subtask",
                "record_decision",
                "log_hint",
                "log_tool",
                "submit",
                "expire",
            ],
            AttemptStatus::Submitted => {
                vec!["apply_ai_review", "apply_mentor_review", "request_revision"]
            }
            AttemptStatus::AiReviewed => {
                vec!["begin_mentor_review", "apply_mentor_review", "request_revision"]
            }
            AttemptStatus::MentorReview => vec!["apply_mentor_review", "request_revision"],
            AttemptStatus::RevisionRequested => vec!["resume"],
            AttemptStatus::Approved => vec![],
            AttemptStatus::Failed => vec!["start"],
        }
    }
}

/// Final pass/fail outcome of a mission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalStatus {
    /// Passed
    Pass,
    /// Failed
    Fail,
    /// Not yet decided
    Pending,
}

/// Per-subtask execution record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubtaskRecord {
    /// Whether the subtask is done
    pub completed: bool,

    /// Evidence reference (file, link) supplied by the learner
    pub evidence: Option<String>,

    /// Free-form notes
    pub notes: Option<String>,

    /// Completion timestamp
    pub completed_at: Option<Time>,
}

/// A recorded decision, last write wins per decision point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Chosen option
    pub choice: ChoiceId,

    /// When the choice was made
    pub decided_at: Time,
}

/// Feedback produced by the AI reviewer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiFeedback {
    /// What the submission did well
    pub strengths: Vec<String>,

    /// Gaps the reviewer found
    pub gaps: Vec<String>,

    /// Suggested next steps
    pub suggestions: Vec<String>,
}

/// Mentor review decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewDecision {
    /// Attempt passes
    Pass,
    /// Attempt fails
    Fail,
}

/// Mentor review submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MentorReview {
    /// Per-subtask scores, 0-100
    pub subtask_scores: BTreeMap<SubtaskId, f32>,

    /// Aggregate score supplied directly when no subtask scores are given
    pub overall_override: Option<f32>,

    /// Pass/fail decision
    pub decision: ReviewDecision,

    /// Follow-up content recommended to the learner
    pub recommended_recipes: Vec<String>,
}

impl MentorReview {
    /// A bare pass/fail decision with no scores.
    pub fn decision(decision: ReviewDecision) -> Self {
        Self {
            subtask_scores: BTreeMap::new(),
            overall_override: None,
            decision,
            recommended_recipes: Vec::new(),
        }
    }
}

/// Mission attempt execution state, `(user, mission)` unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionProgress {
    /// Learner
    pub user: UserId,

    /// Mission
    pub mission: MissionId,

    /// State machine position
    pub status: AttemptStatus,

    /// 1-indexed position in the subtask list
    pub current_subtask: u32,

    /// Per-subtask records keyed by subtask id
    pub subtasks: BTreeMap<SubtaskId, SubtaskRecord>,

    /// Recorded decisions keyed by decision id
    pub decisions: BTreeMap<DecisionId, DecisionRecord>,

    /// AI review score
    pub ai_score: Option<f32>,

    /// AI review feedback
    pub ai_feedback: Option<AiFeedback>,

    /// Mentor score
    pub mentor_score: Option<f32>,

    /// Mentor feedback, also set on revision requests
    pub mentor_feedback: Option<String>,

    /// Follow-up content the mentor recommended
    pub recommended_recipes: Vec<String>,

    /// Final outcome
    pub final_status: FinalStatus,

    /// Whether a reflection must accompany submission
    pub reflection_required: bool,

    /// Whether a reflection was submitted
    pub reflection_submitted: bool,

    /// Reflection text
    pub reflection: Option<String>,

    /// Hints consumed
    pub hints_used: u32,

    /// Seconds spent per subtask
    pub time_per_stage: BTreeMap<SubtaskId, i64>,

    /// Tools the learner reported using
    pub tools_used: Vec<String>,

    /// Highest subtask reached when the learner went inactive
    pub drop_off_stage: Option<u32>,

    /// Attempt start
    pub started_at: Time,

    /// Last learner interaction
    pub last_activity_at: Time,

    /// Deadline derived from the mission's time constraint
    pub deadline: Option<Time>,

    /// Submission timestamp
    pub submitted_at: Option<Time>,

    /// AI review timestamp
    pub ai_reviewed_at: Option<Time>,

    /// Mentor review timestamp
    pub mentor_reviewed_at: Option<Time>,

    /// When approved-completion side effects were recorded. Set at most
    /// once per attempt; guards portfolio/skill-signal emission.
    pub completion_recorded_at: Option<Time>,
}

impl MissionProgress {
    /// Fresh attempt for a mission, started now.
    pub fn start(user: UserId, mission: &Mission, now: Time) -> Self {
        let subtasks = mission
            .subtasks
            .iter()
            .map(|s| (s.id, SubtaskRecord::default()))
            .collect();

        let deadline = mission
            .time_constraint_hours
            .map(|h| now + chrono::Duration::hours(h as i64));

        Self {
            user,
            mission: mission.id,
            status: AttemptStatus::InProgress,
            current_subtask: 1,
            subtasks,
            decisions: BTreeMap::new(),
            ai_score: None,
            ai_feedback: None,
            mentor_score: None,
            mentor_feedback: None,
            recommended_recipes: Vec::new(),
            final_status: FinalStatus::Pending,
            reflection_required: mission.reflection_required,
            reflection_submitted: false,
            reflection: None,
            hints_used: 0,
            time_per_stage: BTreeMap::new(),
            tools_used: Vec::new(),
            drop_off_stage: None,
            started_at: now,
            last_activity_at: now,
            deadline,
            submitted_at: None,
            ai_reviewed_at: None,
            mentor_reviewed_at: None,
            completion_recorded_at: None,
        }
    }

    /// Whether the attempt's deadline has passed. Expiry is checked at
    /// read time; an expired attempt is never auto-failed.
    pub fn is_expired(&self, now: Time) -> bool {
        self.status == AttemptStatus::InProgress
            && self.deadline.is_some_and(|deadline| now > deadline)
    }

    /// Whether every subtask is completed.
    pub fn all_subtasks_completed(&self) -> bool {
        !self.subtasks.is_empty() && self.subtasks.values().all(|r| r.completed)
    }

    /// Whether the attempt counts as passed for completion rules.
    pub fn passed(&self) -> bool {
        self.final_status == FinalStatus::Pass
    }

    /// Whether the attempt is approved and passed.
    pub fn approved_and_passed(&self) -> bool {
        self.status == AttemptStatus::Approved && self.passed()
    }
}

/// Per-tier completion gate on a learner's track progress.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TierGate {
    /// Completion requirements met. Monotonic: once true, only an
    /// explicit administrative reset clears it.
    pub requirements_met: bool,

    /// Mentor signed off on this tier
    pub mentor_approved: bool,

    /// Tier is open to the learner
    pub unlocked: bool,
}

/// Per-user track progress, `(user, track)` unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTrackProgress {
    /// Learner
    pub user: UserId,

    /// Track
    pub track: TrackId,

    /// Required modules completed over total required, 0-100
    pub completion_percentage: f32,

    /// Required modules completed
    pub modules_completed: u32,

    /// Required lessons completed
    pub lessons_completed: u32,

    /// Required missions completed
    pub missions_completed: u32,

    /// Quizzes passed at 70% or better
    pub quizzes_passed: u32,

    /// Beginner-tier mini-missions completed
    pub mini_missions_completed: u32,

    /// Reflections submitted with mission work
    pub reflections_submitted: u32,

    /// Per-tier completion gates
    pub tiers: BTreeMap<Tier, TierGate>,

    /// Last mutation
    pub updated_at: Time,
}

impl UserTrackProgress {
    /// Fresh row for a first interaction. The beginner tier starts
    /// unlocked.
    pub fn new(user: UserId, track: TrackId) -> Self {
        let mut tiers = BTreeMap::new();
        tiers.insert(
            Tier::Beginner,
            TierGate {
                requirements_met: false,
                mentor_approved: false,
                unlocked: true,
            },
        );

        Self {
            user,
            track,
            completion_percentage: 0.0,
            modules_completed: 0,
            lessons_completed: 0,
            missions_completed: 0,
            quizzes_passed: 0,
            mini_missions_completed: 0,
            reflections_submitted: 0,
            tiers,
            updated_at: chrono::Utc::now(),
        }
    }

    /// Gate for a tier, defaulting to all-false when untouched.
    pub fn gate(&self, tier: Tier) -> TierGate {
        self.tiers.get(&tier).copied().unwrap_or_default()
    }

    /// Mutable gate for a tier, created on first touch.
    pub fn gate_mut(&mut self, tier: Tier) -> &mut TierGate {
        self.tiers.entry(tier).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MissionTier, SubtaskDef};
    use std::collections::BTreeSet;

    fn mission_with(subtask_ids: &[u32], time_constraint_hours: Option<u32>) -> Mission {
        Mission {
            id: MissionId::new(),
            title: "Triage an alert".to_string(),
            description: String::new(),
            difficulty: 2,
            tier: MissionTier::Beginner,
            program: None,
            skill_tags: vec![],
            active: true,
            time_constraint_hours,
            reflection_required: true,
            subtasks: subtask_ids
                .iter()
                .map(|id| SubtaskDef {
                    id: SubtaskId(*id),
                    title: format!("Step {}", id),
                    dependencies: BTreeSet::new(),
                })
                .collect(),
            decision_points: BTreeMap::new(),
        }
    }

    #[test]
    fn start_initializes_all_subtask_records() {
        let mission = mission_with(&[1, 2, 3], None);
        let progress = MissionProgress::start(UserId::new(), &mission, chrono::Utc::now());

        assert_eq!(progress.status, AttemptStatus::InProgress);
        assert_eq!(progress.current_subtask, 1);
        assert_eq!(progress.subtasks.len(), 3);
        assert!(progress.subtasks.values().all(|r| !r.completed));
        assert!(progress.deadline.is_none());
        assert!(progress.reflection_required);
    }

    #[test]
    fn start_derives_deadline_from_time_constraint() {
        let mission = mission_with(&[1], Some(48));
        let now = chrono::Utc::now();
        let progress = MissionProgress::start(UserId::new(), &mission, now);

        assert_eq!(progress.deadline, Some(now + chrono::Duration::hours(48)));
        assert!(!progress.is_expired(now));
        assert!(progress.is_expired(now + chrono::Duration::hours(49)));
    }

    #[test]
    fn expiry_only_applies_in_progress() {
        let mission = mission_with(&[1], Some(1));
        let now = chrono::Utc::now();
        let mut progress = MissionProgress::start(UserId::new(), &mission, now);
        progress.status = AttemptStatus::Submitted;

        assert!(!progress.is_expired(now + chrono::Duration::hours(2)));
    }

    #[test]
    fn attempt_status_terminality() {
        assert!(AttemptStatus::Approved.is_terminal());
        assert!(AttemptStatus::Failed.is_terminal());
        assert!(!AttemptStatus::RevisionRequested.is_terminal());
        assert!(!AttemptStatus::Submitted.is_terminal());
    }

    #[test]
    fn quiz_pass_requires_completion_and_score() {
        let mut row = UserLessonProgress::new(UserId::new(), LessonId::new());
        row.quiz_score = Some(85.0);
        assert!(!row.passed_quiz());

        row.status = ProgressStatus::Completed;
        assert!(row.passed_quiz());

        row.quiz_score = Some(60.0);
        assert!(!row.passed_quiz());
    }

    #[test]
    fn track_progress_starts_with_beginner_unlocked() {
        let row = UserTrackProgress::new(UserId::new(), TrackId::new());
        assert!(row.gate(Tier::Beginner).unlocked);
        assert!(!row.gate(Tier::Beginner).requirements_met);
        assert!(!row.gate(Tier::Intermediate).unlocked);
    }
}
