//! AI reviewer contract.
//!
//! The reviewer is an external collaborator; any failure is absorbed by a
//! deterministic fallback score so mission flow never stalls on AI
//! unavailability.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use waypoint_core::{AiFeedback, MissionId};

/// Neutral score substituted when the reviewer is unavailable.
pub const DEFAULT_AI_SCORE: f32 = 75.0;

/// An artifact attached to a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewArtifact {
    /// Artifact type, e.g. "evidence" or "report"
    pub kind: String,

    /// Where the artifact lives
    pub url: String,

    /// Original filename, when known
    pub filename: Option<String>,
}

/// Input handed to the AI reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiReviewRequest {
    /// Mission under review
    pub mission_id: MissionId,

    /// Mission title
    pub title: String,

    /// Mission description
    pub description: String,

    /// Skills the mission exercises
    pub skill_tags: Vec<String>,

    /// Learner's submission notes / reflection
    pub submission_notes: Option<String>,

    /// Attached artifacts
    pub artifacts: Vec<ReviewArtifact>,
}

/// A competency the reviewer detected in the submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompetencySignal {
    /// Competency name
    pub name: String,

    /// Observed level, e.g. "developing" or "proficient"
    pub level: String,
}

/// Output of an AI review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiReviewOutcome {
    /// Score 0-100
    pub score: f32,

    /// What the submission did well
    pub strengths: Vec<String>,

    /// Gaps found
    pub gaps: Vec<String>,

    /// Suggested next steps
    pub suggestions: Vec<String>,

    /// Competencies detected
    pub competencies: Vec<CompetencySignal>,
}

impl AiReviewOutcome {
    /// The ledger-shaped feedback slice of this outcome.
    pub fn feedback(&self) -> AiFeedback {
        AiFeedback {
            strengths: self.strengths.clone(),
            gaps: self.gaps.clone(),
            suggestions: self.suggestions.clone(),
        }
    }
}

/// Errors an AI reviewer can surface.
#[derive(Debug, thiserror::Error)]
pub enum ReviewerError {
    /// Provider unreachable or over capacity
    #[error("reviewer unavailable: {0}")]
    Unavailable(String),

    /// Response could not be interpreted
    #[error("malformed reviewer response: {0}")]
    Malformed(String),

    /// Review did not finish in time
    #[error("review timed out")]
    Timeout,
}

/// AI review port.
#[async_trait]
pub trait AiReviewer: Send + Sync {
    /// Review a submission.
    async fn review(&self, request: AiReviewRequest) -> Result<AiReviewOutcome, ReviewerError>;
}

/// The outcome substituted on any reviewer failure: a neutral score and a
/// single acknowledgment strength.
pub fn fallback_outcome() -> AiReviewOutcome {
    AiReviewOutcome {
        score: DEFAULT_AI_SCORE,
        strengths: vec!["Submission received".to_string()],
        gaps: Vec::new(),
        suggestions: Vec::new(),
        competencies: Vec::new(),
    }
}

/// Reviewer that always returns a fixed outcome. Useful for environments
/// without a live provider and for tests.
pub struct StaticReviewer {
    outcome: AiReviewOutcome,
}

impl StaticReviewer {
    /// Reviewer returning the given outcome for every request.
    pub fn new(outcome: AiReviewOutcome) -> Self {
        Self { outcome }
    }

    /// Reviewer returning the fallback outcome for every request.
    pub fn neutral() -> Self {
        Self::new(fallback_outcome())
    }
}

#[async_trait]
impl AiReviewer for StaticReviewer {
    async fn review(&self, _request: AiReviewRequest) -> Result<AiReviewOutcome, ReviewerError> {
        Ok(self.outcome.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_is_the_documented_neutral_outcome() {
        let outcome = fallback_outcome();
        assert_eq!(outcome.score, 75.0);
        assert_eq!(outcome.strengths, vec!["Submission received".to_string()]);
        assert!(outcome.gaps.is_empty());
        assert!(outcome.suggestions.is_empty());
    }
}
