//! One-time completion side effects behind a capability port.
//!
//! Portfolio, skill-signal and dashboard collaborators are external;
//! environments without them inject the no-op implementation instead of
//! skipping silently.

use async_trait::async_trait;
use tracing::debug;
use waypoint_core::{Mission, MissionProgress, UserId};

/// External side effects fired when an attempt first becomes approved.
#[async_trait]
pub trait CompletionHooks: Send + Sync {
    /// Create or update the learner's portfolio artifact.
    async fn portfolio_entry(&self, user: UserId, mission: &Mission, progress: &MissionProgress);

    /// Emit a skill-signal record for detected competencies.
    async fn skill_signal(&self, user: UserId, mission: &Mission, progress: &MissionProgress);

    /// Invalidate downstream dashboard caches.
    async fn invalidate_dashboards(&self, user: UserId);
}

/// No-op hooks for environments without the external collaborators.
pub struct NoopCompletionHooks;

#[async_trait]
impl CompletionHooks for NoopCompletionHooks {
    async fn portfolio_entry(&self, user: UserId, mission: &Mission, _progress: &MissionProgress) {
        debug!(%user, mission = %mission.id, "portfolio hook disabled");
    }

    async fn skill_signal(&self, user: UserId, mission: &Mission, _progress: &MissionProgress) {
        debug!(%user, mission = %mission.id, "skill-signal hook disabled");
    }

    async fn invalidate_dashboards(&self, user: UserId) {
        debug!(%user, "dashboard invalidation hook disabled");
    }
}
