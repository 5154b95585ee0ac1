//! Subtask dependency resolution.
//!
//! The subtask graph is validated at catalog-load time; here it is only
//! resolved against a learner's attempt to decide what is unlockable.

use waypoint_core::{Mission, MissionProgress, SubtaskId};

use crate::runtime::MissionError;

/// Result of an unlock check for one subtask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockCheck {
    /// Whether every declared dependency is completed
    pub unlockable: bool,

    /// Every unmet dependency, not just the first, so the caller can
    /// display all blockers at once
    pub missing_dependencies: Vec<SubtaskId>,
}

/// Resolve a subtask's declared dependencies against an attempt.
///
/// A dependency is satisfied only when its own record is completed.
pub fn missing_dependencies(
    mission: &Mission,
    progress: &MissionProgress,
    subtask: SubtaskId,
) -> Result<UnlockCheck, MissionError> {
    let def = mission
        .subtask(subtask)
        .ok_or(MissionError::UnknownSubtask(subtask))?;

    let missing: Vec<SubtaskId> = def
        .dependencies
        .iter()
        .filter(|dep| {
            !progress
                .subtasks
                .get(dep)
                .is_some_and(|record| record.completed)
        })
        .copied()
        .collect();

    Ok(UnlockCheck {
        unlockable: missing.is_empty(),
        missing_dependencies: missing,
    })
}

/// Subtask ids in an order that satisfies every dependency.
///
/// Ties are broken by declaration order, so the result is stable for a
/// given catalog definition.
pub fn execution_order(mission: &Mission) -> Vec<SubtaskId> {
    let mut order = Vec::with_capacity(mission.subtasks.len());
    let mut done: std::collections::HashSet<SubtaskId> = std::collections::HashSet::new();

    while order.len() < mission.subtasks.len() {
        let mut advanced = false;
        for sub in &mission.subtasks {
            if !done.contains(&sub.id) && sub.dependencies.iter().all(|d| done.contains(d)) {
                done.insert(sub.id);
                order.push(sub.id);
                advanced = true;
            }
        }
        // Unsatisfiable graphs are rejected at catalog load; bail instead
        // of spinning if one slips through.
        if !advanced {
            break;
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use waypoint_core::{MissionId, MissionTier, SubtaskDef, UserId};

    fn mission(subtasks: &[(u32, &[u32])]) -> Mission {
        Mission {
            id: MissionId::new(),
            title: "Harden a host".to_string(),
            description: String::new(),
            difficulty: 3,
            tier: MissionTier::Intermediate,
            program: None,
            skill_tags: vec![],
            active: true,
            time_constraint_hours: None,
            reflection_required: false,
            subtasks: subtasks
                .iter()
                .map(|(id, deps)| SubtaskDef {
                    id: SubtaskId(*id),
                    title: format!("Step {}", id),
                    dependencies: deps.iter().map(|d| SubtaskId(*d)).collect::<BTreeSet<_>>(),
                })
                .collect(),
            decision_points: BTreeMap::new(),
        }
    }

    #[test]
    fn reports_all_missing_dependencies() {
        let mission = mission(&[(1, &[]), (2, &[]), (3, &[1, 2])]);
        let progress = MissionProgress::start(UserId::new(), &mission, chrono::Utc::now());

        let check = missing_dependencies(&mission, &progress, SubtaskId(3)).unwrap();
        assert!(!check.unlockable);
        assert_eq!(check.missing_dependencies, vec![SubtaskId(1), SubtaskId(2)]);
    }

    #[test]
    fn unlockable_once_dependencies_complete() {
        let mission = mission(&[(1, &[]), (2, &[1])]);
        let mut progress = MissionProgress::start(UserId::new(), &mission, chrono::Utc::now());

        let check = missing_dependencies(&mission, &progress, SubtaskId(2)).unwrap();
        assert_eq!(check.missing_dependencies, vec![SubtaskId(1)]);

        progress.subtasks.get_mut(&SubtaskId(1)).unwrap().completed = true;
        let check = missing_dependencies(&mission, &progress, SubtaskId(2)).unwrap();
        assert!(check.unlockable);
        assert!(check.missing_dependencies.is_empty());
    }

    #[test]
    fn unknown_subtask_is_rejected() {
        let mission = mission(&[(1, &[])]);
        let progress = MissionProgress::start(UserId::new(), &mission, chrono::Utc::now());

        assert!(matches!(
            missing_dependencies(&mission, &progress, SubtaskId(9)),
            Err(MissionError::UnknownSubtask(_))
        ));
    }

    #[test]
    fn execution_order_respects_dependencies() {
        let mission = mission(&[(3, &[1, 2]), (1, &[]), (2, &[1])]);
        let order = execution_order(&mission);
        assert_eq!(order, vec![SubtaskId(1), SubtaskId(2), SubtaskId(3)]);
    }
}
