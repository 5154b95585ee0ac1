//! Catalog models - read-mostly definitions of tracks, modules, lessons
//! and missions.
//!
//! Catalog data is authored ahead of time and treated as immutable during
//! progression evaluation. Structural validation (subtask dependency
//! graphs, decision branches) happens here at load time, never at
//! evaluation time.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::id::{
    ChoiceId, DecisionId, LessonId, MissionId, ModuleId, ModuleMissionId, RubricId, SubtaskId,
    TrackId,
};

/// Progression tier within a track.
///
/// Tiers are ordinal: a learner moves Beginner → Intermediate → Advanced →
/// Mastery, unlocking each tier by completing the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Tier 2
    Beginner,
    /// Tier 3
    Intermediate,
    /// Tier 4
    Advanced,
    /// Tier 5
    Mastery,
}

impl Tier {
    /// Ordinal number of this tier (2-5).
    pub fn ordinal(&self) -> u8 {
        match self {
            Tier::Beginner => 2,
            Tier::Intermediate => 3,
            Tier::Advanced => 4,
            Tier::Mastery => 5,
        }
    }

    /// Tier from its ordinal number.
    pub fn from_ordinal(n: u8) -> Option<Self> {
        match n {
            2 => Some(Tier::Beginner),
            3 => Some(Tier::Intermediate),
            4 => Some(Tier::Advanced),
            5 => Some(Tier::Mastery),
            _ => None,
        }
    }

    /// The tier after this one, if any.
    pub fn next(&self) -> Option<Tier> {
        Self::from_ordinal(self.ordinal() + 1)
    }

    /// The tier before this one, if any.
    pub fn prev(&self) -> Option<Tier> {
        Self::from_ordinal(self.ordinal() - 1)
    }

    /// All tiers in ascending order.
    pub fn all() -> [Tier; 4] {
        [Tier::Beginner, Tier::Intermediate, Tier::Advanced, Tier::Mastery]
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Tier::Beginner => "beginner",
            Tier::Intermediate => "intermediate",
            Tier::Advanced => "advanced",
            Tier::Mastery => "mastery",
        };
        write!(f, "{}", name)
    }
}

/// Canonical program key for a track.
///
/// Populated at catalog-authoring time. Evaluation never infers program
/// identity from track names or code substrings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgramKey {
    /// Defensive security program
    Defender,
    /// Offensive security program
    Offensive,
    /// Engineering/builder program
    Builder,
    /// Analysis program
    Analyst,
    /// Cross-program content
    General,
}

/// How modules within a track are consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressionMode {
    /// Modules must be completed in order
    Sequential,
    /// Modules may be completed in any order
    Flexible,
}

/// Per-track completion requirements, fixed at authoring time.
///
/// Configuration changes only affect future evaluations; flags already
/// persisted on a learner's track progress are never recomputed backwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackRequirements {
    /// Mini-missions required to finish the beginner tier (1 or 2)
    pub min_mini_missions_required: u8,

    /// Tiers that additionally require explicit mentor approval
    pub mentor_approval_tiers: BTreeSet<Tier>,

    /// Scoring rubric applied to mastery-tier missions, when declared
    pub mastery_rubric: Option<RubricId>,
}

impl TrackRequirements {
    /// Whether the given tier requires mentor approval.
    pub fn mentor_approval_required(&self, tier: Tier) -> bool {
        self.mentor_approval_tiers.contains(&tier)
    }
}

impl Default for TrackRequirements {
    fn default() -> Self {
        Self {
            min_mini_missions_required: 1,
            mentor_approval_tiers: BTreeSet::new(),
            mastery_rubric: None,
        }
    }
}

/// A named learning pathway containing modules across tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    /// Unique identifier
    pub id: TrackId,

    /// Track name
    pub name: String,

    /// Canonical program key
    pub program: ProgramKey,

    /// Tier this track sits at. Immutable once created.
    pub tier: Tier,

    /// How modules are consumed
    pub progression_mode: ProgressionMode,

    /// Completion requirements
    pub requirements: TrackRequirements,

    /// Whether the track is open for enrollment
    pub active: bool,
}

/// A content container within a track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    /// Unique identifier
    pub id: ModuleId,

    /// Owning track
    pub track_id: TrackId,

    /// Module name
    pub name: String,

    /// Whether the module counts toward tier completion
    pub is_required: bool,

    /// Position within the track
    pub order_index: u32,

    /// Whether the module is live
    pub active: bool,
}

/// Lesson content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LessonKind {
    /// Video lesson
    Video,
    /// Scored quiz
    Quiz,
    /// Written guide
    Guide,
    /// Hands-on lab
    Lab,
    /// Reading assignment
    Reading,
}

/// A single lesson within a module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    /// Unique identifier
    pub id: LessonId,

    /// Owning module
    pub module_id: ModuleId,

    /// Lesson title
    pub title: String,

    /// Content type
    pub kind: LessonKind,

    /// Whether the lesson counts toward module completion
    pub is_required: bool,

    /// Whether the lesson is live
    pub active: bool,
}

/// Mission tier classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MissionTier {
    /// Mini-mission counted toward the beginner tier
    Beginner,
    /// Intermediate mission
    Intermediate,
    /// Advanced mission
    Advanced,
    /// Mastery mission
    Mastery,
    /// Terminal mastery project requiring explicit approval
    Capstone,
}

impl MissionTier {
    /// Whether this mission counts toward the given track tier.
    pub fn counts_toward(&self, tier: Tier) -> bool {
        match tier {
            Tier::Beginner => matches!(self, MissionTier::Beginner),
            Tier::Intermediate => matches!(self, MissionTier::Intermediate),
            Tier::Advanced => matches!(self, MissionTier::Advanced),
            // Capstones are mastery-tier work.
            Tier::Mastery => matches!(self, MissionTier::Mastery | MissionTier::Capstone),
        }
    }
}

/// An atomic unit of a mission, optionally dependent on other subtasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskDef {
    /// Identifier within the mission
    pub id: SubtaskId,

    /// Subtask title
    pub title: String,

    /// Subtasks that must be completed before this one unlocks
    pub dependencies: BTreeSet<SubtaskId>,
}

/// Consequence payload declared for a decision choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consequence {
    /// What happens as a result of this choice
    pub description: String,

    /// Structured payload forwarded to the caller
    pub payload: serde_json::Value,
}

/// A declared choice at a decision point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    /// Choice identifier
    pub id: ChoiceId,

    /// Label shown to the learner
    pub label: String,

    /// Declared consequence
    pub consequence: Consequence,
}

/// A branching choice within a mission, anchored to a subtask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionPoint {
    /// Subtask this decision is presented at
    pub subtask: SubtaskId,

    /// Question posed to the learner
    pub prompt: String,

    /// Declared choices
    pub choices: Vec<Choice>,
}

impl DecisionPoint {
    /// Look up a declared choice.
    pub fn choice(&self, id: &ChoiceId) -> Option<&Choice> {
        self.choices.iter().find(|c| &c.id == id)
    }
}

/// A practical assessment unit with ordered subtasks and optional
/// decision points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    /// Unique identifier
    pub id: MissionId,

    /// Mission title
    pub title: String,

    /// Description shown to learners and reviewers
    pub description: String,

    /// Difficulty 1-5
    pub difficulty: u8,

    /// Tier classification
    pub tier: MissionTier,

    /// Program this mission belongs to, if program-scoped
    pub program: Option<ProgramKey>,

    /// Skills exercised, used by the AI reviewer
    pub skill_tags: Vec<String>,

    /// Whether the mission is live
    pub active: bool,

    /// Time allowed for an attempt, when constrained
    pub time_constraint_hours: Option<u32>,

    /// Whether a written reflection is required on submission
    pub reflection_required: bool,

    /// Ordered subtasks
    pub subtasks: Vec<SubtaskDef>,

    /// Decision points keyed by decision identifier
    pub decision_points: BTreeMap<DecisionId, DecisionPoint>,
}

impl Mission {
    /// Whether this mission is the terminal mastery project.
    pub fn is_capstone(&self) -> bool {
        self.tier == MissionTier::Capstone
    }

    /// Look up a subtask definition by id.
    pub fn subtask(&self, id: SubtaskId) -> Option<&SubtaskDef> {
        self.subtasks.iter().find(|s| s.id == id)
    }

    /// Validate the subtask graph and decision branches.
    ///
    /// Rejects duplicate subtask ids, dangling dependency references,
    /// dependency cycles, decisions anchored to unknown subtasks, and
    /// duplicate choice ids. Called when the mission is loaded into a
    /// catalog store.
    pub fn validate(&self) -> Result<(), CatalogError> {
        let mut ids = HashSet::new();
        for sub in &self.subtasks {
            if !ids.insert(sub.id) {
                return Err(CatalogError::DuplicateSubtask {
                    mission: self.id,
                    subtask: sub.id,
                });
            }
        }

        for sub in &self.subtasks {
            for dep in &sub.dependencies {
                if !ids.contains(dep) {
                    return Err(CatalogError::UnknownDependency {
                        mission: self.id,
                        subtask: sub.id,
                        dependency: *dep,
                    });
                }
            }
        }

        if let Some(cycle) = self.find_cycle() {
            return Err(CatalogError::DependencyCycle {
                mission: self.id,
                cycle,
            });
        }

        for (decision_id, decision) in &self.decision_points {
            if !ids.contains(&decision.subtask) {
                return Err(CatalogError::UnknownDecisionSubtask {
                    mission: self.id,
                    decision: decision_id.clone(),
                    subtask: decision.subtask,
                });
            }

            let mut choice_ids = HashSet::new();
            for choice in &decision.choices {
                if !choice_ids.insert(&choice.id) {
                    return Err(CatalogError::DuplicateChoice {
                        mission: self.id,
                        decision: decision_id.clone(),
                        choice: choice.id.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Find a dependency cycle using DFS, if one exists.
    fn find_cycle(&self) -> Option<Vec<SubtaskId>> {
        let mut visited: HashSet<SubtaskId> = HashSet::new();
        let mut stack: HashSet<SubtaskId> = HashSet::new();

        for sub in &self.subtasks {
            if !visited.contains(&sub.id) {
                if let Some(cycle) =
                    self.cycle_from(sub.id, &mut visited, &mut stack, &mut Vec::new())
                {
                    return Some(cycle);
                }
            }
        }

        None
    }

    fn cycle_from(
        &self,
        node: SubtaskId,
        visited: &mut HashSet<SubtaskId>,
        stack: &mut HashSet<SubtaskId>,
        path: &mut Vec<SubtaskId>,
    ) -> Option<Vec<SubtaskId>> {
        visited.insert(node);
        stack.insert(node);
        path.push(node);

        if let Some(sub) = self.subtask(node) {
            for dep in &sub.dependencies {
                if !visited.contains(dep) {
                    if let Some(cycle) = self.cycle_from(*dep, visited, stack, path) {
                        return Some(cycle);
                    }
                } else if stack.contains(dep) {
                    let start = path.iter().position(|id| id == dep).unwrap_or(0);
                    return Some(path[start..].to_vec());
                }
            }
        }

        path.pop();
        stack.remove(&node);
        None
    }
}

/// Link associating a mission to a module.
///
/// Many missions per module; a mission may appear under multiple modules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleMission {
    /// Unique identifier
    pub id: ModuleMissionId,

    /// Module side of the link
    pub module_id: ModuleId,

    /// Mission side of the link
    pub mission_id: MissionId,

    /// Whether the mission counts toward tier completion
    pub is_required: bool,

    /// Suggested position within the module
    pub recommended_order: u32,
}

/// Errors raised while loading catalog definitions.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Two subtasks declared with the same id
    #[error("mission {mission}: duplicate subtask id {subtask}")]
    DuplicateSubtask {
        /// Offending mission
        mission: MissionId,
        /// Duplicated id
        subtask: SubtaskId,
    },

    /// A dependency references a subtask that does not exist
    #[error("mission {mission}: subtask {subtask} depends on unknown subtask {dependency}")]
    UnknownDependency {
        /// Offending mission
        mission: MissionId,
        /// Subtask declaring the dependency
        subtask: SubtaskId,
        /// Missing dependency id
        dependency: SubtaskId,
    },

    /// The dependency graph contains a cycle
    #[error("mission {mission}: subtask dependency cycle {cycle:?}")]
    DependencyCycle {
        /// Offending mission
        mission: MissionId,
        /// One cycle found in the graph
        cycle: Vec<SubtaskId>,
    },

    /// A decision point is anchored to a subtask that does not exist
    #[error("mission {mission}: decision {decision} anchored to unknown subtask {subtask}")]
    UnknownDecisionSubtask {
        /// Offending mission
        mission: MissionId,
        /// Offending decision
        decision: DecisionId,
        /// Missing subtask id
        subtask: SubtaskId,
    },

    /// Two choices declared with the same id at one decision point
    #[error("mission {mission}: decision {decision} declares duplicate choice {choice}")]
    DuplicateChoice {
        /// Offending mission
        mission: MissionId,
        /// Offending decision
        decision: DecisionId,
        /// Duplicated choice id
        choice: ChoiceId,
    },

    /// A catalog record references an entity that does not exist
    #[error("unknown reference: {0}")]
    UnknownReference(String),
}
