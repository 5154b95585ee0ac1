//! Waypoint CLI - walk a demo learner through the progression engine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;

use waypoint_core::{
    Choice, ChoiceId, Consequence, DecisionId, DecisionPoint, Lesson, LessonId, LessonKind,
    MentorReview, Mission, MissionId, MissionTier, Module, ModuleId, ModuleMission,
    ModuleMissionId, ProgramKey, ProgressionMode, ReviewDecision, SubtaskDef, SubtaskId, Tier,
    Track, TrackId, TrackRequirements, UserId,
};
use waypoint_mission::{execution_order, MissionRuntime};
use waypoint_review::{NoopCompletionHooks, ReviewCoordinator, StaticReviewer};
use waypoint_rollup::RollupService;
use waypoint_rules::TierEvaluator;
use waypoint_storage::{CatalogStore, MemoryStore, ProgressLedger};

#[derive(Parser)]
#[command(name = "waypoint")]
#[command(about = "Progression and mission-execution engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a demo learner through the seeded Defender track
    Demo {
        /// Quiz score the demo learner achieves
        #[arg(long, default_value = "82")]
        quiz_score: f32,
        /// Require mentor approval for the tier
        #[arg(long)]
        mentor_approval: bool,
    },
    /// Print the demo mission's subtask graph
    Graph,
}

/// Identifiers of the seeded demo catalog.
struct DemoCatalog {
    track_id: TrackId,
    video_id: LessonId,
    quiz_id: LessonId,
    mission_id: MissionId,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::WARN)
        .init();

    let cli = Cli::parse();
    let store = Arc::new(MemoryStore::new());
    let demo = seed_catalog(&store).await?;

    match cli.command {
        Commands::Demo {
            quiz_score,
            mentor_approval,
        } => run_demo(store, demo, quiz_score, mentor_approval).await?,
        Commands::Graph => print_graph(store, demo).await?,
    }

    Ok(())
}

async fn seed_catalog(store: &MemoryStore) -> Result<DemoCatalog> {
    let track = Track {
        id: TrackId::new(),
        name: "Defender".to_string(),
        program: ProgramKey::Defender,
        tier: Tier::Beginner,
        progression_mode: ProgressionMode::Flexible,
        requirements: TrackRequirements::default(),
        active: true,
    };
    store.insert_track(track.clone()).await?;

    let module = Module {
        id: ModuleId::new(),
        track_id: track.id,
        name: "Security foundations".to_string(),
        is_required: true,
        order_index: 0,
        active: true,
    };
    store.insert_module(module.clone()).await?;

    let video = Lesson {
        id: LessonId::new(),
        module_id: module.id,
        title: "What an analyst does".to_string(),
        kind: LessonKind::Video,
        is_required: true,
        active: true,
    };
    store.insert_lesson(video.clone()).await?;

    let quiz = Lesson {
        id: LessonId::new(),
        module_id: module.id,
        title: "Foundations quiz".to_string(),
        kind: LessonKind::Quiz,
        is_required: true,
        active: true,
    };
    store.insert_lesson(quiz.clone()).await?;

    let mut decision_points = BTreeMap::new();
    decision_points.insert(
        DecisionId::new("containment"),
        DecisionPoint {
            subtask: SubtaskId(2),
            prompt: "The host is beaconing. What do you do first?".to_string(),
            choices: vec![
                Choice {
                    id: ChoiceId::new("isolate"),
                    label: "Isolate the host from the network".to_string(),
                    consequence: Consequence {
                        description: "Beaconing stops; forensics continue offline".to_string(),
                        payload: serde_json::json!({"containment": "network-isolation"}),
                    },
                },
                Choice {
                    id: ChoiceId::new("observe"),
                    label: "Keep observing the traffic".to_string(),
                    consequence: Consequence {
                        description: "More IOCs collected, at the cost of dwell time".to_string(),
                        payload: serde_json::json!({"containment": "deferred"}),
                    },
                },
            ],
        },
    );

    let mission = Mission {
        id: MissionId::new(),
        title: "Contain a compromised workstation".to_string(),
        description: "Triage an alert, pick a containment strategy, write it up".to_string(),
        difficulty: 2,
        tier: MissionTier::Beginner,
        program: Some(ProgramKey::Defender),
        skill_tags: vec!["triage".to_string(), "containment".to_string()],
        active: true,
        time_constraint_hours: Some(72),
        reflection_required: true,
        subtasks: vec![
            SubtaskDef {
                id: SubtaskId(1),
                title: "Triage the alert".to_string(),
                dependencies: BTreeSet::new(),
            },
            SubtaskDef {
                id: SubtaskId(2),
                title: "Contain the host".to_string(),
                dependencies: [SubtaskId(1)].into_iter().collect(),
            },
            SubtaskDef {
                id: SubtaskId(3),
                title: "Write the incident summary".to_string(),
                dependencies: [SubtaskId(2)].into_iter().collect(),
            },
        ],
        decision_points,
    };
    store.insert_mission(mission.clone()).await?;

    store
        .insert_link(ModuleMission {
            id: ModuleMissionId::new(),
            module_id: module.id,
            mission_id: mission.id,
            is_required: true,
            recommended_order: 0,
        })
        .await?;

    Ok(DemoCatalog {
        track_id: track.id,
        video_id: video.id,
        quiz_id: quiz.id,
        mission_id: mission.id,
    })
}

async fn run_demo(
    store: Arc<MemoryStore>,
    demo: DemoCatalog,
    quiz_score: f32,
    mentor_approval: bool,
) -> Result<()> {
    let catalog: Arc<dyn CatalogStore> = store.clone();
    let ledger: Arc<dyn ProgressLedger> = store.clone();

    let runtime = Arc::new(MissionRuntime::new(catalog.clone(), ledger.clone()));
    let evaluator = Arc::new(TierEvaluator::new(catalog.clone(), ledger.clone()));
    let rollup = Arc::new(RollupService::new(
        catalog.clone(),
        ledger.clone(),
        evaluator.clone(),
    ));
    let coordinator = ReviewCoordinator::new(
        catalog.clone(),
        runtime.clone(),
        rollup.clone(),
        Arc::new(StaticReviewer::neutral()),
        Arc::new(NoopCompletionHooks),
    );

    let user = UserId::new();
    println!("Learner {} joins the Defender track\n", user);

    // Lessons
    rollup
        .record_lesson_progress(user, demo.video_id, 100.0, None)
        .await?;
    println!("Watched: What an analyst does");
    rollup
        .record_lesson_progress(user, demo.quiz_id, 100.0, Some(quiz_score))
        .await?;
    println!("Quiz: Foundations quiz scored {:.0}", quiz_score);

    // Mission
    let mission = catalog
        .mission(demo.mission_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("demo mission missing from catalog"))?;
    runtime.start(user, demo.mission_id).await?;
    println!("\nMission started: {}", mission.title);

    let check = runtime
        .check_subtask_unlockable(user, demo.mission_id, SubtaskId(2))
        .await?;
    println!(
        "  Subtask 2 unlockable: {} (missing: {:?})",
        check.unlockable, check.missing_dependencies
    );

    for (position, subtask_id) in execution_order(&mission).iter().enumerate() {
        let index = mission
            .subtasks
            .iter()
            .position(|s| s.id == *subtask_id)
            .ok_or_else(|| anyhow::anyhow!("subtask {} not declared", subtask_id))?
            as u32
            + 1;

        if *subtask_id == SubtaskId(2) {
            let consequence = runtime
                .record_decision(
                    user,
                    demo.mission_id,
                    DecisionId::new("containment"),
                    ChoiceId::new("isolate"),
                )
                .await?;
            println!("  Decision: isolate -> {}", consequence.description);
        }

        let outcome = runtime
            .complete_subtask(user, demo.mission_id, index, None)
            .await?;
        println!(
            "  Completed subtask {}/{}{}",
            position + 1,
            mission.subtasks.len(),
            if outcome.ready_to_submit {
                " (ready to submit)"
            } else {
                ""
            }
        );
    }

    coordinator
        .submit(
            user,
            demo.mission_id,
            Some("Isolating first kept the blast radius small.".to_string()),
        )
        .await?;
    let reviewed = coordinator.run_ai_review(user, demo.mission_id).await?;
    println!(
        "\nSubmitted; AI review score {:.0}",
        reviewed.ai_score.unwrap_or_default()
    );

    let review = MentorReview {
        subtask_scores: [
            (SubtaskId(1), 90.0),
            (SubtaskId(2), 85.0),
            (SubtaskId(3), 80.0),
        ]
        .into_iter()
        .collect(),
        overall_override: None,
        decision: ReviewDecision::Pass,
        recommended_recipes: vec![],
    };
    let approved = coordinator
        .finalize_mentor_review(user, demo.mission_id, review)
        .await?;
    println!(
        "Mentor review: pass, score {:.0}",
        approved.mentor_score.unwrap_or_default()
    );

    if mentor_approval {
        evaluator
            .record_mentor_approval(user, demo.track_id, Tier::Beginner)
            .await?;
        println!("Mentor signed off on the tier");
    }

    // Tier report
    let eval = evaluator
        .evaluate_tier(user, demo.track_id, Tier::Beginner, mentor_approval)
        .await?;
    println!("\nTier {} report", Tier::Beginner.ordinal());
    if eval.complete {
        println!("  Requirements met; next tier unlocked");
    } else {
        println!("  Still missing:");
        for item in &eval.missing {
            println!("    - {}", item);
        }
    }

    let row = ledger
        .load_track_progress(user, demo.track_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("track progress row missing after rollup"))?;
    println!(
        "  Track: {:.0}% | modules {} | lessons {} | missions {} | quizzes passed {}",
        row.record.completion_percentage,
        row.record.modules_completed,
        row.record.lessons_completed,
        row.record.missions_completed,
        row.record.quizzes_passed
    );

    println!("\nActivity events emitted:");
    for event in store.events().await {
        println!(
            "  {:?} (+{} points)",
            event.kind, event.points_awarded
        );
    }

    Ok(())
}

async fn print_graph(store: Arc<MemoryStore>, demo: DemoCatalog) -> Result<()> {
    let catalog: Arc<dyn CatalogStore> = store;
    let mission = catalog
        .mission(demo.mission_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("demo mission missing from catalog"))?;

    println!("{}", mission.title);
    for subtask in &mission.subtasks {
        let deps: Vec<String> = subtask
            .dependencies
            .iter()
            .map(|d| d.to_string())
            .collect();
        println!(
            "  [{}] {} {}",
            subtask.id,
            subtask.title,
            if deps.is_empty() {
                String::new()
            } else {
                format!("(after {})", deps.join(", "))
            }
        );
    }

    println!(
        "Execution order: {}",
        execution_order(&mission)
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(" -> ")
    );

    Ok(())
}
