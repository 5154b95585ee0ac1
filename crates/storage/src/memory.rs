//! In-memory storage backend.
//!
//! Backs both ports with `RwLock`-guarded maps. Catalog inserts run
//! structural validation; ledger saves are compare-and-swap on the row
//! version so concurrent writers retry instead of losing updates.

use std::collections::HashMap;
use std::hash::Hash;

use tokio::sync::RwLock;

use async_trait::async_trait;
use waypoint_core::{
    ActivityEvent, CatalogError, Lesson, LessonId, Mission, MissionId, MissionProgress,
    MissionTier, Module, ModuleId, ModuleMission, ModuleMissionId, Track, TrackId, UserId,
    UserLessonProgress, UserModuleProgress, UserTrackProgress,
};

use crate::trait_::{CatalogStore, ProgressLedger, Result, StorageError, Versioned};

#[derive(Default)]
struct CatalogState {
    tracks: HashMap<TrackId, Track>,
    modules: HashMap<ModuleId, Module>,
    lessons: HashMap<LessonId, Lesson>,
    missions: HashMap<MissionId, Mission>,
    links: HashMap<ModuleMissionId, ModuleMission>,
}

#[derive(Default)]
struct LedgerState {
    module_progress: HashMap<(UserId, ModuleId), (u64, UserModuleProgress)>,
    lesson_progress: HashMap<(UserId, LessonId), (u64, UserLessonProgress)>,
    attempts: HashMap<(UserId, MissionId), (u64, MissionProgress)>,
    track_progress: HashMap<(UserId, TrackId), (u64, UserTrackProgress)>,
    events: Vec<ActivityEvent>,
}

/// In-memory catalog + ledger backend.
#[derive(Default)]
pub struct MemoryStore {
    catalog: RwLock<CatalogState>,
    ledger: RwLock<LedgerState>,
}

/// Compare-and-swap a versioned row into a map.
fn cas_save<K, T>(
    map: &mut HashMap<K, (u64, T)>,
    key: K,
    key_name: String,
    row: Versioned<T>,
) -> Result<Versioned<T>>
where
    K: Eq + Hash,
    T: Clone,
{
    match map.get(&key) {
        None => {
            if row.version != 0 {
                tracing::debug!(key = %key_name, "insert raced an existing row");
                return Err(StorageError::Conflict { key: key_name });
            }
            map.insert(key, (1, row.record.clone()));
            Ok(Versioned {
                version: 1,
                record: row.record,
            })
        }
        Some((stored, _)) => {
            if row.version != *stored {
                tracing::debug!(key = %key_name, loaded = row.version, stored, "stale save rejected");
                return Err(StorageError::Conflict { key: key_name });
            }
            let next = stored + 1;
            map.insert(key, (next, row.record.clone()));
            Ok(Versioned {
                version: next,
                record: row.record,
            })
        }
    }
}

fn loaded<T: Clone>(entry: Option<&(u64, T)>) -> Option<Versioned<T>> {
    entry.map(|(version, record)| Versioned {
        version: *version,
        record: record.clone(),
    })
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    // === Catalog loading ===

    /// Insert a track definition.
    pub async fn insert_track(&self, track: Track) -> Result<()> {
        self.catalog.write().await.tracks.insert(track.id, track);
        Ok(())
    }

    /// Insert a module definition. The owning track must exist.
    pub async fn insert_module(&self, module: Module) -> Result<()> {
        let mut state = self.catalog.write().await;
        if !state.tracks.contains_key(&module.track_id) {
            return Err(CatalogError::UnknownReference(format!(
                "module {} references unknown track {}",
                module.id, module.track_id
            ))
            .into());
        }
        state.modules.insert(module.id, module);
        Ok(())
    }

    /// Insert a lesson definition. The owning module must exist.
    pub async fn insert_lesson(&self, lesson: Lesson) -> Result<()> {
        let mut state = self.catalog.write().await;
        if !state.modules.contains_key(&lesson.module_id) {
            return Err(CatalogError::UnknownReference(format!(
                "lesson {} references unknown module {}",
                lesson.id, lesson.module_id
            ))
            .into());
        }
        state.lessons.insert(lesson.id, lesson);
        Ok(())
    }

    /// Insert a mission definition. Subtask graph and decision branches
    /// are validated here, not at evaluation time.
    pub async fn insert_mission(&self, mission: Mission) -> Result<()> {
        mission.validate()?;
        self.catalog.write().await.missions.insert(mission.id, mission);
        Ok(())
    }

    /// Insert a module-mission link. Both sides must exist.
    pub async fn insert_link(&self, link: ModuleMission) -> Result<()> {
        let mut state = self.catalog.write().await;
        if !state.modules.contains_key(&link.module_id) {
            return Err(CatalogError::UnknownReference(format!(
                "link {} references unknown module {}",
                link.id, link.module_id
            ))
            .into());
        }
        if !state.missions.contains_key(&link.mission_id) {
            return Err(CatalogError::UnknownReference(format!(
                "link {} references unknown mission {}",
                link.id, link.mission_id
            ))
            .into());
        }
        state.links.insert(link.id, link);
        Ok(())
    }

    /// Drain all appended activity events, oldest first.
    pub async fn events(&self) -> Vec<ActivityEvent> {
        self.ledger.read().await.events.clone()
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn track(&self, id: TrackId) -> Result<Option<Track>> {
        Ok(self.catalog.read().await.tracks.get(&id).cloned())
    }

    async fn module(&self, id: ModuleId) -> Result<Option<Module>> {
        Ok(self.catalog.read().await.modules.get(&id).cloned())
    }

    async fn lesson(&self, id: LessonId) -> Result<Option<Lesson>> {
        Ok(self.catalog.read().await.lessons.get(&id).cloned())
    }

    async fn mission(&self, id: MissionId) -> Result<Option<Mission>> {
        Ok(self.catalog.read().await.missions.get(&id).cloned())
    }

    async fn link(&self, id: ModuleMissionId) -> Result<Option<ModuleMission>> {
        Ok(self.catalog.read().await.links.get(&id).cloned())
    }

    async fn modules_for_track(&self, track: TrackId) -> Result<Vec<Module>> {
        let state = self.catalog.read().await;
        let mut modules: Vec<Module> = state
            .modules
            .values()
            .filter(|m| m.track_id == track)
            .cloned()
            .collect();
        modules.sort_by_key(|m| (m.order_index, m.id));
        Ok(modules)
    }

    async fn lessons_for_module(&self, module: ModuleId) -> Result<Vec<Lesson>> {
        let state = self.catalog.read().await;
        let mut lessons: Vec<Lesson> = state
            .lessons
            .values()
            .filter(|l| l.module_id == module)
            .cloned()
            .collect();
        lessons.sort_by_key(|l| l.id);
        Ok(lessons)
    }

    async fn links_for_module(&self, module: ModuleId) -> Result<Vec<ModuleMission>> {
        let state = self.catalog.read().await;
        let mut links: Vec<ModuleMission> = state
            .links
            .values()
            .filter(|l| l.module_id == module)
            .cloned()
            .collect();
        links.sort_by_key(|l| (l.recommended_order, l.id));
        Ok(links)
    }

    async fn links_for_track(&self, track: TrackId) -> Result<Vec<ModuleMission>> {
        let state = self.catalog.read().await;
        let mut links: Vec<ModuleMission> = state
            .links
            .values()
            .filter(|l| {
                state
                    .modules
                    .get(&l.module_id)
                    .is_some_and(|m| m.track_id == track)
            })
            .cloned()
            .collect();
        links.sort_by_key(|l| (l.recommended_order, l.id));
        Ok(links)
    }

    async fn links_for_mission(&self, mission: MissionId) -> Result<Vec<ModuleMission>> {
        let state = self.catalog.read().await;
        let mut links: Vec<ModuleMission> = state
            .links
            .values()
            .filter(|l| l.mission_id == mission)
            .cloned()
            .collect();
        links.sort_by_key(|l| (l.recommended_order, l.id));
        Ok(links)
    }

    async fn missions_by_tier(&self, tier: MissionTier) -> Result<Vec<Mission>> {
        let state = self.catalog.read().await;
        let mut missions: Vec<Mission> = state
            .missions
            .values()
            .filter(|m| m.active && m.tier == tier)
            .cloned()
            .collect();
        missions.sort_by_key(|m| m.id);
        Ok(missions)
    }

    async fn tracks_for_mission(&self, mission: MissionId) -> Result<Vec<TrackId>> {
        let state = self.catalog.read().await;
        let mut tracks: Vec<TrackId> = state
            .links
            .values()
            .filter(|l| l.mission_id == mission)
            .filter_map(|l| state.modules.get(&l.module_id).map(|m| m.track_id))
            .collect();
        tracks.sort();
        tracks.dedup();
        Ok(tracks)
    }
}

#[async_trait]
impl ProgressLedger for MemoryStore {
    async fn load_module_progress(
        &self,
        user: UserId,
        module: ModuleId,
    ) -> Result<Option<Versioned<UserModuleProgress>>> {
        let state = self.ledger.read().await;
        Ok(loaded(state.module_progress.get(&(user, module))))
    }

    async fn save_module_progress(
        &self,
        row: Versioned<UserModuleProgress>,
    ) -> Result<Versioned<UserModuleProgress>> {
        let mut state = self.ledger.write().await;
        let key = (row.record.user, row.record.module);
        let key_name = format!("module-progress/{}/{}", key.0, key.1);
        cas_save(&mut state.module_progress, key, key_name, row)
    }

    async fn load_lesson_progress(
        &self,
        user: UserId,
        lesson: LessonId,
    ) -> Result<Option<Versioned<UserLessonProgress>>> {
        let state = self.ledger.read().await;
        Ok(loaded(state.lesson_progress.get(&(user, lesson))))
    }

    async fn save_lesson_progress(
        &self,
        row: Versioned<UserLessonProgress>,
    ) -> Result<Versioned<UserLessonProgress>> {
        let mut state = self.ledger.write().await;
        let key = (row.record.user, row.record.lesson);
        let key_name = format!("lesson-progress/{}/{}", key.0, key.1);
        cas_save(&mut state.lesson_progress, key, key_name, row)
    }

    async fn load_attempt(
        &self,
        user: UserId,
        mission: MissionId,
    ) -> Result<Option<Versioned<MissionProgress>>> {
        let state = self.ledger.read().await;
        Ok(loaded(state.attempts.get(&(user, mission))))
    }

    async fn save_attempt(
        &self,
        row: Versioned<MissionProgress>,
    ) -> Result<Versioned<MissionProgress>> {
        let mut state = self.ledger.write().await;
        let key = (row.record.user, row.record.mission);
        let key_name = format!("attempt/{}/{}", key.0, key.1);
        cas_save(&mut state.attempts, key, key_name, row)
    }

    async fn list_attempts(&self, user: UserId) -> Result<Vec<MissionProgress>> {
        let state = self.ledger.read().await;
        let mut attempts: Vec<MissionProgress> = state
            .attempts
            .iter()
            .filter(|((u, _), _)| *u == user)
            .map(|(_, (_, record))| record.clone())
            .collect();
        attempts.sort_by_key(|a| a.mission);
        Ok(attempts)
    }

    async fn load_track_progress(
        &self,
        user: UserId,
        track: TrackId,
    ) -> Result<Option<Versioned<UserTrackProgress>>> {
        let state = self.ledger.read().await;
        Ok(loaded(state.track_progress.get(&(user, track))))
    }

    async fn save_track_progress(
        &self,
        row: Versioned<UserTrackProgress>,
    ) -> Result<Versioned<UserTrackProgress>> {
        let mut state = self.ledger.write().await;
        let key = (row.record.user, row.record.track);
        let key_name = format!("track-progress/{}/{}", key.0, key.1);
        cas_save(&mut state.track_progress, key, key_name, row)
    }

    async fn append_event(&self, event: &ActivityEvent) -> Result<()> {
        self.ledger.write().await.events.push(event.clone());
        Ok(())
    }
}
