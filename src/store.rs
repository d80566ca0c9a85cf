//! Durable, concurrency-safe storage for [`Workspace`] aggregates (§4.1).
//!
//! [`InMemoryWorkspaceStore`] is a plain cache for tests; [`FileWorkspaceStore`]
//! is the durable backend, one `<id>.json` file per workspace under a
//! configurable base directory, written atomically via write-temp-and-rename.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::models::Workspace;

#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    /// Persists the workspace and refreshes the cache.
    async fn save(&self, ws: &Workspace) -> Result<()>;

    /// Returns the cached or loaded workspace; `NotFound` if absent.
    async fn get(&self, id: Uuid) -> Result<Workspace>;

    /// Enumerates all persisted workspace ids.
    async fn list(&self) -> Result<Vec<Uuid>>;

    /// Removes from cache and disk; `NotFound` if absent.
    async fn delete(&self, id: Uuid) -> Result<()>;

    /// Loads and filters to `status == active`. Workspaces that fail to
    /// load are logged and skipped rather than aborting the whole call.
    async fn list_active(&self) -> Result<Vec<Workspace>> {
        let mut active = Vec::new();
        for id in self.list().await? {
            match self.get(id).await {
                Ok(ws) if ws.is_active() => active.push(ws),
                Ok(_) => {}
                Err(e) => warn!("skipping workspace {id} while listing active: {e}"),
            }
        }
        Ok(active)
    }
}

/// In-memory implementation: a single `RwLock`-guarded cache, no
/// durability. Used by tests and anywhere persistence is not wanted.
#[derive(Clone, Default)]
pub struct InMemoryWorkspaceStore {
    cache: Arc<RwLock<HashMap<Uuid, Workspace>>>,
}

impl InMemoryWorkspaceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkspaceStore for InMemoryWorkspaceStore {
    async fn save(&self, ws: &Workspace) -> Result<()> {
        self.cache.write().await.insert(ws.id, ws.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Workspace> {
        self.cache
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found(format!("workspace {id}")))
    }

    async fn list(&self) -> Result<Vec<Uuid>> {
        Ok(self.cache.read().await.keys().copied().collect())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.cache
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| OrchestratorError::not_found(format!("workspace {id}")))
    }
}

/// File-per-workspace durable backend (§6.1). A single cache lock guards
/// the in-memory view; §4.1 notes implementers SHOULD extend to
/// per-workspace locks when scaling, which is left as a follow-up since
/// this reference backend targets correctness over throughput.
pub struct FileWorkspaceStore {
    base_dir: PathBuf,
    cache: Arc<RwLock<HashMap<Uuid, Workspace>>>,
}

impl FileWorkspaceStore {
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).await?;
        Ok(Self {
            base_dir,
            cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.base_dir.join(format!("{id}.json"))
    }

    fn tmp_path_for(&self, id: Uuid) -> PathBuf {
        self.base_dir.join(format!("{id}.json.tmp"))
    }

    async fn load_from_disk(&self, id: Uuid) -> Result<Workspace> {
        let path = self.path_for(id);
        let bytes = fs::read(&path)
            .await
            .map_err(|_| OrchestratorError::not_found(format!("workspace {id}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| OrchestratorError::storage(format!("corrupt workspace file {}: {e}", path.display())))
    }
}

#[async_trait]
impl WorkspaceStore for FileWorkspaceStore {
    async fn save(&self, ws: &Workspace) -> Result<()> {
        let path = self.path_for(ws.id);
        let tmp_path = self.tmp_path_for(ws.id);
        let json = serde_json::to_vec_pretty(ws)?;
        fs::write(&tmp_path, &json)
            .await
            .map_err(|e| OrchestratorError::storage(e.to_string()))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| OrchestratorError::storage(e.to_string()))?;
        self.cache.write().await.insert(ws.id, ws.clone());
        debug!("saved workspace {}", ws.id);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Workspace> {
        if let Some(ws) = self.cache.read().await.get(&id).cloned() {
            return Ok(ws);
        }
        let ws = self.load_from_disk(id).await?;
        self.cache.write().await.insert(id, ws.clone());
        Ok(ws)
    }

    async fn list(&self) -> Result<Vec<Uuid>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir)
            .await
            .map_err(|e| OrchestratorError::storage(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| OrchestratorError::storage(e.to_string()))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(id) = Uuid::parse_str(stem) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let path = self.path_for(id);
        fs::remove_file(&path)
            .await
            .map_err(|_| OrchestratorError::not_found(format!("workspace {id}")))?;
        self.cache.write().await.remove(&id);
        info!("deleted workspace {id}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SYSTEM_AGENT;

    #[tokio::test]
    async fn in_memory_save_get_roundtrip() {
        let store = InMemoryWorkspaceStore::new();
        let ws = Workspace::new("demo", "desc", SYSTEM_AGENT);
        store.save(&ws).await.unwrap();
        let loaded = store.get(ws.id).await.unwrap();
        assert_eq!(loaded.id, ws.id);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = InMemoryWorkspaceStore::new();
        let err = store.get(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn file_store_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new("demo", "desc", SYSTEM_AGENT);

        {
            let store = FileWorkspaceStore::new(dir.path()).await.unwrap();
            store.save(&ws).await.unwrap();
        }

        let store = FileWorkspaceStore::new(dir.path()).await.unwrap();
        let loaded = store.get(ws.id).await.unwrap();
        assert_eq!(loaded.name, "demo");

        let ids = store.list().await.unwrap();
        assert_eq!(ids, vec![ws.id]);
    }

    #[tokio::test]
    async fn file_store_delete_then_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWorkspaceStore::new(dir.path()).await.unwrap();
        let ws = Workspace::new("demo", "desc", SYSTEM_AGENT);
        store.save(&ws).await.unwrap();

        store.delete(ws.id).await.unwrap();
        let err = store.delete(ws.id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_active_skips_non_active() {
        let store = InMemoryWorkspaceStore::new();
        let mut active_ws = Workspace::new("active", "d", SYSTEM_AGENT);
        let mut done_ws = Workspace::new("done", "d", SYSTEM_AGENT);
        done_ws.status = crate::models::WorkspaceStatus::Completed;
        active_ws.agents.push("agent-a".into());

        store.save(&active_ws).await.unwrap();
        store.save(&done_ws).await.unwrap();

        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, active_ws.id);
    }
}
