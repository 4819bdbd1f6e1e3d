//! Persisted instance records.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{HubError, Result};
use crate::types::{Instance, InstancePatch};

/// Keyed CRUD over instance records.
///
/// `update` applies the patch inside the store's own critical section, so
/// concurrent read-modify-write sequences on one record never interleave.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Instance>>;
    async fn get(&self, id: &str) -> Result<Option<Instance>>;
    async fn create(&self, instance: Instance) -> Result<Instance>;
    async fn update(&self, id: &str, patch: InstancePatch) -> Result<Option<Instance>>;
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// Instances kept in one JSON array on disk.
///
/// The file is loaded lazily on first access and rewritten after every change.
/// One async mutex guards the cached map and the file write together.
pub struct FileInstanceStore {
    path: PathBuf,
    state: tokio::sync::Mutex<Option<BTreeMap<String, Instance>>>,
}

impl FileInstanceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, Instance>> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new())
            }
            Err(error) => return Err(error.into()),
        };
        if data.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        let instances: Vec<Instance> = serde_json::from_str(&data)?;
        Ok(instances
            .into_iter()
            .map(|instance| (instance.id.clone(), instance))
            .collect())
    }

    async fn save(&self, instances: &BTreeMap<String, Instance>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let records: Vec<&Instance> = instances.values().collect();
        let data = serde_json::to_string_pretty(&records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Run `op` against the loaded map while holding the store lock.
    async fn with_state<T>(
        &self,
        op: impl FnOnce(&mut BTreeMap<String, Instance>) -> (T, bool),
    ) -> Result<T> {
        let mut guard = self.state.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await?);
        }
        let instances = guard.get_or_insert_with(BTreeMap::new);
        let (value, dirty) = op(instances);
        if dirty {
            self.save(instances).await?;
        }
        Ok(value)
    }
}

#[async_trait]
impl InstanceStore for FileInstanceStore {
    async fn list(&self) -> Result<Vec<Instance>> {
        self.with_state(|instances| (sorted(instances.values()), false))
            .await
    }

    async fn get(&self, id: &str) -> Result<Option<Instance>> {
        self.with_state(|instances| (instances.get(id).cloned(), false))
            .await
    }

    async fn create(&self, instance: Instance) -> Result<Instance> {
        let id = instance.id.clone();
        let created = self
            .with_state(|instances| {
                if instances.contains_key(&id) {
                    return (None, false);
                }
                instances.insert(id.clone(), instance.clone());
                (Some(instance), true)
            })
            .await?;
        created.ok_or_else(|| HubError::InvalidState(format!("instance {id} already exists")))
    }

    async fn update(&self, id: &str, patch: InstancePatch) -> Result<Option<Instance>> {
        self.with_state(|instances| match instances.get_mut(id) {
            Some(instance) => {
                instance.apply(patch, Utc::now());
                (Some(instance.clone()), true)
            }
            None => (None, false),
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.with_state(|instances| {
            let removed = instances.remove(id).is_some();
            (removed, removed)
        })
        .await
    }
}

/// Thread-safe in-memory store for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryInstanceStore {
    state: Arc<RwLock<BTreeMap<String, Instance>>>,
}

impl MemoryInstanceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Instance>> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Instance>> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn list(&self) -> Result<Vec<Instance>> {
        Ok(sorted(self.read().values()))
    }

    async fn get(&self, id: &str) -> Result<Option<Instance>> {
        Ok(self.read().get(id).cloned())
    }

    async fn create(&self, instance: Instance) -> Result<Instance> {
        let mut state = self.write();
        if state.contains_key(&instance.id) {
            return Err(HubError::InvalidState(format!(
                "instance {} already exists",
                instance.id
            )));
        }
        state.insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn update(&self, id: &str, patch: InstancePatch) -> Result<Option<Instance>> {
        let mut state = self.write();
        Ok(state.get_mut(id).map(|instance| {
            instance.apply(patch, Utc::now());
            instance.clone()
        }))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.write().remove(id).is_some())
    }
}

/// Oldest first, ties broken by id.
fn sorted<'a>(instances: impl Iterator<Item = &'a Instance>) -> Vec<Instance> {
    let mut list: Vec<Instance> = instances.cloned().collect();
    list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    list
}
