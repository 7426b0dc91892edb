use std::{
    collections::HashMap,
    fs::File,
    io,
    path::PathBuf,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::plan::ResourceItem;
use super::registry::{ResourceType, SharedRegistry};

/// Local record of what previous runs created, keyed by resource id. Entries
/// carry their resource type so the registry can revive them as typed
/// resources on reload.
#[derive(Clone)]
pub struct StateStore {
    inner: HashMap<String, Vec<u8>>,
    storage: Arc<dyn Storage + Send + Sync>,
}

impl Default for StateStore {
    fn default() -> Self {
        StateStore::new(FileStorage::default())
    }
}

pub trait Storage {
    fn load(&self) -> Result<HashMap<String, Vec<u8>>, StateError>;
    fn save(&self, data: &HashMap<String, Vec<u8>>) -> Result<(), StateError>;
}

#[derive(Serialize, Deserialize)]
struct StateEntry {
    resource_type: ResourceType,
    resource: Value,
}

impl StateStore {
    pub fn new(storage: impl Storage + 'static + Send + Sync) -> Self {
        Self {
            inner: Default::default(),
            storage: Arc::new(storage),
        }
    }

    pub fn reload(&mut self) -> Result<(), StateError> {
        println!("--- Loading state from storage ---");
        let data = self.storage.load()?;
        for id in data.keys() {
            println!("Resource[{}] loaded from state", id);
        }
        self.inner = data;
        Ok(())
    }

    pub fn save(&self) -> Result<(), StateError> {
        println!("--- Saving state to storage ---");
        self.storage.save(&self.inner)
    }

    pub fn insert_resource(
        &mut self,
        registry: &SharedRegistry,
        resource: &dyn ResourceItem,
    ) -> Result<Option<Vec<u8>>, StateError> {
        let id = resource.id();
        let resource_type = resource.resource_type();
        let entry = StateEntry {
            resource: registry.serialize_resource(resource, &resource_type)?,
            resource_type,
        };
        let bytes = serde_json::to_vec(&entry)?;
        println!("Insert Resource[{}] into state", id);
        Ok(self.inner.insert(id, bytes))
    }

    pub fn get(
        &self,
        registry: &SharedRegistry,
        id: &str,
    ) -> Result<Option<Arc<dyn ResourceItem>>, StateError> {
        let bytes = match self.inner.get(id) {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let entry: StateEntry = serde_json::from_slice(bytes)?;
        let resource = registry.deserialize_resource(&entry.resource, &entry.resource_type)?;
        Ok(Some(resource))
    }

    pub fn remove(&mut self, id: &str) -> Option<Vec<u8>> {
        println!("Remove Resource[{}] from state", id);
        self.inner.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.contains_key(id)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }
}

#[derive(Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl Default for FileStorage {
    fn default() -> Self {
        Self::new("wafcloud.state")
    }
}

impl FileStorage {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        FileStorage { path: path.into() }
    }
}

impl Storage for FileStorage {
    fn load(&self) -> Result<HashMap<String, Vec<u8>>, StateError> {
        Ok(if self.path.exists() {
            let file = File::open(&self.path)?;
            bincode::deserialize_from(file)?
        } else {
            HashMap::new()
        })
    }

    fn save(&self, data: &HashMap<String, Vec<u8>>) -> Result<(), StateError> {
        let file = File::create(&self.path)?;
        bincode::serialize_into(file, data)?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("IO error: {0}")]
    IOError(#[from] io::Error),
    #[error("State file error: {0}")]
    BincodeError(#[from] bincode::Error),
    #[error("State entry error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    RegistryError(#[from] super::registry::RegistryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_storage_round_trips() {
        let path = std::env::temp_dir().join(format!("wafcloud-state-{}", std::process::id()));
        let storage = FileStorage::new(&path);
        let mut data = HashMap::new();
        data.insert("aws/us-east-1/IpSet/blocked".to_owned(), vec![1u8, 2, 3]);
        storage.save(&data).unwrap();
        let loaded = FileStorage::new(&path).load().unwrap();
        assert_eq!(loaded, data);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_state_file_loads_empty() {
        let storage = FileStorage::new("/nonexistent/wafcloud.state");
        assert!(storage.load().unwrap().is_empty());
    }
}
