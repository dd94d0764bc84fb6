use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use kube::Resource;

use crate::{Error, Lister, ResourceKey, Result};

/// In-memory lister for tests and dry runs.
pub struct MemoryLister<K> {
    items: RwLock<HashMap<ResourceKey, Arc<K>>>,
}

impl<K> Default for MemoryLister<K> {
    fn default() -> Self { Self { items: RwLock::new(HashMap::new()) } }
}

impl<K: Resource> MemoryLister<K> {
    pub fn new() -> Self { Self::default() }

    /// Insert or replace an object, returning its key.
    pub fn upsert(&self, obj: K) -> Result<ResourceKey> {
        let key = ResourceKey::for_resource(&obj)?;
        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        items.insert(key.clone(), Arc::new(obj));
        Ok(key)
    }

    pub fn remove(&self, key: &ResourceKey) -> Option<Arc<K>> {
        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        items.remove(key)
    }

    pub fn len(&self) -> usize {
        self.items.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl<K: Resource + Send + Sync> Lister<K> for MemoryLister<K> {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<K>>> {
        let key = ResourceKey::new(namespace, name)?;
        let items = self.items.read().map_err(|_| Error::Lookup("memory lister lock poisoned".to_string()))?;
        Ok(items.get(&key).cloned())
    }
}
