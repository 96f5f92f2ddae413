//! In-memory registries for configurations, runs, artifacts and restore operations.
//!
//! Every mutation of one entity happens under the map's write lock, so two
//! writers touching the same id are serialized. Readers take the read lock
//! just long enough to clone a snapshot.

pub mod artifacts;

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::models::Entity;

pub use artifacts::ArtifactStore;

pub trait Repository<T: Entity>: Send + Sync {
    fn get(&self, id: &str) -> Option<T>;

    fn list(&self) -> Vec<T>;

    /// Inserts or replaces the entity stored under its id.
    fn upsert(&self, entity: T);

    /// Applies `f` to the stored entity and returns the updated copy.
    fn update(&self, id: &str, f: &mut dyn FnMut(&mut T)) -> Option<T>;

    fn remove(&self, id: &str) -> Option<T>;
}

#[derive(Debug)]
pub struct MemoryRepository<T> {
    entries: RwLock<HashMap<String, T>>,
}

impl<T> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> MemoryRepository<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T: Entity> Repository<T> for MemoryRepository<T> {
    fn get(&self, id: &str) -> Option<T> {
        self.entries.read().get(id).cloned()
    }

    fn list(&self) -> Vec<T> {
        let mut items: Vec<T> = self.entries.read().values().cloned().collect();
        items.sort_by(|a, b| a.id().cmp(b.id()));
        items
    }

    fn upsert(&self, entity: T) {
        self.entries.write().insert(entity.id().to_string(), entity);
    }

    fn update(&self, id: &str, f: &mut dyn FnMut(&mut T)) -> Option<T> {
        let mut entries = self.entries.write();
        let entity = entries.get_mut(id)?;
        f(entity);
        Some(entity.clone())
    }

    fn remove(&self, id: &str) -> Option<T> {
        self.entries.write().remove(id)
    }
}
