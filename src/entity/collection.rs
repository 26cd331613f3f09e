use super::Entity;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Shared entity store keyed by entity id
///
/// Entities are created lazily and live as long as the collection.
#[derive(Debug, Default)]
pub struct EntityCollection {
    /// Lock-free concurrent map for fast reads
    entities: DashMap<String, Arc<Entity>>,
}

impl EntityCollection {
    pub fn new() -> Self {
        Self {
            entities: DashMap::new(),
        }
    }

    /// Get entity by ID
    pub fn get_by_id(&self, id: &str) -> Option<Arc<Entity>> {
        self.entities.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Get entity by ID, inserting an empty placeholder if it does not exist
    pub fn get_or_create_entity(&self, id: &str) -> Arc<Entity> {
        let entry = self.entities.entry(id.to_string()).or_insert_with(|| {
            debug!(entity_id = %id, "Creating placeholder entity");
            Arc::new(Entity::new(id))
        });
        Arc::clone(entry.value())
    }

    /// Insert an entity built elsewhere.
    ///
    /// Returns false (and leaves the collection untouched) if an entity with
    /// the same id is already present.
    pub fn add(&self, entity: Arc<Entity>) -> bool {
        match self.entities.entry(entity.id().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entity);
                true
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.entities.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
