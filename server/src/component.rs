//! Per-session entity component storage and subscriptions.

use crate::id::IdAllocator;
use parking_lot::RwLock;
use skein_shared::EntityComponent;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ComponentError {
    #[error("entity component type is not registered")]
    TypeNotRegistered,
    #[error("entity component is already added")]
    AlreadyExists,
    #[error("entity component has not been added")]
    NotFound,
}

/// Stores typed components per entity together with a subscription registry.
///
/// Registration, mutation and listing take the data lock; subscriptions live
/// under a second lock so `notify` can run while the data map is mutated.
/// Lock order inside this store is data before subscriptions.
#[derive(Default)]
pub struct EntityComponentStore {
    ids: IdAllocator,
    data: RwLock<Data>,
    subscriptions: RwLock<HashMap<u32, HashSet<u32>>>,
}

#[derive(Default)]
struct Data {
    // type id -> name, and the reverse.
    name_index: HashMap<u32, String>,
    id_index: HashMap<String, u32>,
    // type id -> entity id -> component.
    components: HashMap<u32, HashMap<u32, EntityComponent>>,
}

impl EntityComponentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a component type, idempotent on the name.
    pub fn register_type(&self, name: &str) -> u32 {
        let mut data = self.data.write();
        if let Some(&id) = data.id_index.get(name) {
            return id;
        }
        let id = self.ids.next();
        data.name_index.insert(id, name.to_string());
        data.id_index.insert(name.to_string(), id);
        id
    }

    pub fn type_name(&self, component_type_id: u32) -> Result<String, ComponentError> {
        self.data
            .read()
            .name_index
            .get(&component_type_id)
            .cloned()
            .ok_or(ComponentError::TypeNotRegistered)
    }

    pub fn type_id(&self, name: &str) -> Result<u32, ComponentError> {
        self.data
            .read()
            .id_index
            .get(name)
            .copied()
            .ok_or(ComponentError::TypeNotRegistered)
    }

    pub fn add(&self, component: EntityComponent) -> Result<(), ComponentError> {
        let mut data = self.data.write();
        if !data.name_index.contains_key(&component.component_type_id) {
            return Err(ComponentError::TypeNotRegistered);
        }

        let per_type = data
            .components
            .entry(component.component_type_id)
            .or_default();
        if per_type.contains_key(&component.entity_id) {
            return Err(ComponentError::AlreadyExists);
        }
        per_type.insert(component.entity_id, component);
        Ok(())
    }

    pub fn update(&self, component: EntityComponent) -> Result<(), ComponentError> {
        let mut data = self.data.write();
        let per_type = data
            .components
            .get_mut(&component.component_type_id)
            .ok_or(ComponentError::NotFound)?;
        if !per_type.contains_key(&component.entity_id) {
            return Err(ComponentError::NotFound);
        }
        per_type.insert(component.entity_id, component);
        Ok(())
    }

    /// Removes the component for `(component_type_id, entity_id)`. Returns
    /// whether anything was removed.
    pub fn delete(&self, component_type_id: u32, entity_id: u32) -> bool {
        let mut data = self.data.write();
        match data.components.get_mut(&component_type_id) {
            Some(per_type) => per_type.remove(&entity_id).is_some(),
            None => false,
        }
    }

    /// Removes the entity's components across every registered type.
    pub fn delete_by_entity(&self, entity_id: u32) {
        let mut data = self.data.write();
        for per_type in data.components.values_mut() {
            per_type.remove(&entity_id);
        }
    }

    pub fn list(&self, component_type_id: u32) -> Vec<EntityComponent> {
        self.data
            .read()
            .components
            .get(&component_type_id)
            .map(|per_type| per_type.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn list_by_entity(&self, entity_id: u32) -> Vec<EntityComponent> {
        self.data
            .read()
            .components
            .values()
            .filter_map(|per_type| per_type.get(&entity_id).cloned())
            .collect()
    }

    pub fn list_all(&self) -> Vec<EntityComponent> {
        self.data
            .read()
            .components
            .values()
            .flat_map(|per_type| per_type.values().cloned())
            .collect()
    }

    pub fn subscribe(&self, component_type_id: u32, participant_id: u32) -> Result<(), ComponentError> {
        let data = self.data.read();
        if !data.name_index.contains_key(&component_type_id) {
            return Err(ComponentError::TypeNotRegistered);
        }

        self.subscriptions
            .write()
            .entry(component_type_id)
            .or_default()
            .insert(participant_id);
        Ok(())
    }

    /// Idempotent: unsubscribing a participant that never subscribed is a
    /// no-op.
    pub fn unsubscribe(&self, component_type_id: u32, participant_id: u32) {
        if let Some(subscribers) = self.subscriptions.write().get_mut(&component_type_id) {
            subscribers.remove(&participant_id);
        }
    }

    pub fn unsubscribe_all(&self, participant_id: u32) {
        for subscribers in self.subscriptions.write().values_mut() {
            subscribers.remove(&participant_id);
        }
    }

    /// Invokes `handler` with the current subscriber set for the type. The
    /// handler is not called when nobody is subscribed.
    pub fn notify<F>(&self, component_type_id: u32, handler: F)
    where
        F: FnOnce(&[u32]),
    {
        let subscriptions = self.subscriptions.read();
        let Some(subscribers) = subscriptions.get(&component_type_id) else {
            return;
        };
        if subscribers.is_empty() {
            return;
        }

        let participant_ids: Vec<u32> = subscribers.iter().copied().collect();
        handler(&participant_ids);
    }
}
