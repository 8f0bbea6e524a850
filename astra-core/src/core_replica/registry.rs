/*
    registry.rs - Capability registry

    Features are registered by name and reach replicated state only
    through a `StoreHandle`, which can read and mutate documents and
    nothing else. Features can be switched on and off at runtime;
    `[features]` in the config decides the initial state.
*/

use super::coordinator::ReplicaCoordinator;
use super::ReplicaError;
use crate::config::FeatureConfig;
use crate::core_store::model::{DocumentValue, EntityId, Mutation, Operation, Value};
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Read/mutate view of a replica handed to features
#[derive(Clone)]
pub struct StoreHandle {
    coordinator: ReplicaCoordinator,
}

impl StoreHandle {
    pub(crate) fn new(coordinator: ReplicaCoordinator) -> Self {
        StoreHandle { coordinator }
    }

    pub fn read(&self, entity_id: &EntityId) -> Result<Option<DocumentValue>, ReplicaError> {
        self.coordinator.read(entity_id)
    }

    pub fn mutate(
        &self,
        entity_id: &EntityId,
        field_path: &str,
        mutation: Mutation,
    ) -> Result<Operation, ReplicaError> {
        self.coordinator.mutate(entity_id, field_path, mutation)
    }
}

/// A pluggable feature
pub trait FeatureHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Handle one request and return a JSON reply
    fn handle(
        &self,
        store: &StoreHandle,
        request: &serde_json::Value,
    ) -> Result<serde_json::Value, ReplicaError>;
}

pub struct CapabilityRegistry {
    store: StoreHandle,
    defaults: FeatureConfig,
    handlers: RwLock<BTreeMap<String, Arc<dyn FeatureHandler>>>,
    enabled: RwLock<BTreeSet<String>>,
}

fn poisoned() -> ReplicaError {
    ReplicaError::Store(crate::core_store::StoreError::Storage("registry lock poisoned".to_string()))
}

impl CapabilityRegistry {
    pub fn new(store: StoreHandle, defaults: FeatureConfig) -> Self {
        CapabilityRegistry {
            store,
            defaults,
            handlers: RwLock::new(BTreeMap::new()),
            enabled: RwLock::new(BTreeSet::new()),
        }
    }

    /// Register a handler, enabled unless the config switches it off
    pub fn register(&self, handler: Arc<dyn FeatureHandler>) -> Result<(), ReplicaError> {
        let name = handler.name().to_string();
        let enabled = self.defaults.is_enabled(&name);
        self.handlers.write().map_err(|_| poisoned())?.insert(name.clone(), handler);
        if enabled {
            self.enabled.write().map_err(|_| poisoned())?.insert(name.clone());
        }
        debug!(feature = %name, enabled, "feature registered");
        Ok(())
    }

    pub fn enable(&self, name: &str) -> Result<(), ReplicaError> {
        if !self.handlers.read().map_err(|_| poisoned())?.contains_key(name) {
            return Err(ReplicaError::FeatureNotFound(name.to_string()));
        }
        if self.enabled.write().map_err(|_| poisoned())?.insert(name.to_string()) {
            info!(feature = name, "feature enabled");
        }
        Ok(())
    }

    pub fn disable(&self, name: &str) -> Result<(), ReplicaError> {
        if self.enabled.write().map_err(|_| poisoned())?.remove(name) {
            info!(feature = name, "feature disabled");
        }
        Ok(())
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.read().map(|enabled| enabled.contains(name)).unwrap_or(false)
    }

    pub fn features(&self) -> Vec<(String, bool)> {
        let Ok(handlers) = self.handlers.read() else {
            return Vec::new();
        };
        handlers.keys().map(|name| (name.clone(), self.is_enabled(name))).collect()
    }

    /// Route a request to an enabled feature
    pub fn invoke(&self, name: &str, request: &serde_json::Value) -> Result<serde_json::Value, ReplicaError> {
        let handler = self
            .handlers
            .read()
            .map_err(|_| poisoned())?
            .get(name)
            .cloned()
            .ok_or_else(|| ReplicaError::FeatureNotFound(name.to_string()))?;
        if !self.is_enabled(name) {
            return Err(ReplicaError::FeatureDisabled(name.to_string()));
        }
        handler.handle(&self.store, request)
    }
}

/// Adds and removes tags on a set-valued field.
///
/// Request: `{"entity": "task1", "action": "add", "tag": "urgent"}`,
/// optionally with `"field"` (defaults to `tags`).
pub struct TagsFeature;

impl TagsFeature {
    pub const NAME: &'static str = "tags";
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum TagAction {
    Add,
    Remove,
}

#[derive(Deserialize)]
struct TagRequest {
    entity: String,
    action: TagAction,
    tag: String,
    #[serde(default = "default_tag_field")]
    field: String,
}

fn default_tag_field() -> String {
    "tags".to_string()
}

impl FeatureHandler for TagsFeature {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn handle(
        &self,
        store: &StoreHandle,
        request: &serde_json::Value,
    ) -> Result<serde_json::Value, ReplicaError> {
        let request: TagRequest = serde_json::from_value(request.clone())
            .map_err(|e| ReplicaError::Serialization(format!("bad tags request: {}", e)))?;
        let entity_id = EntityId::new(request.entity);
        let tag = Value::text(request.tag);
        let mutation = match request.action {
            TagAction::Add => Mutation::AddElement(tag),
            TagAction::Remove => Mutation::RemoveElement(tag),
        };
        let op = store.mutate(&entity_id, &request.field, mutation)?;

        let tags: Vec<serde_json::Value> = store
            .read(&entity_id)?
            .map(|doc| doc.elements(&request.field).iter().map(Value::to_json).collect())
            .unwrap_or_default();
        Ok(json!({ "operation": op.id().to_string(), "tags": tags }))
    }
}
