//! Frames — one context instance per `run` of a scope.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::scope::ScopeId;

type Slot = Arc<dyn Any + Send + Sync>;

/// Key/value store entered for the duration of one continuation chain.
///
/// A frame created while another frame of the same scope is active keeps it
/// as parent: reads fall through to the parent, writes stay local.
pub struct Frame {
    id: Uuid,
    scope: ScopeId,
    values: RwLock<HashMap<String, Slot>>,
    parent: Option<Arc<Frame>>,
}

impl Frame {
    pub(crate) fn new(scope: ScopeId, parent: Option<Arc<Frame>>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            scope,
            values: RwLock::new(HashMap::new()),
            parent,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn scope_id(&self) -> ScopeId {
        self.scope
    }

    pub fn parent(&self) -> Option<&Arc<Frame>> {
        self.parent.as_ref()
    }

    /// Clone of the value stored under `key`, if present and of type `T`.
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Any + Send + Sync + Clone,
    {
        self.get_arc::<T>(key).map(|value| (*value).clone())
    }

    /// Shared handle to the value stored under `key`, if present and of type `T`.
    pub fn get_arc<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.lookup(key)?.downcast::<T>().ok()
    }

    pub fn set<T>(&self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.values.write().insert(key.into(), Arc::new(value));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// Remove a value written to this frame. Inherited values stay visible.
    pub fn remove(&self, key: &str) -> bool {
        self.values.write().remove(key).is_some()
    }

    /// Keys written to this frame (inherited keys excluded), sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lookup(&self, key: &str) -> Option<Slot> {
        if let Some(value) = self.values.read().get(key) {
            return Some(value.clone());
        }
        self.parent.as_ref()?.lookup(key)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("keys", &self.keys())
            .field("parent", &self.parent.as_ref().map(|p| p.id))
            .finish()
    }
}
