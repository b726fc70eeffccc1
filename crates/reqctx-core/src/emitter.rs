//! Event sources that scopes and regions attach themselves to.
//!
//! An [`EventEmitter`] keeps named listener lists. Scopes and regions attach
//! through [`ListenerWrapper`]s: every listener registered after the wrapper
//! is installed gets decorated by it (scope re-entry, fault containment).

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error};
use uuid::Uuid;

/// Name of the event that carries failures.
pub const ERROR_EVENT: &str = "error";

/// A fired event.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub payload: Value,
}

pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Decorates listeners as they are registered on an emitter.
pub trait ListenerWrapper: Send + Sync {
    fn wrap(&self, event: &str, listener: Listener) -> Listener;

    /// Offered an `"error"` event nobody listens to. Return `true` if handled.
    fn on_unhandled_error(&self, _event: &Event) -> bool {
        false
    }
}

/// Identifies a registered listener for [`EventEmitter::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registered {
    id: ListenerId,
    listener: Listener,
    once: bool,
}

struct EmitterInner {
    id: Uuid,
    next_id: AtomicU64,
    listeners: RwLock<HashMap<String, Vec<Registered>>>,
    wrappers: RwLock<Vec<Arc<dyn ListenerWrapper>>>,
}

/// Cloneable handle to a shared listener table.
#[derive(Clone)]
pub struct EventEmitter {
    inner: Arc<EmitterInner>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                id: Uuid::new_v4(),
                next_id: AtomicU64::new(1),
                listeners: RwLock::new(HashMap::new()),
                wrappers: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Handle that does not keep the listener table alive.
    pub fn downgrade(&self) -> WeakEventEmitter {
        WeakEventEmitter {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(event, Arc::new(listener), false)
    }

    /// Like [`on`](Self::on), removed after the first delivery.
    pub fn once<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(event, Arc::new(listener), true)
    }

    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let Some(list) = listeners.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.id != id);
        before != list.len()
    }

    /// Fire `event`. Returns whether any listener received it.
    ///
    /// Listeners run outside the table lock and may register more listeners.
    pub fn emit(&self, event: &str, payload: Value) -> bool {
        let fired = Event {
            name: event.to_string(),
            payload,
        };

        let targets: Vec<Listener> = {
            let mut listeners = self.inner.listeners.write();
            match listeners.get_mut(event) {
                Some(list) if !list.is_empty() => {
                    let targets = list.iter().map(|r| r.listener.clone()).collect();
                    list.retain(|r| !r.once);
                    targets
                }
                _ => Vec::new(),
            }
        };

        if targets.is_empty() {
            if event == ERROR_EVENT {
                self.unhandled_error(&fired);
            }
            return false;
        }

        for listener in targets {
            listener(&fired);
        }
        true
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner
            .listeners
            .read()
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Install a wrapper for listeners registered from now on.
    pub fn add_wrapper(&self, wrapper: Arc<dyn ListenerWrapper>) {
        self.inner.wrappers.write().push(wrapper);
    }

    fn register(&self, event: &str, listener: Listener, once: bool) -> ListenerId {
        let wrappers: Vec<_> = self.inner.wrappers.read().clone();
        let listener = wrappers
            .iter()
            .fold(listener, |acc, wrapper| wrapper.wrap(event, acc));

        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .write()
            .entry(event.to_string())
            .or_default()
            .push(Registered { id, listener, once });
        debug!(emitter = %self.inner.id, event, "listener registered");
        id
    }

    fn unhandled_error(&self, event: &Event) {
        let wrappers: Vec<_> = self.inner.wrappers.read().clone();
        if wrappers.iter().any(|w| w.on_unhandled_error(event)) {
            return;
        }
        error!(emitter = %self.inner.id, payload = %event.payload, "unhandled error event");
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("id", &self.inner.id)
            .field("wrappers", &self.inner.wrappers.read().len())
            .finish()
    }
}

/// Non-owning [`EventEmitter`] handle.
///
/// Store this, not the emitter, in values that the emitter's own listeners
/// can reach (a frame the emitter is bound to), or neither is ever freed.
#[derive(Clone)]
pub struct WeakEventEmitter {
    inner: Weak<EmitterInner>,
}

impl WeakEventEmitter {
    pub fn upgrade(&self) -> Option<EventEmitter> {
        self.inner.upgrade().map(|inner| EventEmitter { inner })
    }
}

impl std::fmt::Debug for WeakEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakEventEmitter")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
