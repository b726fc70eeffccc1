//! Named context scopes.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use tokio::task::futures::TaskLocalFuture;
use tracing::debug;
use uuid::Uuid;

use crate::emitter::{Event, EventEmitter, Listener, ListenerWrapper};
use crate::error::ContextError;
use crate::frame::Frame;
use crate::tracker::Activation;

/// Identity of a scope. Two handles are the same scope iff their ids match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(Uuid);

struct ScopeInner {
    id: ScopeId,
    name: String,
}

/// A named, process-lifetime context container.
///
/// The scope itself holds no values: reads and writes go to the frame that is
/// active for this scope on the calling continuation. `run` opens a fresh
/// frame, `bind*` pin work to the frame active at bind time.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                id: ScopeId(Uuid::new_v4()),
                name: name.to_string(),
            }),
        }
    }

    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether both handles refer to the same registry entry.
    pub fn ptr_eq(&self, other: &Scope) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Frame of this scope entered on the calling continuation.
    pub fn active(&self) -> Option<Arc<Frame>> {
        Activation::current().frame(self.id())
    }

    pub fn is_active(&self) -> bool {
        self.active().is_some()
    }

    /// New frame whose parent is the currently active one, if any.
    pub fn create_frame(&self) -> Arc<Frame> {
        Frame::new(self.id(), self.active())
    }

    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Any + Send + Sync + Clone,
    {
        self.active()?.get(key)
    }

    pub fn set<T>(&self, key: impl Into<String>, value: T) -> Result<(), ContextError>
    where
        T: Any + Send + Sync,
    {
        let frame = self
            .active()
            .ok_or_else(|| ContextError::no_active(self.name()))?;
        frame.set(key, value);
        Ok(())
    }

    /// Run `f` inside a fresh frame.
    pub fn run<R>(&self, f: impl FnOnce(&Arc<Frame>) -> R) -> R {
        let frame = self.create_frame();
        debug!(scope = self.name(), frame = %frame.id(), "entering new frame");
        self.enter(frame.clone(), || f(&frame))
    }

    /// Drive `fut` inside a fresh frame, created now.
    pub fn run_future<F: Future>(&self, fut: F) -> TaskLocalFuture<Activation, F> {
        let frame = self.create_frame();
        debug!(scope = self.name(), frame = %frame.id(), "instrumenting future with new frame");
        self.instrument(frame, fut)
    }

    /// Run `f` with `frame` entered for this scope.
    pub fn enter<R>(&self, frame: Arc<Frame>, f: impl FnOnce() -> R) -> R {
        Activation::current().with_frame(self.id(), frame).enter(f)
    }

    /// Wrap `fut` so it polls with `frame` entered for this scope.
    pub fn instrument<F: Future>(&self, frame: Arc<Frame>, fut: F) -> TaskLocalFuture<Activation, F> {
        Activation::current().with_frame(self.id(), frame).instrument(fut)
    }

    /// Pin `f` to the active frame (or a fresh one when none is active).
    pub fn bind<F, R>(&self, f: F) -> impl FnOnce() -> R + Send + use<F, R>
    where
        F: FnOnce() -> R + Send,
    {
        self.bind_to(self.bind_target(), f)
    }

    /// Pin `f` to `frame`: calling the result re-enters it.
    pub fn bind_to<F, R>(&self, frame: Arc<Frame>, f: F) -> impl FnOnce() -> R + Send + use<F, R>
    where
        F: FnOnce() -> R + Send,
    {
        let scope = self.clone();
        move || scope.enter(frame, f)
    }

    /// Pin a future to the active frame so it keeps it wherever it is polled,
    /// including after a `tokio::spawn`.
    pub fn bind_future<F: Future>(&self, fut: F) -> TaskLocalFuture<Activation, F> {
        self.instrument(self.bind_target(), fut)
    }

    /// Pin a listener to `frame`.
    pub fn bind_listener(&self, frame: Arc<Frame>, listener: Listener) -> Listener {
        let scope = self.clone();
        Arc::new(move |event: &Event| scope.enter(frame.clone(), || listener(event)))
    }

    /// Attach an emitter: listeners registered from now on re-enter the frame
    /// that was active when they were registered, falling back to the frame
    /// active at attach time.
    pub fn bind_emitter(&self, emitter: &EventEmitter) {
        debug!(scope = self.name(), emitter = %emitter.id(), "binding emitter");
        emitter.add_wrapper(Arc::new(ScopeBinding {
            scope: self.clone(),
            fallback: self.active(),
        }));
    }

    fn bind_target(&self) -> Arc<Frame> {
        self.active().unwrap_or_else(|| self.create_frame())
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

struct ScopeBinding {
    scope: Scope,
    fallback: Option<Arc<Frame>>,
}

impl ListenerWrapper for ScopeBinding {
    fn wrap(&self, _event: &str, listener: Listener) -> Listener {
        match self.scope.active().or_else(|| self.fallback.clone()) {
            Some(frame) => self.scope.bind_listener(frame, listener),
            None => listener,
        }
    }
}
