//! Context handles returned by the accessor.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use tokio::task::futures::TaskLocalFuture;

use crate::error::ContextError;
use crate::frame::Frame;
use crate::scope::Scope;
use crate::tracker::Activation;

/// A context handle pinned to the frame that was active when it was taken.
///
/// Reads, writes and binds keep targeting that frame no matter which frame is
/// active when they run. Use it across code that re-invokes callbacks from
/// its own task or thread and so drops the active context.
#[derive(Clone)]
pub struct BoundContext {
    scope: Scope,
    frame: Arc<Frame>,
}

impl BoundContext {
    /// Pin to a known frame of `scope`.
    pub fn new(scope: Scope, frame: Arc<Frame>) -> Self {
        debug_assert_eq!(frame.scope_id(), scope.id());
        Self { scope, frame }
    }

    /// Snapshot the scope's active frame, if any.
    pub fn snapshot(scope: &Scope) -> Option<Self> {
        scope.active().map(|frame| Self {
            scope: scope.clone(),
            frame,
        })
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn frame(&self) -> &Arc<Frame> {
        &self.frame
    }

    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Any + Send + Sync + Clone,
    {
        self.frame.get(key)
    }

    pub fn set<T>(&self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.frame.set(key, value);
    }

    pub fn bind<F, R>(&self, f: F) -> impl FnOnce() -> R + Send + use<F, R>
    where
        F: FnOnce() -> R + Send,
    {
        self.scope.bind_to(self.frame.clone(), f)
    }

    pub fn bind_future<F: Future>(&self, fut: F) -> TaskLocalFuture<Activation, F> {
        self.scope.instrument(self.frame.clone(), fut)
    }
}

impl std::fmt::Debug for BoundContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundContext")
            .field("scope", &self.scope.name())
            .field("frame", &self.frame.id())
            .finish()
    }
}

/// What [`get_current_context`](crate::ContextRegistry::get_current_context)
/// hands out: the live scope, or a snapshot pinned to its active frame.
#[derive(Debug, Clone)]
pub enum CurrentContext {
    Live(Scope),
    Bound(BoundContext),
}

impl CurrentContext {
    pub fn scope(&self) -> &Scope {
        match self {
            Self::Live(scope) => scope,
            Self::Bound(bound) => bound.scope(),
        }
    }

    /// Frame the handle resolves to right now.
    pub fn frame(&self) -> Option<Arc<Frame>> {
        match self {
            Self::Live(scope) => scope.active(),
            Self::Bound(bound) => Some(bound.frame().clone()),
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, Self::Bound(_))
    }

    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Any + Send + Sync + Clone,
    {
        match self {
            Self::Live(scope) => scope.get(key),
            Self::Bound(bound) => bound.get(key),
        }
    }

    pub fn set<T>(&self, key: impl Into<String>, value: T) -> Result<(), ContextError>
    where
        T: Any + Send + Sync,
    {
        match self {
            Self::Live(scope) => scope.set(key, value),
            Self::Bound(bound) => {
                bound.set(key, value);
                Ok(())
            }
        }
    }

    pub fn into_bound(self) -> Option<BoundContext> {
        match self {
            Self::Live(scope) => BoundContext::snapshot(&scope),
            Self::Bound(bound) => Some(bound),
        }
    }
}
