//! Continuation tracker — which frame is entered for each scope.
//!
//! The active set lives in a Tokio task-local. A future wrapped by
//! [`Activation::instrument`] re-establishes it on every poll, so everything
//! the future awaits observes the same frames. [`Activation::enter`] does the
//! same for a synchronous closure. Work moved to another task (`tokio::spawn`,
//! a channel consumer, a different thread) starts with an empty activation
//! unless it was bound first.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Once};

use tokio::runtime::Handle;
use tokio::task::futures::TaskLocalFuture;
use tracing::warn;

use crate::error::ContextError;
use crate::frame::Frame;
use crate::region::Region;
use crate::scope::ScopeId;

tokio::task_local! {
    static ACTIVE: Activation;
}

static RUNTIME_WARNING: Once = Once::new();

/// Snapshot of the entered frames (one per scope) and the current region.
///
/// Cheap to clone; entering a new frame copies the small map.
#[derive(Clone, Default)]
pub struct Activation {
    frames: Arc<HashMap<ScopeId, Arc<Frame>>>,
    region: Option<Region>,
}

impl Activation {
    /// The activation of the running continuation, or an empty one.
    pub fn current() -> Self {
        ACTIVE.try_with(Clone::clone).unwrap_or_default()
    }

    pub fn frame(&self, scope: ScopeId) -> Option<Arc<Frame>> {
        self.frames.get(&scope).cloned()
    }

    pub fn region(&self) -> Option<&Region> {
        self.region.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.region.is_none()
    }

    /// Same activation with `frame` entered for `scope`; other scopes keep
    /// whatever they had.
    pub fn with_frame(&self, scope: ScopeId, frame: Arc<Frame>) -> Self {
        let mut frames = (*self.frames).clone();
        frames.insert(scope, frame);
        Self {
            frames: Arc::new(frames),
            region: self.region.clone(),
        }
    }

    pub fn with_region(&self, region: Region) -> Self {
        Self {
            frames: self.frames.clone(),
            region: Some(region),
        }
    }

    /// Run `f` with this activation entered.
    pub fn enter<R>(self, f: impl FnOnce() -> R) -> R {
        ACTIVE.sync_scope(self, f)
    }

    /// Wrap `fut` so each poll runs with this activation entered.
    pub fn instrument<F: Future>(self, fut: F) -> TaskLocalFuture<Activation, F> {
        ACTIVE.scope(self, fut)
    }
}

impl std::fmt::Debug for Activation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Activation")
            .field("scopes", &self.frames.keys().collect::<Vec<_>>())
            .field("region", &self.region.as_ref().map(Region::id))
            .finish()
    }
}

/// Whether the caller runs inside any tracked continuation.
pub fn is_tracked() -> bool {
    ACTIVE.try_with(|active| !active.is_empty()).unwrap_or(false)
}

/// Handle of the Tokio runtime that tracked work is spawned onto.
///
/// Without a runtime nothing can be spawned with its context attached. The
/// capability warning is logged once per process; every call still errors.
pub fn runtime_handle() -> Result<Handle, ContextError> {
    Handle::try_current().map_err(|e| {
        RUNTIME_WARNING.call_once(|| {
            warn!(
                code = "CTX_NO_RUNTIME",
                "context propagation needs a Tokio runtime; tracked work cannot be spawned here"
            );
        });
        ContextError::UnsupportedEnvironment(e.to_string())
    })
}
