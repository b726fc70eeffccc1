//! Isolated execution regions — fault containment bound to one frame.
//!
//! A region is created per `run_in_context` call. Its native primitive,
//! [`Region::contain`], only catches panics and records them as faults.
//! [`Region::bind_callback`] composes that primitive with re-entry of the
//! region's frame, so a callback bound through the region gets its context
//! back even when whatever eventually invokes it dropped the task-local.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

use crate::emitter::{Event, EventEmitter, Listener, ListenerWrapper};
use crate::error::ContextError;
use crate::frame::Frame;
use crate::scope::Scope;
use crate::tracker::{self, Activation};

/// Where a contained fault came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultSource {
    /// The entry function given to `run_in_context`.
    Entry,
    /// A callback bound through the region.
    Callback,
    /// A listener of an emitter added to the region.
    Listener { event: String },
    /// A future driven by the region.
    Task,
    /// An `"error"` event nobody listened to.
    UnhandledError { event: String },
}

/// A fault caught by a region.
#[derive(Debug, Clone)]
pub struct Fault {
    pub region: Uuid,
    pub source: FaultSource,
    pub message: String,
    pub at: DateTime<Utc>,
}

struct RegionInner {
    id: Uuid,
    scope: Scope,
    frame: Arc<Frame>,
    faults: Mutex<Vec<Fault>>,
}

/// Fault-containment boundary anchored to a scope frame.
#[derive(Clone)]
pub struct Region {
    inner: Arc<RegionInner>,
}

impl Region {
    pub(crate) fn new(scope: Scope, frame: Arc<Frame>) -> Self {
        let region = Self {
            inner: Arc::new(RegionInner {
                id: Uuid::new_v4(),
                scope,
                frame,
                faults: Mutex::new(Vec::new()),
            }),
        };
        debug!(region = %region.id(), frame = %region.frame().id(), "region created");
        region
    }

    /// The region the calling continuation runs in.
    pub fn current() -> Option<Region> {
        Activation::current().region().cloned()
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    pub fn frame(&self) -> &Arc<Frame> {
        &self.inner.frame
    }

    /// Current activation with this region and its frame entered.
    pub fn activation(&self) -> Activation {
        Activation::current()
            .with_frame(self.inner.scope.id(), self.inner.frame.clone())
            .with_region(self.clone())
    }

    /// Run `f` in the region with its frame entered.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> Result<R, ContextError> {
        self.catch(FaultSource::Callback, self.activation(), f)
    }

    /// Native binding: `f` runs with the region current and panics contained.
    /// The frame is not re-entered; see [`bind_callback`](Self::bind_callback).
    pub fn contain<F, R>(&self, f: F) -> impl FnOnce() -> Result<R, ContextError> + Send + use<F, R>
    where
        F: FnOnce() -> R + Send,
    {
        let region = self.clone();
        move || {
            let entered = Activation::current().with_region(region.clone());
            region.catch(FaultSource::Callback, entered, f)
        }
    }

    /// Bind `f` so invoking it re-enters this region's frame, then runs it
    /// under the region's containment.
    pub fn bind_callback<F, R>(&self, f: F) -> impl FnOnce() -> Result<R, ContextError> + Send + use<F, R>
    where
        F: FnOnce() -> R + Send,
    {
        self.contain(self.inner.scope.bind_to(self.inner.frame.clone(), f))
    }

    /// Pin `fut` to this region: polled with the frame entered, panics contained.
    pub fn bind_future<F: Future>(&self, fut: F) -> impl Future<Output = Result<F::Output, ContextError>> + use<F> {
        guarded(self.clone(), self.activation().instrument(fut))
    }

    /// Spawn `fut` on the current runtime, bound to this region.
    pub fn spawn<F>(&self, fut: F) -> Result<JoinHandle<Result<F::Output, ContextError>>, ContextError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = tracker::runtime_handle()?;
        Ok(handle.spawn(self.bind_future(fut)))
    }

    /// Route panics in the emitter's listeners, and its unhandled `"error"`
    /// events, to this region.
    pub fn add(&self, emitter: &EventEmitter) {
        debug!(region = %self.id(), emitter = %emitter.id(), "emitter added to region");
        emitter.add_wrapper(Arc::new(RegionMembership {
            region: self.clone(),
        }));
    }

    pub fn faults(&self) -> Vec<Fault> {
        self.inner.faults.lock().clone()
    }

    pub fn has_faulted(&self) -> bool {
        !self.inner.faults.lock().is_empty()
    }

    /// Record a fault and return the error describing it.
    pub fn report(&self, source: FaultSource, message: impl Into<String>) -> ContextError {
        let message = message.into();
        error!(region = %self.id(), ?source, "{message}");
        self.inner.faults.lock().push(Fault {
            region: self.id(),
            source,
            message: message.clone(),
            at: Utc::now(),
        });
        ContextError::Contained {
            region: self.id(),
            message,
        }
    }

    pub(crate) fn catch<R>(
        &self,
        source: FaultSource,
        activation: Activation,
        f: impl FnOnce() -> R,
    ) -> Result<R, ContextError> {
        activation
            .enter(|| panic::catch_unwind(AssertUnwindSafe(f)))
            .map_err(|payload| self.report(source, panic_message(payload.as_ref())))
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.inner.id)
            .field("scope", &self.inner.scope.name())
            .field("frame", &self.inner.frame.id())
            .field("faults", &self.inner.faults.lock().len())
            .finish()
    }
}

pub(crate) async fn guarded<F: Future>(region: Region, fut: F) -> Result<F::Output, ContextError> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|payload| region.report(FaultSource::Task, panic_message(payload.as_ref())))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

struct RegionMembership {
    region: Region,
}

impl ListenerWrapper for RegionMembership {
    fn wrap(&self, event: &str, listener: Listener) -> Listener {
        let region = self.region.clone();
        let event_name = event.to_string();
        Arc::new(move |fired: &Event| {
            let entered = Activation::current().with_region(region.clone());
            let source = FaultSource::Listener {
                event: event_name.clone(),
            };
            let _ = region.catch(source, entered, || listener(fired));
        })
    }

    fn on_unhandled_error(&self, event: &Event) -> bool {
        let message = match &event.payload {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        self.region.report(
            FaultSource::UnhandledError {
                event: event.name.clone(),
            },
            message,
        );
        true
    }
}
