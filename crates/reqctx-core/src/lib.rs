//! reqctx — request-scoped context that follows async continuations.
//!
//! A [`Scope`] is a named context container. Running work "in" a scope
//! opens a [`Frame`] (the actual key/value store) and keeps it entered for
//! everything that work awaits, the way thread-local storage follows
//! synchronous calls. Frames ride on Tokio task-locals, so a plain
//! `tokio::spawn` or a callback re-dispatched from another task loses them;
//! [`BoundContext`] and [`Region::bind_callback`] are the ways to carry a
//! frame across such a hop, and [`CompatShim`] reports where it happens.
//!
//! The [`ContextRegistry`] owns one scope per name and answers
//! [`get_current_context`](ContextRegistry::get_current_context).

pub mod config;
pub mod emitter;
pub mod error;
pub mod frame;
pub mod proxy;
pub mod region;
pub mod registry;
pub mod scope;
pub mod shim;
pub mod tracker;

pub use config::{ContextConfig, ContextRuntime};
pub use emitter::{Event, EventEmitter, Listener, ListenerId, ListenerWrapper, WeakEventEmitter};
pub use error::{ContextError, ContextErrorCode};
pub use frame::Frame;
pub use proxy::{BoundContext, CurrentContext};
pub use region::{Fault, FaultSource, Region};
pub use registry::{ContextOptions, ContextRegistry, DEFAULT_SCOPE_NAME};
pub use scope::{Scope, ScopeId};
pub use shim::{CompatShim, DEFAULT_WARNING_RETENTION, ShimWarning, ShimWarningCode};
pub use tracker::Activation;
