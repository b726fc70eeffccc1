//! ContextRegistry — one scope per name, plus the current-context accessor.

use std::future::Future;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::ContextError;
use crate::proxy::{BoundContext, CurrentContext};
use crate::region::{self, FaultSource, Region};
use crate::scope::Scope;

/// Scope name used when none is given.
pub const DEFAULT_SCOPE_NAME: &str = "loopback";

/// Options for [`ContextRegistry::get_current_context`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextOptions {
    /// Return a handle pinned to the active frame instead of the live scope.
    pub bind: bool,
}

impl ContextOptions {
    pub fn bound() -> Self {
        Self { bind: true }
    }
}

/// Accessor state. Nothing resolves until the first scope is created.
enum Accessor {
    Uninitialized,
    Resolving(Scope),
}

/// Maps scope names to their single live [`Scope`].
///
/// Scopes are created on first request and never removed or replaced. The
/// map is a `DashMap` so lookups of existing names never block. Inserting a
/// new name happens with the accessor's `parking_lot::RwLock` held for
/// writing, so the accessor always names the last scope inserted.
///
/// Lock order: accessor, then map shard. Nothing holds a shard while taking
/// the accessor.
pub struct ContextRegistry {
    scopes: DashMap<String, Scope>,
    accessor: RwLock<Accessor>,
    default_scope: String,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::with_default_scope(DEFAULT_SCOPE_NAME)
    }

    pub fn with_default_scope(name: impl Into<String>) -> Self {
        Self {
            scopes: DashMap::new(),
            accessor: RwLock::new(Accessor::Uninitialized),
            default_scope: name.into(),
        }
    }

    pub fn default_scope_name(&self) -> &str {
        &self.default_scope
    }

    /// Return the scope registered under `name`, creating it on first use.
    ///
    /// The first creation of a name points the accessor at that scope, so
    /// `get_current_context` follows the most recently created scope.
    pub fn create_context(&self, name: Option<&str>) -> Scope {
        let name = name.unwrap_or(&self.default_scope);

        if let Some(existing) = self.scopes.get(name) {
            return existing.clone();
        }

        let mut accessor = self.accessor.write();
        let mut created = false;
        let scope = self
            .scopes
            .entry(name.to_string())
            .or_insert_with(|| {
                created = true;
                Scope::new(name)
            })
            .clone();

        if created {
            *accessor = Accessor::Resolving(scope.clone());
            drop(accessor);
            info!("Context scope created: {name}");
        }

        scope
    }

    /// The context active on the calling continuation, if any.
    ///
    /// With `options.bind` the result is pinned to the frame active now.
    pub fn get_current_context(&self, options: ContextOptions) -> Option<CurrentContext> {
        let scope = self.latest_scope()?;
        if !scope.is_active() {
            return None;
        }
        if options.bind {
            BoundContext::snapshot(&scope).map(CurrentContext::Bound)
        } else {
            Some(CurrentContext::Live(scope))
        }
    }

    /// The scope the accessor resolves through: the last one created.
    pub fn latest_scope(&self) -> Option<Scope> {
        match &*self.accessor.read() {
            Accessor::Uninitialized => None,
            Accessor::Resolving(scope) => Some(scope.clone()),
        }
    }

    pub fn current_context(&self) -> Option<Scope> {
        match self.get_current_context(ContextOptions::default())? {
            CurrentContext::Live(scope) => Some(scope),
            CurrentContext::Bound(bound) => Some(bound.scope().clone()),
        }
    }

    pub fn bound_context(&self) -> Option<BoundContext> {
        self.get_current_context(ContextOptions::bound())?.into_bound()
    }

    /// Run `f` in a new region with a fresh frame of `scope` (the default
    /// scope when `None`) entered.
    ///
    /// `f` is called synchronously; the future it returns is polled with the
    /// same frame and region entered. A panic in either is recorded on the
    /// region and returned as [`ContextError::Contained`].
    pub fn run_in_context<F, Fut>(
        &self,
        f: F,
        scope: Option<&Scope>,
    ) -> impl Future<Output = Result<Fut::Output, ContextError>> + use<F, Fut>
    where
        F: FnOnce(Scope, Region) -> Fut,
        Fut: Future,
    {
        let (scope, region) = self.open_region(scope);
        let activation = region.activation();
        let started = region.catch(FaultSource::Entry, activation.clone(), || {
            f(scope, region.clone())
        });

        async move {
            let fut = started?;
            region::guarded(region, activation.instrument(fut)).await
        }
    }

    /// Synchronous form of [`run_in_context`](Self::run_in_context).
    pub fn run_in_context_sync<R>(
        &self,
        f: impl FnOnce(&Scope, &Region) -> R,
        scope: Option<&Scope>,
    ) -> Result<R, ContextError> {
        let (scope, region) = self.open_region(scope);
        region.catch(FaultSource::Entry, region.activation(), || f(&scope, &region))
    }

    pub fn scope(&self, name: &str) -> Option<Scope> {
        self.scopes.get(name).map(|entry| entry.clone())
    }

    pub fn scope_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scopes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn has_scopes(&self) -> bool {
        !self.scopes.is_empty()
    }

    // ── Internal ──────────────────────────────────────────────────────────

    fn open_region(&self, scope: Option<&Scope>) -> (Scope, Region) {
        let scope = match scope {
            Some(scope) => scope.clone(),
            None => self.create_context(None),
        };
        let frame = scope.create_frame();
        debug!(scope = scope.name(), frame = %frame.id(), "running in context");
        let region = Region::new(scope.clone(), frame);
        (scope, region)
    }
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextRegistry")
            .field("default_scope", &self.default_scope)
            .field("scopes", &self.scope_names())
            .finish()
    }
}
