//! Compatibility shim — reports where context propagation is about to break.
//!
//! The shim never changes values or control flow. When installed it watches
//! the entry points that lose task-locals (spawning a detached task, running a
//! callback handed over from elsewhere, registering a library known to
//! re-dispatch callbacks from its own task) and logs a warning with a stable
//! code. Uninstalled, the same entry points behave identically and stay quiet.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::ContextError;
use crate::registry::ContextRegistry;
use crate::tracker;

/// Stable warning codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShimWarningCode {
    /// A task was spawned from a tracked continuation without binding it.
    DetachedSpawn,
    /// A callback ran outside any tracked continuation.
    UntrackedCallback,
    /// A known-breaking library registered after scopes were created.
    LateLibraryLoad,
}

impl ShimWarningCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DetachedSpawn => "CTX_W001",
            Self::UntrackedCallback => "CTX_W002",
            Self::LateLibraryLoad => "CTX_W003",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShimWarning {
    pub code: ShimWarningCode,
    pub site: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Warnings kept for inspection when no retention is configured.
pub const DEFAULT_WARNING_RETENTION: usize = 256;

/// The most recent warnings plus a running count per code.
#[derive(Default)]
struct WarningLog {
    recent: VecDeque<ShimWarning>,
    counts: HashMap<ShimWarningCode, u64>,
}

pub struct CompatShim {
    installed: AtomicBool,
    registry: Arc<ContextRegistry>,
    known_breaking: HashSet<String>,
    retention: usize,
    log: Mutex<WarningLog>,
}

impl CompatShim {
    pub fn new<I, S>(registry: Arc<ContextRegistry>, known_breaking: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            installed: AtomicBool::new(false),
            registry,
            known_breaking: known_breaking.into_iter().map(Into::into).collect(),
            retention: DEFAULT_WARNING_RETENTION,
            log: Mutex::new(WarningLog::default()),
        }
    }

    /// Keep at most `retention` warnings; older ones are dropped, counts stay.
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    pub fn install(&self) {
        self.installed.store(true, Ordering::SeqCst);
    }

    pub fn uninstall(&self) {
        self.installed.store(false, Ordering::SeqCst);
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    /// `tokio::spawn` with a warning when called from a tracked continuation:
    /// the new task starts without the caller's context.
    pub fn spawn<F>(&self, site: &str, fut: F) -> Result<JoinHandle<F::Output>, ContextError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if tracker::is_tracked() {
            self.report(
                ShimWarningCode::DetachedSpawn,
                site,
                "task spawned from a tracked continuation will not inherit its context; bind it first",
            );
        }
        let handle = tracker::runtime_handle()?;
        Ok(handle.spawn(fut))
    }

    /// Warn if the caller runs outside any tracked continuation.
    pub fn observe_callback(&self, site: &str) {
        if !tracker::is_tracked() {
            self.report(
                ShimWarningCode::UntrackedCallback,
                site,
                "callback invoked outside a tracked continuation; context is not available",
            );
        }
    }

    /// Wrap `f` so its invocation is observed with [`observe_callback`](Self::observe_callback).
    pub fn wrap_callback<F, R>(self: &Arc<Self>, site: &str, f: F) -> impl FnOnce() -> R + Send + use<F, R>
    where
        F: FnOnce() -> R + Send,
    {
        let shim = self.clone();
        let site = site.to_string();
        move || {
            shim.observe_callback(&site);
            f()
        }
    }

    /// Record that a library registered itself with the host.
    pub fn library_loaded(&self, name: &str) {
        if self.known_breaking.contains(name) && self.registry.has_scopes() {
            self.report(
                ShimWarningCode::LateLibraryLoad,
                name,
                "library known to break context propagation registered after context tracking started",
            );
        }
    }

    /// Retained warnings, oldest first.
    pub fn warnings(&self) -> Vec<ShimWarning> {
        self.log.lock().recent.iter().cloned().collect()
    }

    /// Warnings reported with `code` since startup, retained or not.
    pub fn warning_count(&self, code: ShimWarningCode) -> u64 {
        self.log.lock().counts.get(&code).copied().unwrap_or(0)
    }

    pub fn total_warnings(&self) -> u64 {
        self.log.lock().counts.values().sum()
    }

    fn report(&self, code: ShimWarningCode, site: &str, message: &str) {
        if !self.is_installed() {
            return;
        }
        warn!(code = code.as_str(), site, "{message}");
        let mut log = self.log.lock();
        *log.counts.entry(code).or_insert(0) += 1;
        if self.retention == 0 {
            return;
        }
        while log.recent.len() >= self.retention {
            log.recent.pop_front();
        }
        log.recent.push_back(ShimWarning {
            code,
            site: site.to_string(),
            message: message.to_string(),
            at: Utc::now(),
        });
    }
}

impl std::fmt::Debug for CompatShim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompatShim")
            .field("installed", &self.is_installed())
            .field("known_breaking", &self.known_breaking)
            .field("retention", &self.retention)
            .field("warnings", &self.total_warnings())
            .finish()
    }
}
