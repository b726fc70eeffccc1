//! Process-wide context runtime, built once at startup.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ContextError;
use crate::registry::{ContextRegistry, DEFAULT_SCOPE_NAME};
use crate::shim::{CompatShim, DEFAULT_WARNING_RETENTION};

/// Context runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextConfig {
    /// Scope used when callers do not name one.
    pub default_scope: String,
    /// Install the compatibility shim at startup.
    pub compat_shim: bool,
    /// Libraries the shim reports when they register late.
    pub known_breaking_libraries: Vec<String>,
    /// How many shim warnings are kept for inspection.
    pub warning_retention: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_scope: DEFAULT_SCOPE_NAME.into(),
            compat_shim: false,
            known_breaking_libraries: Vec::new(),
            warning_retention: DEFAULT_WARNING_RETENTION,
        }
    }
}

impl ContextConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ContextError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Owns the registry and the shim for the lifetime of the process.
///
/// Cloned `Arc`s of its parts are handed to the HTTP layer and handlers;
/// nothing here is torn down.
#[derive(Debug, Clone)]
pub struct ContextRuntime {
    pub config: ContextConfig,
    pub registry: Arc<ContextRegistry>,
    pub shim: Arc<CompatShim>,
}

impl ContextRuntime {
    pub fn new(config: ContextConfig) -> Self {
        let registry = Arc::new(ContextRegistry::with_default_scope(config.default_scope.clone()));
        let shim = Arc::new(
            CompatShim::new(registry.clone(), config.known_breaking_libraries.iter().cloned())
                .with_retention(config.warning_retention),
        );
        if config.compat_shim {
            shim.install();
        }
        info!(
            "Context runtime ready (default scope: {}, shim: {})",
            config.default_scope,
            if config.compat_shim { "installed" } else { "off" },
        );
        Self {
            config,
            registry,
            shim,
        }
    }
}

impl Default for ContextRuntime {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}
