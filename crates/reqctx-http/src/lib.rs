//! reqctx HTTP integration.
//!
//! The [`PerRequest`] layer gives each inbound request its own context frame
//! and keeps it entered for the whole handler chain, including work the
//! handlers await long after the layer returned control. [`ContextServer`]
//! hosts an axum router built on it.

pub mod per_request;
pub mod request_context;
pub mod server;

pub use per_request::{PerRequest, PerRequestOptions, PerRequestService};
pub use request_context::{HTTP_CONTEXT_KEY, HttpContext, RequestContext, RequestEvents, hostname_of};
pub use server::{ContextServer, ServerConfig, ServerError};
