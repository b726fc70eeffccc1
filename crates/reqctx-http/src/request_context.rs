//! Request context — the per-request context entry carried by the request.
//!
//! The [`PerRequest`](crate::PerRequest) layer stores a [`RequestContext`]
//! in the request's extensions (and in the response's once it exists). Its
//! presence is what makes a second pass through the layer a no-op. Handlers
//! can take it as an extractor.

use std::any::Any;
use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, Request, StatusCode, Uri, Version, header};
use reqctx_core::{BoundContext, EventEmitter, Frame, Region, Scope, WeakEventEmitter};

/// Frame key under which [`HttpContext`] is published.
pub const HTTP_CONTEXT_KEY: &str = "http";

/// Event sources of one exchange.
///
/// `request` fires `"end"` once the handler chain completes; `response`
/// fires `"finish"` with `{"status": u16}` when a response was produced, or
/// `"close"` when the inner service failed.
#[derive(Debug, Clone, Default)]
pub struct RequestEvents {
    pub request: EventEmitter,
    pub response: EventEmitter,
}

impl RequestEvents {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Context attached to one inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub scope: Scope,
    pub frame: Arc<Frame>,
    pub region: Region,
    pub events: RequestEvents,
}

impl RequestContext {
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

    /// Handle pinned to this request's frame.
    pub fn bound(&self) -> BoundContext {
        BoundContext::new(self.scope.clone(), self.frame.clone())
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<RequestContext>().cloned().ok_or((
            StatusCode::INTERNAL_SERVER_ERROR,
            "request context middleware is not installed",
        ))
    }
}

/// Snapshot of the request head, published when HTTP context is enabled.
///
/// The frame owns this value and the request's emitters are bound to that
/// frame, so the emitters are held weakly here.
#[derive(Debug, Clone)]
pub struct HttpContext {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    request: WeakEventEmitter,
    response: WeakEventEmitter,
}

impl HttpContext {
    pub fn from_request<B>(req: &Request<B>, events: &RequestEvents) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
            request: events.request.downgrade(),
            response: events.response.downgrade(),
        }
    }

    /// Event sources of the exchange, while it is still in flight.
    pub fn events(&self) -> Option<RequestEvents> {
        Some(RequestEvents {
            request: self.request.upgrade()?,
            response: self.response.upgrade()?,
        })
    }

    /// Host the client addressed, without the port.
    pub fn hostname(&self) -> Option<&str> {
        hostname_of(&self.uri, &self.headers)
    }
}

/// Host named by the URI authority, else by the `Host` header, without the
/// port. IPv6 literals come back without brackets.
pub fn hostname_of<'a>(uri: &'a Uri, headers: &'a HeaderMap) -> Option<&'a str> {
    let host = uri
        .host()
        .or_else(|| headers.get(header::HOST)?.to_str().ok())?;
    if let Some(bracketed) = host.strip_prefix('[') {
        return bracketed.split(']').next();
    }
    host.split(':').next()
}
