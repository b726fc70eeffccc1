//! Per-request context middleware.
//!
//! [`PerRequest`] is a `tower::Layer`. For every request that does not yet
//! carry a [`RequestContext`] it opens a fresh frame of its scope through
//! `run_in_context`, wires the request/response event sources into the
//! scope and the region, and drives the rest of the stack inside that frame.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use axum::http::{Request, Response, StatusCode};
use futures_util::future::BoxFuture;
use reqctx_core::{ContextRegistry, DEFAULT_SCOPE_NAME, Region, Scope};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::request_context::{HTTP_CONTEXT_KEY, HttpContext, RequestContext, RequestEvents};

/// Options for [`PerRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerRequestOptions {
    /// Scope the per-request frames belong to.
    pub name: String,
    /// Publish an [`HttpContext`] under `"http"` in every request frame.
    pub enable_http_context: bool,
}

impl Default for PerRequestOptions {
    fn default() -> Self {
        Self {
            name: DEFAULT_SCOPE_NAME.into(),
            enable_http_context: false,
        }
    }
}

struct PerRequestInner {
    registry: Arc<ContextRegistry>,
    scope: Scope,
    enable_http_context: bool,
    created: AtomicU64,
}

/// Layer that gives every request exactly one context.
#[derive(Clone)]
pub struct PerRequest {
    inner: Arc<PerRequestInner>,
}

impl PerRequest {
    /// Build the layer. The scope is created (or looked up) right away.
    pub fn new(registry: Arc<ContextRegistry>, options: PerRequestOptions) -> Self {
        let scope = registry.create_context(Some(&options.name));
        Self {
            inner: Arc::new(PerRequestInner {
                registry,
                scope,
                enable_http_context: options.enable_http_context,
                created: AtomicU64::new(0),
            }),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    /// Number of request contexts this layer has opened.
    pub fn contexts_created(&self) -> u64 {
        self.inner.created.load(Ordering::Relaxed)
    }

    /// Runs inside the request's region with its frame entered.
    fn process<S, ReqBody, ResBody>(
        &self,
        scope: Scope,
        region: Region,
        mut req: Request<ReqBody>,
        mut inner: S,
    ) -> impl Future<Output = Result<Response<ResBody>, S::Error>> + use<S, ReqBody, ResBody>
    where
        S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    {
        let events = RequestEvents::new();
        scope.bind_emitter(&events.request);
        scope.bind_emitter(&events.response);
        region.add(&events.request);
        region.add(&events.response);

        let context = RequestContext {
            scope,
            frame: region.frame().clone(),
            region: region.clone(),
            events: events.clone(),
        };

        if self.inner.enable_http_context {
            context.set(HTTP_CONTEXT_KEY, HttpContext::from_request(&req, &events));
        }

        req.extensions_mut().insert(context.clone());
        req.extensions_mut().insert(events.clone());

        let total = self.inner.created.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            scope = context.scope.name(),
            frame = %context.frame.id(),
            method = %req.method(),
            uri = %req.uri(),
            total,
            "request context attached"
        );

        async move {
            let mut result = inner.call(req).await;
            match &mut result {
                Ok(response) => {
                    events
                        .response
                        .emit("finish", json!({ "status": response.status().as_u16() }));
                    response.extensions_mut().insert(context);
                }
                Err(_) => {
                    events.response.emit("close", Value::Null);
                }
            }
            events.request.emit("end", Value::Null);
            result
        }
    }
}

impl std::fmt::Debug for PerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerRequest")
            .field("scope", &self.inner.scope.name())
            .field("enable_http_context", &self.inner.enable_http_context)
            .field("contexts_created", &self.contexts_created())
            .finish()
    }
}

impl<S> Layer<S> for PerRequest {
    type Service = PerRequestService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PerRequestService {
            inner,
            per_request: self.clone(),
        }
    }
}

/// Service produced by [`PerRequest`].
#[derive(Clone)]
pub struct PerRequestService<S> {
    inner: S,
    per_request: PerRequest,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for PerRequestService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        if req.extensions().get::<RequestContext>().is_some() {
            debug!("request already carries a context; passing through");
            return Box::pin(self.inner.call(req));
        }

        // The instance polled ready goes with this request.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);

        let per_request = self.per_request.clone();
        let scope = per_request.scope().clone();
        let registry = per_request.inner.registry.clone();
        let run = registry.run_in_context(
            move |scope, region| per_request.process(scope, region, req, inner),
            Some(&scope),
        );

        Box::pin(async move {
            match run.await {
                Ok(result) => result,
                Err(e) => {
                    warn!("Request failed inside its context region: {e}");
                    Ok(internal_error())
                }
            }
        })
    }
}

fn internal_error<B: Default>() -> Response<B> {
    let mut response = Response::new(B::default());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}
