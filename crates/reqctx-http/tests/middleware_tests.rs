//! Middleware tests — per-request contexts driven through an axum router.

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex, Weak};
    use std::time::Duration;

    use axum::{
        Router,
        body::Body,
        extract::State,
        http::{Request, StatusCode, header},
        middleware::{self, Next},
        response::Response,
        routing::get,
    };
    use reqctx_core::{ContextOptions, ContextRegistry, Frame, WeakEventEmitter};
    use reqctx_http::*;
    use serde_json::json;
    use tower::ServiceExt;

    async fn save_host(
        State(registry): State<Arc<ContextRegistry>>,
        req: Request<Body>,
        next: Next,
    ) -> Response {
        if let Some(ctx) = registry.get_current_context(ContextOptions::default()) {
            let host = hostname_of(req.uri(), req.headers())
                .unwrap_or("unknown")
                .to_string();
            ctx.set("host", host).unwrap();
        }
        next.run(req).await
    }

    async fn read_host(State(registry): State<Arc<ContextRegistry>>) -> String {
        tokio::time::sleep(Duration::from_millis(5)).await;
        host_of(&registry)
    }

    async fn explode() -> &'static str {
        panic!("handler exploded")
    }

    fn host_of(registry: &ContextRegistry) -> String {
        registry
            .current_context()
            .and_then(|scope| scope.get::<String>("host"))
            .unwrap_or_else(|| "none".into())
    }

    fn app(registry: Arc<ContextRegistry>, layer: PerRequest) -> Router {
        Router::new()
            .route("/host", get(read_host))
            .layer(middleware::from_fn_with_state(registry.clone(), save_host))
            .layer(layer)
            .with_state(registry)
    }

    fn request(uri: &str, host: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Per-request isolation
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn value_set_by_middleware_reaches_handler_after_await() {
        let registry = Arc::new(ContextRegistry::new());
        let layer = PerRequest::new(registry.clone(), PerRequestOptions::default());
        let response = app(registry, layer)
            .oneshot(request("/host", "example.test"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.extensions().get::<RequestContext>().is_some());
        assert_eq!(body_string(response).await, "example.test");
    }

    #[tokio::test]
    async fn concurrent_requests_see_their_own_context() {
        let registry = Arc::new(ContextRegistry::new());
        let layer = PerRequest::new(registry.clone(), PerRequestOptions::default());
        let app = app(registry.clone(), layer.clone());

        let (first, second) = tokio::join!(
            app.clone().oneshot(request("/host", "first.test")),
            app.clone().oneshot(request("/host", "second.test")),
        );

        assert_eq!(body_string(first.unwrap()).await, "first.test");
        assert_eq!(body_string(second.unwrap()).await, "second.test");
        assert_eq!(layer.contexts_created(), 2);
        assert_eq!(host_of(&registry), "none");
    }

    #[tokio::test]
    async fn layer_applied_twice_opens_one_context() {
        let registry = Arc::new(ContextRegistry::new());
        let layer = PerRequest::new(registry.clone(), PerRequestOptions::default());
        let app = Router::new()
            .route("/host", get(read_host))
            .layer(middleware::from_fn_with_state(registry.clone(), save_host))
            .layer(layer.clone())
            .layer(layer.clone())
            .with_state(registry);

        let response = app.oneshot(request("/host", "example.test")).await.unwrap();
        assert_eq!(body_string(response).await, "example.test");
        assert_eq!(layer.contexts_created(), 1);
    }

    #[tokio::test]
    async fn bound_context_follows_a_spawned_task() {
        let registry = Arc::new(ContextRegistry::new());
        let layer = PerRequest::new(registry.clone(), PerRequestOptions::default());
        let reader = registry.clone();
        let app = Router::new()
            .route(
                "/spawned",
                get(move |ctx: RequestContext| async move {
                    ctx.set("host", "spawned.test".to_string());
                    let bound = ctx.bound();
                    let r = reader.clone();
                    let plain = tokio::spawn(async move { host_of(&r) }).await.unwrap();
                    let r = reader.clone();
                    let rebound = tokio::spawn(bound.bind_future(async move { host_of(&r) }))
                        .await
                        .unwrap();
                    format!("{plain} {rebound}")
                }),
            )
            .layer(layer);

        let response = app.oneshot(request("/spawned", "example.test")).await.unwrap();
        assert_eq!(body_string(response).await, "none spawned.test");
    }

    // ─────────────────────────────────────────────────────────────────────
    // HTTP context
    // ─────────────────────────────────────────────────────────────────────

    fn inspect_app(registry: Arc<ContextRegistry>, enable_http_context: bool) -> Router {
        let layer = PerRequest::new(
            registry,
            PerRequestOptions {
                enable_http_context,
                ..PerRequestOptions::default()
            },
        );
        Router::new()
            .route(
                "/inspect",
                get(|ctx: RequestContext| async move {
                    match ctx.get::<HttpContext>(HTTP_CONTEXT_KEY) {
                        Some(http) => format!(
                            "{} {} {}",
                            http.method,
                            http.uri.path(),
                            http.hostname().unwrap_or("-")
                        ),
                        None => "none".to_string(),
                    }
                }),
            )
            .layer(layer)
    }

    #[tokio::test]
    async fn http_context_is_published_when_enabled() {
        let app = inspect_app(Arc::new(ContextRegistry::new()), true);
        let response = app.oneshot(request("/inspect", "example.test:8080")).await.unwrap();
        assert_eq!(body_string(response).await, "GET /inspect example.test");
    }

    #[tokio::test]
    async fn http_context_is_absent_by_default() {
        let app = inspect_app(Arc::new(ContextRegistry::new()), false);
        let response = app.oneshot(request("/inspect", "example.test")).await.unwrap();
        assert_eq!(body_string(response).await, "none");
    }

    #[test]
    fn http_context_hostname_strips_port_and_brackets() {
        let events = RequestEvents::new();
        let req = request("/", "[::1]:3000");
        let http = HttpContext::from_request(&req, &events);
        assert_eq!(http.hostname(), Some("::1"));

        let req = request("http://api.example.test:8443/colors", "ignored.test");
        let http = HttpContext::from_request(&req, &events);
        assert_eq!(http.hostname(), Some("api.example.test"));

        assert!(http.events().is_some());
        drop(events);
        assert!(http.events().is_none());
    }

    #[test]
    fn hostname_of_prefers_the_uri_authority() {
        let req = request("/colors", "colors.test:3000");
        assert_eq!(hostname_of(req.uri(), req.headers()), Some("colors.test"));

        let req = request("http://[::1]:8080/colors", "ignored.test");
        assert_eq!(hostname_of(req.uri(), req.headers()), Some("::1"));

        let req = Request::builder().uri("/colors").body(Body::empty()).unwrap();
        assert_eq!(hostname_of(req.uri(), req.headers()), None);
    }

    #[tokio::test]
    async fn request_frame_is_released_after_the_response() {
        for enable_http_context in [false, true] {
            let registry = Arc::new(ContextRegistry::new());
            let layer = PerRequest::new(
                registry,
                PerRequestOptions {
                    enable_http_context,
                    ..PerRequestOptions::default()
                },
            );
            let released: Arc<Mutex<Option<(Weak<Frame>, WeakEventEmitter)>>> =
                Arc::new(Mutex::new(None));
            let slot = released.clone();
            let app = Router::new()
                .route(
                    "/held",
                    get(move |ctx: RequestContext| async move {
                        ctx.events.response.on("finish", |_| {});
                        if let Some(http) = ctx.get::<HttpContext>(HTTP_CONTEXT_KEY) {
                            assert!(http.events().is_some());
                        }
                        *slot.lock().unwrap() =
                            Some((Arc::downgrade(&ctx.frame), ctx.events.response.downgrade()));
                        "held"
                    }),
                )
                .layer(layer);

            let response = app.oneshot(request("/held", "example.test")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            drop(response);

            let (frame, emitter) = released.lock().unwrap().take().unwrap();
            assert!(
                frame.upgrade().is_none(),
                "request frame outlived its response (http context: {enable_http_context})"
            );
            assert!(emitter.upgrade().is_none());
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Request and response events
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn response_events_fire_inside_the_request_context() {
        let registry = Arc::new(ContextRegistry::new());
        let layer = PerRequest::new(registry.clone(), PerRequestOptions::default());
        let log = Arc::new(Mutex::new(Vec::<String>::new()));

        let (sink, reader) = (log.clone(), registry.clone());
        let app = Router::new()
            .route(
                "/watched",
                get(move |ctx: RequestContext| async move {
                    let (l, r) = (sink.clone(), reader.clone());
                    ctx.events.response.on("finish", move |event| {
                        l.lock()
                            .unwrap()
                            .push(format!("finish {} {}", event.payload["status"], host_of(&r)));
                    });
                    let l = sink.clone();
                    ctx.events.request.on("end", move |_| l.lock().unwrap().push("end".into()));
                    "ok"
                }),
            )
            .layer(middleware::from_fn_with_state(registry.clone(), save_host))
            .layer(layer);

        let response = app.oneshot(request("/watched", "events.test")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["finish 200 events.test".to_string(), "end".to_string()]
        );
    }

    // ─────────────────────────────────────────────────────────────────────
    // Failures
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn panicking_handler_is_contained_as_500() {
        let registry = Arc::new(ContextRegistry::new());
        let layer = PerRequest::new(registry.clone(), PerRequestOptions::default());
        let app = Router::new().route("/boom", get(explode)).layer(layer.clone());

        let response = app.oneshot(request("/boom", "example.test")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(layer.contexts_created(), 1);
    }

    #[tokio::test]
    async fn extractor_without_layer_is_rejected() {
        let app = Router::new().route("/inspect", get(|_ctx: RequestContext| async { "unreachable" }));
        let response = app.oneshot(request("/inspect", "example.test")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_string(response).await,
            "request context middleware is not installed"
        );
    }

    // ─────────────────────────────────────────────────────────────────────
    // Options
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn options_default_to_loopback_without_http_context() {
        let options = PerRequestOptions::default();
        assert_eq!(options.name, "loopback");
        assert!(!options.enable_http_context);
    }

    #[test]
    fn options_deserialize_and_create_the_named_scope() {
        let options: PerRequestOptions =
            serde_json::from_value(json!({"name": "api", "enableHttpContext": true})).unwrap();
        assert!(options.enable_http_context);

        let registry = Arc::new(ContextRegistry::new());
        let layer = PerRequest::new(registry.clone(), options);
        assert_eq!(layer.scope().name(), "api");
        assert!(registry.scope("api").unwrap().ptr_eq(layer.scope()));
        assert_eq!(layer.contexts_created(), 0);
    }
}
