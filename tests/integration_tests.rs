//! End-to-end integration tests — a real listener serving a router behind
//! the per-request context layer, exercised with concurrent HTTP clients.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    routing::get,
};
use reqctx_core::{ContextConfig, ContextOptions, ContextRegistry, ContextRuntime};
use reqctx_http::{
    ContextServer, PerRequest, PerRequestOptions, RequestContext, ServerConfig, hostname_of,
};
use serde_json::{Value, json};

async fn save_host(State(registry): State<Arc<ContextRegistry>>, req: Request, next: Next) -> Response {
    if let Some(ctx) = registry.get_current_context(ContextOptions::default()) {
        let host = hostname_of(req.uri(), req.headers())
            .unwrap_or("unknown")
            .to_string();
        ctx.set("host", host).unwrap();
    }
    next.run(req).await
}

async fn echo_host(State(registry): State<Arc<ContextRegistry>>, ctx: RequestContext) -> Json<Value> {
    let delay = ctx
        .get::<String>("host")
        .map_or(0, |host| if host.starts_with("slow") { 50 } else { 5 });
    tokio::time::sleep(Duration::from_millis(delay)).await;

    let host = registry
        .current_context()
        .and_then(|scope| scope.get::<String>("host"));

    let reader = registry.clone();
    let spawned = ctx
        .region
        .spawn(async move {
            reader
                .current_context()
                .and_then(|scope| scope.get::<String>("host"))
        })
        .unwrap()
        .await
        .unwrap()
        .unwrap();

    Json(json!({ "host": host, "spawned": spawned }))
}

/// Start a test server on a random port.
async fn start_test_server(runtime: &ContextRuntime) -> ContextServer {
    let registry = runtime.registry.clone();
    let layer = PerRequest::new(registry.clone(), PerRequestOptions::default());
    let app = Router::new()
        .route("/host", get(echo_host))
        .layer(middleware::from_fn_with_state(registry.clone(), save_host))
        .layer(layer)
        .with_state(registry);

    let config = ServerConfig {
        port: 0, // OS-assigned
        hostname: "127.0.0.1".into(),
    };
    ContextServer::start(config, app)
        .await
        .expect("Failed to start test server")
}

async fn fetch_host(client: &reqwest::Client, port: u16, host: &str) -> Value {
    client
        .get(format!("http://127.0.0.1:{port}/host"))
        .header(reqwest::header::HOST, host)
        .send()
        .await
        .expect("request failed")
        .json()
        .await
        .expect("invalid JSON body")
}

#[tokio::test]
async fn test_server_binds_os_assigned_port() {
    let runtime = ContextRuntime::default();
    let mut server = start_test_server(&runtime).await;
    assert_ne!(server.port(), 0);
    server.stop().await;
}

#[tokio::test]
async fn test_single_request_round_trip() {
    let runtime = ContextRuntime::default();
    let mut server = start_test_server(&runtime).await;
    let client = reqwest::Client::new();

    let body = fetch_host(&client, server.port(), "alpha.test").await;
    assert_eq!(body, json!({ "host": "alpha.test", "spawned": "alpha.test" }));

    server.stop().await;
}

#[tokio::test]
async fn test_stored_host_has_no_port() {
    let runtime = ContextRuntime::default();
    let mut server = start_test_server(&runtime).await;
    let client = reqwest::Client::new();

    let body = fetch_host(&client, server.port(), "ported.test:8080").await;
    assert_eq!(body, json!({ "host": "ported.test", "spawned": "ported.test" }));

    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_requests_keep_their_own_context() {
    let runtime = ContextRuntime::new(ContextConfig {
        compat_shim: true,
        ..ContextConfig::default()
    });
    let mut server = start_test_server(&runtime).await;
    let client = reqwest::Client::new();
    let port = server.port();

    // The slow request is still waiting when the fast one completes.
    let (slow, fast) = tokio::join!(
        fetch_host(&client, port, "slow.test"),
        fetch_host(&client, port, "fast.test"),
    );
    assert_eq!(slow["host"], "slow.test");
    assert_eq!(slow["spawned"], "slow.test");
    assert_eq!(fast["host"], "fast.test");
    assert_eq!(fast["spawned"], "fast.test");

    // Region-bound spawns are not detached.
    assert!(runtime.shim.warnings().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_many_parallel_requests() {
    let runtime = ContextRuntime::default();
    let mut server = start_test_server(&runtime).await;
    let client = reqwest::Client::new();
    let port = server.port();

    let requests = (0..16).map(|i| {
        let client = client.clone();
        async move {
            let host = format!("client-{i}.test");
            let body = fetch_host(&client, port, &host).await;
            (host, body)
        }
    });
    for (host, body) in futures_util::future::join_all(requests).await {
        assert_eq!(body["host"], host.as_str());
        assert_eq!(body["spawned"], host.as_str());
    }

    server.stop().await;
}
