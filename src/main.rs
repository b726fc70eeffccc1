//! reqctx — demo server for request-scoped context.
//!
//! Every request gets its own context frame. An inner middleware stores the
//! requested host in it; the `/colors` handler reads it back after a timer
//! and again from a task spawned through the request's region.
//!
//! Usage:
//!   reqctx                                   # Default port 3000
//!   reqctx --port 8080                       # Custom port
//!   reqctx --enable-http-context             # Publish the request head under "http"
//!   reqctx --config reqctx.json --compat-shim

use std::path::PathBuf;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    routing::get,
};
use clap::Parser;
use reqctx_core::{ContextConfig, ContextOptions, ContextRuntime};
use reqctx_http::{
    ContextServer, PerRequest, PerRequestOptions, RequestContext, ServerConfig, hostname_of,
};
use serde_json::{Value, json};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const COLORS: [&str; 3] = ["red", "green", "blue"];

#[derive(Parser, Debug)]
#[command(name = "reqctx", about = "reqctx demo server — request-scoped async context")]
struct Cli {
    /// Port to listen on (0 for OS-assigned)
    #[arg(long, default_value = "3000")]
    port: u16,

    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// Context scope name (overrides the config file)
    #[arg(long)]
    scope: Option<String>,

    /// Publish the request head into every request context
    #[arg(long)]
    enable_http_context: bool,

    /// Install the compatibility shim (overrides the config file)
    #[arg(long)]
    compat_shim: bool,

    /// JSON file with the context runtime configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Write logs to a file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Clone)]
struct AppState {
    runtime: ContextRuntime,
}

/// Store the requested hostname (port stripped) in the current context.
async fn save_host_to_context(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Some(ctx) = state.runtime.registry.get_current_context(ContextOptions::default()) {
        let host = hostname_of(req.uri(), req.headers())
            .unwrap_or("unknown")
            .to_string();
        if let Err(e) = ctx.set("host", host) {
            warn!("Could not store host in context: {e}");
        }
    }
    next.run(req).await
}

async fn list_colors(State(state): State<AppState>, ctx: RequestContext) -> Json<Value> {
    // Still the same continuation after the timer fires.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let host = state
        .runtime
        .registry
        .current_context()
        .and_then(|scope| scope.get::<String>("host"));
    info!("Request to host {}", host.as_deref().unwrap_or("(context not available)"));

    // A spawned task only sees the context because the region binds it.
    let registry = state.runtime.registry.clone();
    let echoed = match ctx.region.spawn(async move {
        registry
            .current_context()
            .and_then(|scope| scope.get::<String>("host"))
    }) {
        Ok(handle) => handle.await.ok().and_then(Result::ok).flatten(),
        Err(e) => {
            warn!("Could not spawn bound task: {e}");
            None
        }
    };

    // Unbound on purpose: reported by the shim when it is installed.
    let method = ctx
        .get::<reqctx_http::HttpContext>(reqctx_http::HTTP_CONTEXT_KEY)
        .map(|http| http.method.to_string());
    if let Err(e) = state.runtime.shim.spawn("colors/audit", async move {
        info!("audit: colors listed (method: {})", method.as_deref().unwrap_or("-"));
    }) {
        warn!("Audit task not started: {e}");
    }

    Json(json!({
        "host": host,
        "echoedHost": echoed,
        "colors": COLORS,
    }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "scopes": state.runtime.registry.scope_names(),
        "shimWarnings": state.runtime.shim.total_warnings(),
    }))
}

fn load_config(cli: &Cli) -> Result<ContextConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => ContextConfig::from_json_str(&std::fs::read_to_string(path)?)?,
        None => ContextConfig::default(),
    };
    if let Some(scope) = &cli.scope {
        config.default_scope = scope.clone();
    }
    if cli.compat_shim {
        config.compat_shim = true;
    }
    Ok(config)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    if let Some(ref log_path) = cli.log_file {
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .unwrap_or_else(|e| panic!("Failed to open log file {}: {e}", log_path.display()));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();

        eprintln!("Logging to {}", log_path.display());
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let runtime = ContextRuntime::new(config);
    let per_request = PerRequest::new(
        runtime.registry.clone(),
        PerRequestOptions {
            name: runtime.config.default_scope.clone(),
            enable_http_context: cli.enable_http_context,
        },
    );
    runtime.shim.library_loaded("axum");

    let state = AppState {
        runtime: runtime.clone(),
    };
    let app = Router::new()
        .route("/colors", get(list_colors))
        .route("/health", get(health))
        .layer(middleware::from_fn_with_state(state.clone(), save_host_to_context))
        .layer(per_request)
        .with_state(state);

    println!();
    println!("  reqctx demo server");
    println!();
    println!("  Scope:        {}", runtime.config.default_scope);
    println!("  HTTP context: {}", if cli.enable_http_context { "enabled" } else { "disabled" });
    println!("  Compat shim:  {}", if runtime.shim.is_installed() { "installed" } else { "off" });
    println!();

    let server_config = ServerConfig {
        port: cli.port,
        hostname: cli.hostname.clone(),
    };
    let mut server = match ContextServer::start(server_config, app).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start server: {e}");
            std::process::exit(1);
        }
    };

    println!("  A list of colors is available at http://{}:{}/colors", cli.hostname, server.port());
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }

    println!();
    println!("  Shutting down...");
    server.stop().await;
    println!("  Server stopped.");
}
