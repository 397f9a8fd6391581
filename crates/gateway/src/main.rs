mod cli;
mod files;
mod settings;
mod state;
mod turn;
mod ws;

use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use axum::routing::get;
use clap::Parser;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use cc_domain::config::{Config, LlmStartupPolicy};
use cc_providers::LlmRouter;
use cc_store::Store;
use cc_streamhub::StreamRegistry;

use cli::{Cli, Command};
use state::{AppState, ConnectionRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    match args.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, _config_path) = cli::load_config()?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Version) => {
            println!("chatcore-gateway {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,cc_gateway=debug")),
        )
        .json()
        .init();
}

/// Start the gateway: open the durable store, wire up the LLM providers,
/// stream registry and connection registry, seed runtime settings, and serve
/// the WebSocket Gateway.
async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("chatcore gateway starting");

    if let Some(parent) = config.store.db_path.parent() {
        std::fs::create_dir_all(parent).context("creating store directory")?;
    }
    let store = Arc::new(Store::open(&config.store.db_path).context("opening durable store")?);
    tracing::info!(path = %config.store.db_path.display(), "durable store ready");

    store
        .seed_settings(&config.settings.seed)
        .context("seeding runtime settings")?;

    std::fs::create_dir_all(&config.store.attachments_dir).context("creating attachments directory")?;
    std::fs::create_dir_all(&config.tools.workspace_path).context("creating tool workspace directory")?;

    let llm = Arc::new(LlmRouter::from_config(&config.llm).context("initializing LLM providers")?);
    if llm.registry().is_empty() {
        match config.llm.startup_policy {
            LlmStartupPolicy::RequireOne => {
                anyhow::bail!("no LLM providers initialized and llm.startup_policy is require_one");
            }
            LlmStartupPolicy::AllowNone => {
                tracing::warn!("no LLM providers initialized — chat endpoints will return errors until configured");
            }
        }
    } else {
        tracing::info!(providers = llm.registry().len(), "LLM provider registry ready");
    }

    let streams = Arc::new(StreamRegistry::new());
    let connections = Arc::new(ConnectionRegistry::new());

    let state = AppState {
        config: config.clone(),
        store,
        llm,
        streams,
        connections,
        attachments_root: config.store.attachments_dir.clone(),
    };

    let cors_layer = build_cors_layer(&config.server.cors);

    let app = axum::Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/ws", get(ws::upgrade))
        .layer(cors_layer)
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "chatcore gateway listening");

    axum::serve(listener, app).await.context("axum server error")?;

    Ok(())
}

/// Build a [`CorsLayer`] from the configured allowed origins. Origins may
/// carry a trailing `*` wildcard for the port segment (e.g.
/// `http://localhost:*`); a literal `"*"` allows all origins.
fn build_cors_layer(cors: &cc_domain::config::CorsConfig) -> CorsLayer {
    use axum::http::header;

    if cors.allowed_origins.len() == 1 && cors.allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let mut exact: Vec<HeaderValue> = Vec::new();
    let mut wildcard_prefixes: Vec<String> = Vec::new();

    for origin in &cors.allowed_origins {
        if origin.ends_with(":*") {
            wildcard_prefixes.push(origin.trim_end_matches('*').to_owned());
        } else if let Ok(hv) = origin.parse::<HeaderValue>() {
            exact.push(hv);
        } else {
            tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
        }
    }

    let allow_origin = if wildcard_prefixes.is_empty() {
        AllowOrigin::list(exact)
    } else {
        AllowOrigin::predicate(move |origin, _| {
            let origin_str = origin.to_str().unwrap_or("");
            if exact.iter().any(|e| e.as_bytes() == origin.as_bytes()) {
                return true;
            }
            wildcard_prefixes.iter().any(|prefix| {
                origin_str
                    .strip_prefix(prefix.as_str())
                    .map(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
        })
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}
