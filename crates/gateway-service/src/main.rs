mod collaborators;
mod config;
mod handler;
mod state;

use axum::routing::post;
use axum::Router;
use clap::Parser;
use collaborators::{InMemoryAccountStore, NoopRateLimitService, NoopUsageSnapshotSink, StaticAccessTokenProvider, TracingOpsSink};
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "gateway-service", about = "OpenAI-compatible chat-completions gateway")]
struct Args {
    /// Path to the TOML config file (accounts, gateway and security tables).
    #[arg(long, default_value = "gateway.toml")]
    config: PathBuf,

    /// Address to bind the HTTP listener to.
    #[arg(long, default_value = "0.0.0.0:8787")]
    listen_addr: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let file_config = config::load(&args.config)?;
    let gateway_config = gateway_core::config::GatewayConfig::from(&file_config.gateway);
    let accounts: Vec<gateway_core::account::Account> = file_config.accounts.into_iter().map(Into::into).collect();

    if accounts.is_empty() {
        tracing::warn!("no accounts configured; every request will fail with 503");
    }

    let state = Arc::new(AppState {
        accounts: InMemoryAccountStore::new(accounts),
        token_provider: Arc::new(StaticAccessTokenProvider),
        rate_limiter: Arc::new(NoopRateLimitService),
        ops: Arc::new(TracingOpsSink),
        usage_sink: Arc::new(NoopUsageSnapshotSink),
        config: gateway_config,
        api_keys: file_config.security.api_keys,
    });

    let app = Router::new()
        .route("/v1/chat/completions", post(handler::chat_completions))
        .layer(CorsLayer::permissive())
        .with_state(state);

    tracing::info!(addr = %args.listen_addr, "gateway-service listening");
    let listener = tokio::net::TcpListener::bind(args.listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
