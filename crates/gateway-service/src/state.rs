use crate::collaborators::InMemoryAccountStore;
use gateway_core::collaborators::{AccessTokenProvider, OpsSink, RateLimitService, UsageSnapshotSink};
use gateway_core::config::GatewayConfig;
use std::sync::Arc;

/// Everything a request handler needs, shared across connections behind an
/// `Arc`. The collaborator fields are trait objects so a real deployment
/// can swap in persistent-storage/OAuth-refresh/metrics implementations
/// without touching the handler.
pub struct AppState {
    pub accounts: InMemoryAccountStore,
    pub token_provider: Arc<dyn AccessTokenProvider>,
    pub rate_limiter: Arc<dyn RateLimitService>,
    pub ops: Arc<dyn OpsSink>,
    pub usage_sink: Arc<dyn UsageSnapshotSink>,
    pub config: GatewayConfig,
    pub api_keys: Vec<String>,
}
