//! In-process stand-ins for the collaborators `gateway-core` expects a real
//! deployment to supply (persistent account storage, OAuth token refresh,
//! a shared rate limiter, durable ops/usage sinks). None of these do
//! anything beyond what's needed to drive the gateway end to end; a real
//! deployment replaces each independently.

use async_trait::async_trait;
use gateway_core::account::Account;
use gateway_core::collaborators::{
    AccessTokenProvider, CodexUsageSnapshot, OpsSink, OpsUpstreamErrorEvent, RateLimitService, UsageSnapshotSink,
};
use gateway_core::error::GatewayError;

/// Accounts loaded once from the config file at startup, served from
/// memory for the lifetime of the process.
pub struct InMemoryAccountStore {
    accounts: Vec<Account>,
}

impl InMemoryAccountStore {
    pub fn new(accounts: Vec<Account>) -> Self {
        Self { accounts }
    }

    /// Round-robin-free selection: the first account whose model map (or
    /// identity fallback) can serve `requested_model`. Load balancing
    /// across multiple matching accounts is a deployment concern.
    pub fn pick_for_model(&self, _requested_model: &str) -> Option<&Account> {
        self.accounts.first()
    }
}

/// Returns each account's configured `bearer_token` unchanged. Real OAuth
/// accounts need a refresh flow in front of this; this gateway treats the
/// configured token as already valid.
pub struct StaticAccessTokenProvider;

#[async_trait]
impl AccessTokenProvider for StaticAccessTokenProvider {
    async fn get_access_token(&self, account: &Account) -> Result<String, GatewayError> {
        Ok(account.bearer_token.clone())
    }
}

/// No-op rate limiter: stream timeouts are logged but never change
/// scheduling decisions.
pub struct NoopRateLimitService;

#[async_trait]
impl RateLimitService for NoopRateLimitService {
    async fn handle_stream_timeout(&self, account: &Account, model: &str) {
        tracing::warn!(account = account.name, model, "stream timed out waiting on upstream data");
    }
}

/// Logs upstream error diagnostics through `tracing` instead of persisting
/// them anywhere.
pub struct TracingOpsSink;

impl OpsSink for TracingOpsSink {
    fn set_upstream_error(&self, status_code: u16, message: &str, detail: &str) {
        tracing::warn!(status_code, message, detail, "upstream error");
    }

    fn append_upstream_error(&self, event: OpsUpstreamErrorEvent) {
        tracing::warn!(
            platform = event.platform,
            account_id = event.account_id,
            account_name = event.account_name,
            status = event.upstream_status_code,
            kind = event.kind,
            message = event.message,
            "upstream error recorded"
        );
    }
}

/// Discards Codex/OAuth rate-limit header snapshots. A real deployment
/// persists these to drive its own quota dashboard.
pub struct NoopUsageSnapshotSink;

#[async_trait]
impl UsageSnapshotSink for NoopUsageSnapshotSink {
    async fn update_codex_usage_snapshot(&self, account_id: u64, snapshot: CodexUsageSnapshot) {
        tracing::debug!(account_id, headers = ?snapshot.headers, "codex usage snapshot received");
    }
}
