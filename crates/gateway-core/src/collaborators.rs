use crate::account::Account;
use async_trait::async_trait;
use std::collections::HashMap;

/// Refreshes/returns an OAuth (or static) bearer token for an account.
/// Token refresh itself is out of scope for the core; this is the seam.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn get_access_token(&self, account: &Account) -> Result<String, crate::error::GatewayError>;
}

/// Notified when the SSE translator gives up on a stream because no data
/// arrived within the configured interval. Rate-limit bookkeeping itself is
/// out of scope; the core only calls this hook.
#[async_trait]
pub trait RateLimitService: Send + Sync {
    async fn handle_stream_timeout(&self, account: &Account, model: &str);
}

/// A single diagnostic record about an upstream failure.
#[derive(Debug, Clone)]
pub struct OpsUpstreamErrorEvent {
    pub platform: String,
    pub account_id: u64,
    pub account_name: String,
    pub upstream_status_code: u16,
    pub upstream_request_id: String,
    pub kind: String,
    pub message: String,
    pub detail: String,
}

/// Diagnostic sink for upstream request/failover errors. Persistence is out
/// of scope for the core; the default implementation just logs.
pub trait OpsSink: Send + Sync {
    fn set_upstream_error(&self, status_code: u16, message: &str, detail: &str);
    fn append_upstream_error(&self, event: OpsUpstreamErrorEvent);
}

/// Snapshot of Codex/OAuth-account rate-limit headers, parsed by the
/// Forwarder and handed to this collaborator after the request completes.
#[derive(Debug, Clone, Default)]
pub struct CodexUsageSnapshot {
    pub headers: HashMap<String, String>,
}

#[async_trait]
pub trait UsageSnapshotSink: Send + Sync {
    async fn update_codex_usage_snapshot(&self, account_id: u64, snapshot: CodexUsageSnapshot);
}
