//! Builds and submits the upstream HTTP request, and classifies the
//! response into "dispatch to a translator", "failover to another
//! account", or "surface as a client-facing error".
//!
//! Submission goes straight through `reqwest` rather than round-tripping
//! through `http::Request<Vec<u8>>` the way the provider clients elsewhere
//! in this workspace do, because the SSE translators need the response
//! body as a live byte stream (`reqwest::Response::bytes_stream`) rather
//! than a buffered `Vec<u8>`.

use crate::account::Account;
use crate::classifier::{
    build_upstream_error_body, default_upstream_message, extract_upstream_error_message, is_failover_status,
    sanitize_upstream_error_message, truncate_string,
};
use crate::collaborators::{OpsSink, OpsUpstreamErrorEvent};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, UpstreamFailoverError};
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Request headers the client is allowed to have forwarded upstream
/// verbatim. Everything else (notably the client's own `Authorization`
/// and `Host`) is dropped in favor of the account's own credentials.
const FORWARDED_HEADERS: &[&str] = &["accept-language", "openai-beta", "openai-organization"];

/// Upstream error bodies are read up to this many bytes; anything beyond is
/// dropped without buffering so a misbehaving upstream can't exhaust memory.
const MAX_ERROR_BODY_BYTES: usize = 2 * 1024 * 1024;

fn shared_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .build()
            .expect("reqwest client with default TLS backend")
    })
}

/// Per-account `reqwest::Client` cache, built only for accounts that
/// configure a `proxy_url`. Accounts with no proxy share `shared_client()`.
fn client_for_account(account: &Account) -> reqwest::Client {
    let Some(proxy_url) = &account.proxy_url else {
        return shared_client().clone();
    };

    static CLIENTS: OnceLock<Mutex<HashMap<u64, reqwest::Client>>> = OnceLock::new();
    let clients = CLIENTS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = clients.lock().expect("client cache poisoned");
    if let Some(client) = guard.get(&account.id) {
        return client.clone();
    }

    let client = reqwest::Proxy::all(proxy_url.as_str())
        .and_then(|proxy| reqwest::Client::builder().proxy(proxy).build())
        .unwrap_or_else(|err| {
            tracing::warn!(account_id = account.id, error = %err, "invalid account proxy_url, falling back to the shared client");
            shared_client().clone()
        });
    guard.insert(account.id, client.clone());
    client
}

/// Per-account concurrency gate keyed on `Account::concurrency`. Acquired
/// around the upstream `send()` so one account's in-flight requests never
/// exceed the limit it was configured with.
fn semaphore_for_account(account: &Account) -> Arc<Semaphore> {
    static SEMAPHORES: OnceLock<Mutex<HashMap<u64, Arc<Semaphore>>>> = OnceLock::new();
    let semaphores = SEMAPHORES.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = semaphores.lock().expect("semaphore cache poisoned");
    guard
        .entry(account.id)
        .or_insert_with(|| Arc::new(Semaphore::new(account.concurrency.max(1) as usize)))
        .clone()
}

/// Reads up to `max_bytes` of the response body, then stops — the remainder
/// of the body (if any) is left unread and dropped with the response.
async fn read_capped_body(mut response: reqwest::Response, max_bytes: usize) -> Bytes {
    let mut buf: Vec<u8> = Vec::new();
    while let Ok(Some(chunk)) = response.chunk().await {
        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            break;
        }
        if chunk.len() > remaining {
            buf.extend_from_slice(&chunk[..remaining]);
            break;
        }
        buf.extend_from_slice(&chunk);
    }
    Bytes::from(buf)
}

/// Everything the Forwarder needs to build one upstream request, beyond
/// the (already rewritten) JSON body.
pub struct ForwardRequest<'a> {
    pub account: &'a Account,
    pub access_token: &'a str,
    pub path: &'a str,
    pub client_headers: &'a http::HeaderMap,
    pub body: &'a Value,
}

/// The response classification the rest of the pipeline dispatches on.
pub enum ForwardOutcome {
    /// `2xx`; the body (buffered or streamed) should now be translated.
    Dispatch(reqwest::Response),
    /// A failover-set status; caller should retry on a different account.
    Failover(UpstreamFailoverError),
}

fn upstream_base_url(account: &Account) -> &str {
    account.base_url.as_deref().unwrap_or("https://api.openai.com")
}

fn build_upstream_url(account: &Account, path: &str) -> Result<url::Url, GatewayError> {
    let base = upstream_base_url(account);
    let joined = format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'));
    url::Url::parse(&joined).map_err(GatewayError::from)
}

/// Submits the rewritten request body to the account's upstream and
/// returns either a response ready for translation or a failover
/// classification. Non-failover error statuses are turned into a sanitized
/// [`GatewayError::Upstream`] directly, since nothing downstream needs the
/// raw body once that decision is made.
pub async fn forward(req: ForwardRequest<'_>, config: &GatewayConfig, ops: &dyn OpsSink) -> Result<ForwardOutcome, GatewayError> {
    let url = build_upstream_url(req.account, req.path)?;
    let client = client_for_account(req.account);

    let mut builder = client
        .post(url)
        .bearer_auth(req.access_token)
        .header("content-type", "application/json")
        .timeout(request_timeout())
        .json(req.body);

    if let Some(ua) = &req.account.user_agent {
        builder = builder.header("user-agent", ua);
    }
    for name in FORWARDED_HEADERS {
        if let Some(value) = req.client_headers.get(*name) {
            if let Ok(s) = value.to_str() {
                builder = builder.header(*name, s);
            }
        }
    }

    let semaphore = semaphore_for_account(req.account);
    let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");

    let response = match builder.send().await {
        Ok(resp) => resp,
        Err(err) => {
            record_transport_error(req.account, &err, ops);
            return Err(GatewayError::Transport(err.to_string()));
        }
    };

    let status = response.status().as_u16();
    if status < 400 {
        return Ok(ForwardOutcome::Dispatch(response));
    }

    if is_failover_status(status) {
        let body = read_capped_body(response, MAX_ERROR_BODY_BYTES).await;
        record_upstream_error(req.account, status, &body, config, ops);
        return Ok(ForwardOutcome::Failover(UpstreamFailoverError { status }));
    }

    let body = read_capped_body(response, MAX_ERROR_BODY_BYTES).await;
    record_upstream_error(req.account, status, &body, config, ops);
    let error_body = build_upstream_error_body(&body, status);

    Err(GatewayError::Upstream { status, body: error_body })
}

fn record_transport_error(account: &Account, err: &reqwest::Error, ops: &dyn OpsSink) {
    let message = sanitize_upstream_error_message(&err.to_string());
    ops.append_upstream_error(OpsUpstreamErrorEvent {
        platform: account.platform.clone(),
        account_id: account.id,
        account_name: account.name.clone(),
        upstream_status_code: 0,
        upstream_request_id: String::new(),
        kind: "request_error".to_string(),
        message,
        detail: String::new(),
    });
}

fn record_upstream_error(account: &Account, status: u16, body: &Bytes, config: &GatewayConfig, ops: &dyn OpsSink) {
    let message = {
        let extracted = extract_upstream_error_message(body);
        if extracted.is_empty() {
            default_upstream_message(status).to_string()
        } else {
            sanitize_upstream_error_message(&extracted)
        }
    };
    let detail = if config.log_upstream_error_body {
        truncate_string(&String::from_utf8_lossy(body), config.log_upstream_error_body_max_bytes())
    } else {
        String::new()
    };

    ops.set_upstream_error(status, &message, &detail);
    ops.append_upstream_error(OpsUpstreamErrorEvent {
        platform: account.platform.clone(),
        account_id: account.id,
        account_name: account.name.clone(),
        upstream_status_code: status,
        upstream_request_id: String::new(),
        kind: if is_failover_status(status) { "failover".to_string() } else { "permanent".to_string() },
        message,
        detail,
    });
}

/// Timeout applied to the whole request, independent of the stream-level
/// idle timeout enforced by the SSE translators.
pub fn request_timeout() -> Duration {
    Duration::from_secs(600)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountType;

    #[test]
    fn builds_url_against_configured_base() {
        let account = Account::new(1, "acct", AccountType::ChatNative, "tok").with_base_url("https://example.test");
        let url = build_upstream_url(&account, "/v1/chat/completions").unwrap();
        assert_eq!(url.as_str(), "https://example.test/v1/chat/completions");
    }

    #[test]
    fn builds_url_against_default_base_when_unset() {
        let account = Account::new(1, "acct", AccountType::ChatNative, "tok");
        let url = build_upstream_url(&account, "v1/responses").unwrap();
        assert_eq!(url.as_str(), "https://api.openai.com/v1/responses");
    }

    #[test]
    fn semaphore_for_account_is_sized_to_concurrency_and_cached_per_account() {
        let mut account = Account::new(4242, "acct", AccountType::ChatNative, "tok");
        account.concurrency = 2;

        let first = semaphore_for_account(&account);
        assert_eq!(first.available_permits(), 2);

        let second = semaphore_for_account(&account);
        assert!(Arc::ptr_eq(&first, &second), "same account id must reuse the same semaphore");
    }

    #[test]
    fn semaphore_for_account_never_zero_sized() {
        let mut account = Account::new(4243, "acct", AccountType::ChatNative, "tok");
        account.concurrency = 0;
        let semaphore = semaphore_for_account(&account);
        assert_eq!(semaphore.available_permits(), 1);
    }
}
