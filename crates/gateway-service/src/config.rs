use gateway_core::account::{Account, AccountType};
use gateway_core::config::{GatewayConfig, ResponseHeaderPolicy};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// On-disk shape of the config file, grouped the same way the in-memory
/// [`GatewayConfig`] groups its knobs: a `[gateway]` table for translator
/// tuning and a `[security]` table for the gateway's own inbound auth.
#[derive(Debug, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub accounts: Vec<AccountSection>,
}

#[derive(Debug, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_max_line_size")]
    pub max_line_size: usize,
    #[serde(default)]
    pub stream_data_interval_timeout_secs: u64,
    #[serde(default)]
    pub stream_keepalive_interval_secs: u64,
    #[serde(default)]
    pub log_upstream_error_body: bool,
    #[serde(default)]
    pub log_upstream_error_body_max_bytes: usize,
    #[serde(default)]
    pub response_header_allowlist: Vec<String>,
}

fn default_max_line_size() -> usize {
    gateway_core::config::DEFAULT_MAX_LINE_SIZE
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            max_line_size: default_max_line_size(),
            stream_data_interval_timeout_secs: 0,
            stream_keepalive_interval_secs: 0,
            log_upstream_error_body: false,
            log_upstream_error_body_max_bytes: 0,
            response_header_allowlist: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct SecuritySection {
    /// Bearer tokens accepted from clients calling this gateway. Empty
    /// means the gateway is unauthenticated, which is only sane for local
    /// development.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct AccountSection {
    pub id: u64,
    pub name: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    pub account_type: AccountTypeSection,
    pub bearer_token: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub model_map: HashMap<String, String>,
}

fn default_platform() -> String {
    "openai".to_string()
}

fn default_concurrency() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountTypeSection {
    ChatNative,
    OauthResponses,
}

impl From<AccountTypeSection> for AccountType {
    fn from(value: AccountTypeSection) -> Self {
        match value {
            AccountTypeSection::ChatNative => AccountType::ChatNative,
            AccountTypeSection::OauthResponses => AccountType::OAuthResponses,
        }
    }
}

impl From<AccountSection> for Account {
    fn from(section: AccountSection) -> Self {
        let mut account = Account::new(section.id, section.name, section.account_type.into(), section.bearer_token)
            .with_model_map(section.model_map);
        account.platform = section.platform;
        account.proxy_url = section.proxy_url;
        account.concurrency = section.concurrency;
        account.user_agent = section.user_agent;
        if let Some(base_url) = section.base_url {
            account = account.with_base_url(base_url);
        }
        account
    }
}

impl From<&GatewaySection> for GatewayConfig {
    fn from(section: &GatewaySection) -> Self {
        GatewayConfig {
            max_line_size: section.max_line_size,
            stream_data_interval_timeout_secs: section.stream_data_interval_timeout_secs,
            stream_keepalive_interval_secs: section.stream_keepalive_interval_secs,
            log_upstream_error_body: section.log_upstream_error_body,
            log_upstream_error_body_max_bytes: section.log_upstream_error_body_max_bytes,
            response_headers: ResponseHeaderPolicy {
                enabled: !section.response_header_allowlist.is_empty(),
                allow: section.response_header_allowlist.clone(),
            },
        }
    }
}

pub fn load(path: &Path) -> anyhow::Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
    let config: FileConfig = toml::from_str(&text)
        .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
    Ok(config)
}
