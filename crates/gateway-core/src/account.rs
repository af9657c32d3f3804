use std::collections::HashMap;

/// Which upstream shape this account's requests are translated into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountType {
    /// Classic `/v1/chat/completions` upstream, wire-compatible passthrough.
    ChatNative,
    /// OAuth-backed `/v1/responses` upstream; requests are synthesized.
    OAuthResponses,
}

/// Opaque-to-the-core account record. The translator only ever reads these
/// fields and treats the value as immutable for the lifetime of a request.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: u64,
    pub name: String,
    pub platform: String,
    pub account_type: AccountType,
    pub base_url: Option<String>,
    pub proxy_url: Option<String>,
    pub concurrency: u32,
    pub user_agent: Option<String>,
    pub bearer_token: String,
    model_map: HashMap<String, String>,
}

impl Account {
    pub fn new(id: u64, name: impl Into<String>, account_type: AccountType, bearer_token: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            platform: "openai".to_string(),
            account_type,
            base_url: None,
            proxy_url: None,
            concurrency: 1,
            user_agent: None,
            bearer_token: bearer_token.into(),
            model_map: HashMap::new(),
        }
    }

    pub fn with_model_map(mut self, map: HashMap<String, String>) -> Self {
        self.model_map = map;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Exact-match lookup table plus identity fallback. Real account
    /// storage (with pattern-based mapping) is out of scope for the core.
    pub fn map_model(&self, requested: &str) -> String {
        self.model_map
            .get(requested)
            .cloned()
            .unwrap_or_else(|| requested.to_string())
    }
}
