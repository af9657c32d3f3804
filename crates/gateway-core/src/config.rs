/// Passthrough policy for upstream response headers. The core only consults
/// `enabled`; the concrete filtering table is a deployment concern.
#[derive(Debug, Clone)]
pub struct ResponseHeaderPolicy {
    pub enabled: bool,
    pub allow: Vec<String>,
}

impl Default for ResponseHeaderPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            allow: Vec::new(),
        }
    }
}

/// Runtime knobs for the translator, grouped the way the upstream config
/// file groups them (`gateway.*`, `security.*`).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_line_size: usize,
    pub stream_data_interval_timeout_secs: u64,
    pub stream_keepalive_interval_secs: u64,
    pub log_upstream_error_body: bool,
    pub log_upstream_error_body_max_bytes: usize,
    pub response_headers: ResponseHeaderPolicy,
}

pub const DEFAULT_MAX_LINE_SIZE: usize = 1024 * 1024;
pub const DEFAULT_LOG_UPSTREAM_ERROR_BODY_MAX_BYTES: usize = 2048;

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_line_size: DEFAULT_MAX_LINE_SIZE,
            stream_data_interval_timeout_secs: 0,
            stream_keepalive_interval_secs: 0,
            log_upstream_error_body: false,
            log_upstream_error_body_max_bytes: DEFAULT_LOG_UPSTREAM_ERROR_BODY_MAX_BYTES,
            response_headers: ResponseHeaderPolicy::default(),
        }
    }
}

impl GatewayConfig {
    pub fn log_upstream_error_body_max_bytes(&self) -> usize {
        if self.log_upstream_error_body_max_bytes == 0 {
            DEFAULT_LOG_UPSTREAM_ERROR_BODY_MAX_BYTES
        } else {
            self.log_upstream_error_body_max_bytes
        }
    }
}

/// Copies headers from `src` into `dest` that `policy` allows through.
/// A no-op when the policy is disabled; otherwise only headers named in
/// `policy.allow` (case-insensitive) are copied, and only those present on
/// `src`.
pub fn write_filtered_headers(dest: &mut http::HeaderMap, src: &http::HeaderMap, policy: &ResponseHeaderPolicy) {
    if !policy.enabled {
        return;
    }
    for name in &policy.allow {
        let Ok(header_name) = http::HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()) else {
            continue;
        };
        for value in src.get_all(&header_name) {
            dest.append(header_name.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_policy_copies_nothing() {
        let mut dest = http::HeaderMap::new();
        let mut src = http::HeaderMap::new();
        src.insert("x-request-id", "abc".parse().unwrap());
        write_filtered_headers(&mut dest, &src, &ResponseHeaderPolicy::default());
        assert!(dest.is_empty());
    }

    #[test]
    fn allowlisted_header_is_copied() {
        let mut dest = http::HeaderMap::new();
        let mut src = http::HeaderMap::new();
        src.insert("x-request-id", "abc".parse().unwrap());
        src.insert("x-not-allowed", "hidden".parse().unwrap());
        let policy = ResponseHeaderPolicy { enabled: true, allow: vec!["x-request-id".to_string()] };
        write_filtered_headers(&mut dest, &src, &policy);
        assert_eq!(dest.get("x-request-id").unwrap(), "abc");
        assert!(dest.get("x-not-allowed").is_none());
    }
}
