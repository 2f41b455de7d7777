//! Validation of webhook targets, headers and payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;
use url::{Host, Url};

use crate::error::{WebhookError, WebhookResult};

/// Environment variable allowing plain-HTTP targets.
pub const ENV_ALLOW_HTTP: &str = "DXP_WEBHOOK_ALLOW_HTTP";
/// Environment variable allowing loopback and private targets.
pub const ENV_ALLOW_LOCALHOST: &str = "DXP_WEBHOOK_ALLOW_LOCALHOST";
/// Environment variable naming the deployment environment.
pub const ENV_ENVIRONMENT: &str = "DXP_ENVIRONMENT";

/// Maximum size of one header value, in bytes.
pub const MAX_HEADER_VALUE_BYTES: usize = 1024;
/// Maximum combined size of all header names and values, in bytes.
pub const MAX_HEADERS_BYTES: usize = 8 * 1024;
/// Maximum serialized payload size, in bytes.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Headers that callers may not override.
pub const FORBIDDEN_HEADERS: [&str; 4] = ["host", "connection", "transfer-encoding", "upgrade"];

/// Fields every webhook payload must carry.
pub const REQUIRED_PAYLOAD_FIELDS: [&str; 3] = ["eventType", "timestamp", "operationId"];

/// Outcome of a validation check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationResult {
    /// A passing result.
    pub fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    /// A failing result.
    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
        }
    }

    /// Converts into a `Result`, wrapping the message with `err`.
    pub fn into_result(self, err: impl FnOnce(String) -> WebhookError) -> WebhookResult<()> {
        if self.valid {
            Ok(())
        } else {
            Err(err(self.error.unwrap_or_default()))
        }
    }
}

/// Which otherwise rejected targets are allowed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UrlPolicy {
    /// Accept `http://` targets.
    pub allow_http: bool,
    /// Accept loopback, private and link-local targets.
    pub allow_localhost: bool,
}

impl UrlPolicy {
    /// The strict policy: HTTPS to public hosts only.
    pub fn strict() -> Self {
        Self::default()
    }

    /// Reads the policy from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the policy from an arbitrary key lookup.
    ///
    /// Localhost targets are also allowed when the environment is
    /// `development`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| {
            lookup(key).is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"))
        };
        let development = lookup(ENV_ENVIRONMENT)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("development"));
        Self {
            allow_http: flag(ENV_ALLOW_HTTP),
            allow_localhost: flag(ENV_ALLOW_LOCALHOST) || development,
        }
    }

    /// Sets whether plain HTTP is allowed.
    pub fn allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }

    /// Sets whether local targets are allowed.
    pub fn allow_localhost(mut self, allow: bool) -> Self {
        self.allow_localhost = allow;
        self
    }
}

/// Validates a webhook target URL.
pub fn validate_url(url: &str, policy: &UrlPolicy) -> ValidationResult {
    let parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(e) => return ValidationResult::invalid(format!("Invalid URL '{}': {}", url, e)),
    };

    match parsed.scheme() {
        "https" => {}
        "http" if policy.allow_http => {}
        "http" => return ValidationResult::invalid("Webhook URL must use HTTPS"),
        scheme => {
            return ValidationResult::invalid(format!(
                "Unsupported scheme '{}': only https (or http when allowed) is accepted",
                scheme
            ));
        }
    }

    if !parsed.username().is_empty() || parsed.password().is_some() {
        return ValidationResult::invalid("Webhook URL must not embed credentials");
    }

    let Some(host) = parsed.host() else {
        return ValidationResult::invalid("Webhook URL has no host");
    };

    if !policy.allow_localhost {
        let local = match host {
            Host::Domain(domain) => {
                let domain = domain.trim_end_matches('.').to_ascii_lowercase();
                domain == "localhost" || domain.ends_with(".localhost")
            }
            Host::Ipv4(v4) => is_private_ip(&IpAddr::V4(v4)),
            Host::Ipv6(v6) => is_private_ip(&IpAddr::V6(v6)),
        };
        if local {
            return ValidationResult::invalid(
                "Webhook URL must not point to localhost or a private address",
            );
        }
    }

    ValidationResult::ok()
}

/// Checks whether an IP address is in a private or reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64) // 100.64.0.0/10
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || {
                    let s = v6.segments();
                    (s[0] & 0xfe00) == 0xfc00 || (s[0] & 0xffc0) == 0xfe80
                }
                || v6.to_ipv4_mapped().is_some_and(|v4| is_private_ip(&IpAddr::V4(v4)))
        }
    }
}

/// Validates custom headers.
pub fn validate_headers(headers: &Value) -> ValidationResult {
    let Some(map) = headers.as_object() else {
        return ValidationResult::invalid("Headers must be an object");
    };

    let mut total = 0usize;
    for (name, value) in map {
        if FORBIDDEN_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            return ValidationResult::invalid(format!("Header '{}' is not allowed", name));
        }
        let Some(value) = value.as_str() else {
            return ValidationResult::invalid(format!("Header '{}' must be a string", name));
        };
        if value.len() > MAX_HEADER_VALUE_BYTES {
            return ValidationResult::invalid(format!(
                "Header '{}' exceeds {} bytes",
                name, MAX_HEADER_VALUE_BYTES
            ));
        }
        total += name.len() + value.len();
    }

    if total > MAX_HEADERS_BYTES {
        return ValidationResult::invalid(format!("Headers exceed {} bytes in total", MAX_HEADERS_BYTES));
    }
    ValidationResult::ok()
}

/// Validates a payload before transformation.
pub fn validate_payload(payload: &Value) -> ValidationResult {
    let Some(map) = payload.as_object() else {
        return ValidationResult::invalid("Payload must be an object");
    };

    let size = match serde_json::to_vec(payload) {
        Ok(bytes) => bytes.len(),
        Err(e) => return ValidationResult::invalid(format!("Payload is not serializable: {}", e)),
    };
    if size > MAX_PAYLOAD_BYTES {
        return ValidationResult::invalid(format!(
            "Payload is {} bytes, limit is {}",
            size, MAX_PAYLOAD_BYTES
        ));
    }

    for field in REQUIRED_PAYLOAD_FIELDS {
        if !map.contains_key(field) {
            return ValidationResult::invalid(format!("Payload is missing '{}'", field));
        }
    }
    ValidationResult::ok()
}
