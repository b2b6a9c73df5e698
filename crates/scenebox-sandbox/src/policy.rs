//! Policy normalizer: turns an untrusted, partial policy candidate into a
//! canonical [`SandboxPolicy`].
//!
//! Normalization never fails. Numeric fields are rounded and clamped into
//! range; missing or non-numeric values take the built-in default. Endpoint
//! entries are trimmed, stripped of trailing separators and deduplicated, and
//! the in-memory schemes `data:` and `blob:` are always present.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Literal endpoint token meaning "same origin as the host".
pub const SELF_TOKEN: &str = "self";

/// Schemes that stay loadable regardless of the allow-list.
pub const IN_MEMORY_SCHEMES: [&str; 2] = ["data:", "blob:"];

pub const DEFAULT_MAX_EXECUTION_MS: u64 = 8_000;
pub const DEFAULT_IDLE_EXPORT_MS: u64 = 1_500;
pub const DEFAULT_MAX_NETWORK_REQUESTS: u32 = 16;

pub const MAX_EXECUTION_RANGE_MS: (u64, u64) = (2_000, 30_000);
pub const IDLE_EXPORT_RANGE_MS: (u64, u64) = (250, 8_000);
pub const NETWORK_REQUEST_RANGE: (u64, u64) = (1, 64);

/// Upper bound for the host-side timeout guard.
pub const HOST_TIMEOUT_CEILING_MS: u64 = 10_000;
/// Slack the host grants on top of the guest watchdog.
pub const HOST_TIMEOUT_SLACK_MS: u64 = 2_000;

/// Canonical, immutable execution policy for one conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxPolicy {
    /// Normalized allow-list entries, in first-seen order.
    pub allowed_endpoints: Vec<String>,
    /// Guest watchdog deadline, measured from boot.
    pub max_execution_ms: u64,
    /// Quiet period after which the idle trigger exports.
    pub idle_export_ms: u64,
    /// Network attempts permitted before `network-limit`.
    pub max_network_requests: u32,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        normalize(&Value::Null)
    }
}

impl SandboxPolicy {
    /// Parsed allow-list. Entries that cannot be interpreted are skipped.
    pub fn endpoint_specs(&self) -> Vec<EndpointSpec> {
        self.allowed_endpoints
            .iter()
            .filter_map(|e| EndpointSpec::parse(e))
            .collect()
    }

    pub fn max_execution(&self) -> Duration {
        Duration::from_millis(self.max_execution_ms)
    }

    pub fn idle_export(&self) -> Duration {
        Duration::from_millis(self.idle_export_ms)
    }

    /// Host-side guard: `min(10000, maxExecutionMs + 2000)` milliseconds.
    pub fn host_timeout(&self) -> Duration {
        Duration::from_millis(
            (self.max_execution_ms + HOST_TIMEOUT_SLACK_MS).min(HOST_TIMEOUT_CEILING_MS),
        )
    }
}

/// Normalize an untrusted policy candidate.
///
/// Accepts camelCase keys (`maxExecutionMs`) as well as the snake_case form
/// used in configuration files. Anything that is not an object yields the
/// default policy.
pub fn normalize(candidate: &Value) -> SandboxPolicy {
    let obj = candidate.as_object();
    let field = |names: &[&str]| obj.and_then(|o| names.iter().find_map(|n| o.get(*n)));

    SandboxPolicy {
        allowed_endpoints: normalize_endpoints(
            field(&["allowedEndpoints", "allowed_endpoints"]),
        ),
        max_execution_ms: clamp_field(
            field(&["maxExecutionMs", "max_execution_ms"]),
            MAX_EXECUTION_RANGE_MS,
            DEFAULT_MAX_EXECUTION_MS,
        ),
        idle_export_ms: clamp_field(
            field(&["idleExportMs", "idle_export_ms"]),
            IDLE_EXPORT_RANGE_MS,
            DEFAULT_IDLE_EXPORT_MS,
        ),
        max_network_requests: clamp_field(
            field(&["maxNetworkRequests", "max_network_requests"]),
            NETWORK_REQUEST_RANGE,
            DEFAULT_MAX_NETWORK_REQUESTS as u64,
        ) as u32,
    }
}

fn clamp_field(value: Option<&Value>, (lo, hi): (u64, u64), default: u64) -> u64 {
    let numeric = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match numeric.filter(|n| n.is_finite()) {
        Some(n) => n.round().clamp(lo as f64, hi as f64) as u64,
        None => default,
    }
}

fn normalize_endpoints(value: Option<&Value>) -> Vec<String> {
    let mut endpoints: Vec<String> = Vec::new();
    let mut push = |entry: String| {
        if !endpoints.contains(&entry) {
            endpoints.push(entry);
        }
    };

    match value {
        Some(Value::Array(items)) => {
            for entry in items.iter().filter_map(Value::as_str) {
                if let Some(entry) = normalize_endpoint(entry) {
                    push(entry);
                }
            }
        }
        Some(Value::String(single)) => {
            if let Some(entry) = normalize_endpoint(single) {
                push(entry);
            }
        }
        _ => push(SELF_TOKEN.to_string()),
    }

    for scheme in IN_MEMORY_SCHEMES {
        if !endpoints.iter().any(|e| e == scheme) {
            endpoints.push(scheme.to_string());
        }
    }
    endpoints
}

fn normalize_endpoint(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed == SELF_TOKEN {
        return Some(SELF_TOKEN.to_string());
    }
    let stripped = trimmed.trim_end_matches('/');
    if stripped.is_empty() || stripped.chars().any(is_unsafe_endpoint_char) {
        return None;
    }
    Some(stripped.to_string())
}

// Characters that would let an entry escape a CSP source list.
fn is_unsafe_endpoint_char(c: char) -> bool {
    c.is_whitespace()
        || c.is_control()
        || matches!(c, ';' | ',' | '"' | '\'' | '<' | '>' | '`' | '\\')
}

/// Interpreted allow-list entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointSpec {
    /// Same origin as the host document.
    SelfOrigin,
    /// A whole scheme, e.g. `data`.
    Scheme(String),
    /// An ASCII-serialized origin, e.g. `https://cdn.example.com`.
    Origin(String),
    /// A bare hostname, optionally with port.
    Host(String),
    /// Sub-domains of a suffix: `*.example.com` stores `example.com`.
    Wildcard(String),
}

impl EndpointSpec {
    /// Interpret one normalized allow-list entry.
    pub fn parse(entry: &str) -> Option<Self> {
        if entry == SELF_TOKEN {
            return Some(Self::SelfOrigin);
        }
        if let Some(suffix) = entry.strip_prefix("*.") {
            let suffix = suffix.to_ascii_lowercase();
            return (!suffix.is_empty()).then_some(Self::Wildcard(suffix));
        }
        if entry.contains("://") {
            let url = Url::parse(entry).ok()?;
            let origin = url.origin();
            return origin
                .is_tuple()
                .then(|| Self::Origin(origin.ascii_serialization()));
        }
        if let Some(scheme) = entry.strip_suffix(':') {
            if !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
            {
                return Some(Self::Scheme(scheme.to_ascii_lowercase()));
            }
            return None;
        }
        Some(Self::Host(entry.to_ascii_lowercase()))
    }

    /// Source expression for a Content-Security-Policy directive.
    pub fn csp_source(&self) -> String {
        match self {
            Self::SelfOrigin => "'self'".to_string(),
            Self::Scheme(scheme) => format!("{scheme}:"),
            Self::Origin(origin) => origin.clone(),
            Self::Host(host) => host.clone(),
            Self::Wildcard(suffix) => format!("*.{suffix}"),
        }
    }
}
