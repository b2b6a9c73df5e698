//! Network guard: allow-list and quota applied to every outbound attempt.

use url::Url;

use crate::error::ErrorCode;
use crate::policy::{EndpointSpec, SandboxPolicy};
use crate::protocol::NetworkChannel;

/// Schemes that never leave the isolate.
const LOCAL_SCHEMES: [&str; 3] = ["data", "blob", "about"];

/// A rejected attempt. Always terminal for the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub code: ErrorCode,
    pub message: String,
    pub url: String,
    pub channel: NetworkChannel,
}

#[derive(Debug, Clone)]
pub struct NetworkGuard {
    specs: Vec<EndpointSpec>,
    origin: Option<Url>,
    max_requests: u32,
}

impl NetworkGuard {
    /// `origin` is what `self` and relative URLs resolve against. Opaque or
    /// unparsable origins are treated as absent.
    pub fn new(policy: &SandboxPolicy, origin: Option<&str>) -> Self {
        let origin = origin
            .and_then(|o| Url::parse(o).ok())
            .filter(|u| u.origin().is_tuple());
        Self {
            specs: policy.endpoint_specs(),
            origin,
            max_requests: policy.max_network_requests,
        }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Check one attempt. `count` is the guest's request counter and every
    /// attempt increments it, in-memory schemes included. Those skip only the
    /// allow-list.
    ///
    /// Returns the resolved URL to hand to the transport.
    pub fn admit(
        &self,
        count: &mut u32,
        raw: &str,
        channel: NetworkChannel,
    ) -> Result<String, Violation> {
        let raw = raw.trim();
        let violation = |code: ErrorCode, message: String| Violation {
            code,
            message,
            url: raw.to_string(),
            channel,
        };

        let resolved = match Url::parse(raw) {
            Ok(url) => Some(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => match &self.origin {
                Some(origin) => Some(origin.join(raw).map_err(|e| {
                    violation(ErrorCode::NetworkBlocked, format!("invalid URL {raw:?}: {e}"))
                })?),
                None => None,
            },
            Err(e) => {
                return Err(violation(
                    ErrorCode::NetworkBlocked,
                    format!("invalid URL {raw:?}: {e}"),
                ))
            }
        };

        *count = count.saturating_add(1);
        if *count > self.max_requests {
            return Err(violation(
                ErrorCode::NetworkLimit,
                format!(
                    "network request limit exceeded ({} of max {})",
                    count, self.max_requests
                ),
            ));
        }

        if let Some(url) = &resolved {
            if LOCAL_SCHEMES.contains(&url.scheme()) {
                return Ok(url.to_string());
            }
        }

        let allowed = match &resolved {
            Some(url) => self.is_allowed(url),
            // Relative URL with an opaque origin: only `self` can cover it.
            None => self.specs.contains(&EndpointSpec::SelfOrigin),
        };
        if !allowed {
            return Err(violation(
                ErrorCode::NetworkBlocked,
                format!("{} to {} is not in the allow-list", channel.as_str(), raw),
            ));
        }
        Ok(resolved.map_or_else(|| raw.to_string(), |u| u.to_string()))
    }

    fn is_allowed(&self, url: &Url) -> bool {
        let origin = effective_origin(url);
        let host = url.host_str().map(str::to_ascii_lowercase);
        let port = url.port_or_known_default();

        self.specs.iter().any(|spec| match spec {
            EndpointSpec::SelfOrigin => match (&self.origin, &origin) {
                (Some(own), Some(target)) => effective_origin(own).as_ref() == Some(target),
                _ => false,
            },
            EndpointSpec::Scheme(scheme) => url.scheme() == scheme,
            EndpointSpec::Origin(allowed) => origin.as_deref() == Some(allowed.as_str()),
            EndpointSpec::Host(allowed) => match (&host, port) {
                (Some(h), Some(p)) => allowed == h || *allowed == format!("{h}:{p}"),
                (Some(h), None) => allowed == h,
                _ => false,
            },
            EndpointSpec::Wildcard(suffix) => host
                .as_deref()
                .and_then(|h| h.strip_suffix(suffix.as_str()))
                .is_some_and(|prefix| prefix.len() > 1 && prefix.ends_with('.')),
        })
    }
}

/// ASCII origin with socket schemes folded onto their HTTP equivalents.
fn effective_origin(url: &Url) -> Option<String> {
    let scheme = match url.scheme() {
        "ws" => "http",
        "wss" => "https",
        other => other,
    };
    if !matches!(scheme, "http" | "https") {
        let origin = url.origin();
        return origin.is_tuple().then(|| origin.ascii_serialization());
    }
    let host = url.host_str()?;
    let default_port = if scheme == "https" { 443 } else { 80 };
    Some(match url.port_or_known_default() {
        Some(port) if port != default_port => format!("{scheme}://{host}:{port}"),
        _ => format!("{scheme}://{host}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::normalize;
    use serde_json::json;

    fn guard(endpoints: serde_json::Value, origin: Option<&str>) -> NetworkGuard {
        let policy = normalize(&json!({
            "allowedEndpoints": endpoints,
            "maxNetworkRequests": 3,
        }));
        NetworkGuard::new(&policy, origin)
    }

    #[test]
    fn self_matches_same_origin_only() {
        let g = guard(json!(["self"]), Some("https://app.example.com"));
        let mut n = 0;
        assert!(g.admit(&mut n, "https://app.example.com/a.js", NetworkChannel::Script).is_ok());
        assert_eq!(
            g.admit(&mut n, "https://evil.test/x", NetworkChannel::Fetch).unwrap_err().code,
            ErrorCode::NetworkBlocked
        );
        assert_eq!(n, 2);
    }

    #[test]
    fn relative_urls_resolve_against_origin() {
        let g = guard(json!(["self"]), Some("https://app.example.com/docs/"));
        let mut n = 0;
        assert_eq!(
            g.admit(&mut n, "/models/a.bin", NetworkChannel::Fetch).unwrap(),
            "https://app.example.com/models/a.bin"
        );
    }

    #[test]
    fn relative_urls_without_origin_need_self() {
        let mut n = 0;
        assert!(guard(json!(["self"]), None)
            .admit(&mut n, "a.png", NetworkChannel::Asset)
            .is_ok());
        assert!(guard(json!(["https://cdn.test"]), None)
            .admit(&mut n, "a.png", NetworkChannel::Asset)
            .is_err());
    }

    #[test]
    fn in_memory_schemes_skip_the_allow_list() {
        let g = guard(json!([]), None);
        let mut n = 0;
        for url in ["data:text/plain,hi", "blob:https://x/1", "about:blank"] {
            assert!(g.admit(&mut n, url, NetworkChannel::Asset).is_ok());
        }
        assert_eq!(n, 3);
    }

    #[test]
    fn in_memory_schemes_count_against_the_quota() {
        let policy = normalize(&json!({
            "allowedEndpoints": ["https://cdn.test"],
            "maxNetworkRequests": 1,
        }));
        let g = NetworkGuard::new(&policy, None);
        let mut n = 0;
        g.admit(&mut n, "https://cdn.test/a", NetworkChannel::Fetch).unwrap();
        for url in ["data:text/plain,hi", "blob:https://x/1", "about:blank"] {
            let err = g.admit(&mut n, url, NetworkChannel::Asset).unwrap_err();
            assert_eq!(err.code, ErrorCode::NetworkLimit);
        }
    }

    #[test]
    fn quota_applies_even_to_allowed_hosts() {
        let g = guard(json!(["https://cdn.test"]), None);
        let mut n = 0;
        for _ in 0..3 {
            g.admit(&mut n, "https://cdn.test/a", NetworkChannel::Fetch).unwrap();
        }
        let err = g
            .admit(&mut n, "https://cdn.test/a", NetworkChannel::Fetch)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NetworkLimit);
    }

    #[test]
    fn sockets_match_http_origins() {
        let g = guard(json!(["https://live.test"]), None);
        let mut n = 0;
        assert!(g.admit(&mut n, "wss://live.test/feed", NetworkChannel::WebSocket).is_ok());
        assert!(g.admit(&mut n, "ws://live.test/feed", NetworkChannel::WebSocket).is_err());
    }

    #[test]
    fn wildcard_matches_subdomains_only() {
        let g = guard(json!(["*.assets.test"]), None);
        let mut n = 0;
        assert!(g.admit(&mut n, "https://a.assets.test/x", NetworkChannel::Asset).is_ok());
        assert!(g.admit(&mut n, "https://assets.test/x", NetworkChannel::Asset).is_err());
        assert!(g.admit(&mut n, "https://badassets.test/x", NetworkChannel::Asset).is_err());
    }

    #[test]
    fn bare_host_with_port() {
        let g = guard(json!(["localhost:8080", "cdn.test"]), None);
        let mut n = 0;
        assert!(g.admit(&mut n, "http://localhost:8080/a", NetworkChannel::Fetch).is_ok());
        assert!(g.admit(&mut n, "http://localhost:9090/a", NetworkChannel::Fetch).is_err());
        let g = guard(json!(["cdn.test"]), None);
        assert!(g.admit(&mut 0, "https://cdn.test/a", NetworkChannel::Fetch).is_ok());
    }

    #[test]
    fn garbage_is_blocked() {
        let g = guard(json!(["self"]), None);
        let err = g
            .admit(&mut 0, "http://[::1", NetworkChannel::Xhr)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NetworkBlocked);
        assert_eq!(err.channel, NetworkChannel::Xhr);
    }
}
