//! Document builder: textual injection of the security policy, configuration
//! payload and guest-runtime reference into untrusted markup.
//!
//! Nothing here parses or executes the untrusted content. The only structure
//! recognized is the opening `<head>` or `<html>` tag used as a splice point.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, SandboxError};
use crate::policy::{EndpointSpec, SandboxPolicy, IN_MEMORY_SCHEMES};

/// URL of the guest-runtime bootstrap script.
pub const GUEST_RUNTIME_SRC: &str = "scenebox://guest-runtime.js";

/// Global the configuration payload is assigned to.
pub const CONFIG_GLOBAL: &str = "__SCENEBOX_CONFIG__";

static HEAD_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<head(?:\s[^>]*)?>").unwrap());
static HTML_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<html(?:\s[^>]*)?>").unwrap());

/// Default maximum document size: 2 MB.
pub const DEFAULT_MAX_DOCUMENT_SIZE: usize = 2 * 1024 * 1024;

/// Caller-supplied facts about the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    pub file_name: String,
    /// Origin the `self` endpoint resolves to. `None` means opaque.
    #[serde(default)]
    pub origin: Option<String>,
}

/// What the guest runtime reads before any guest code runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestConfig {
    pub policy: SandboxPolicy,
    pub metadata: DocumentMetadata,
}

/// Fully assembled document handed to an execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapDocument {
    /// Spliced markup.
    pub html: String,
    /// Content-Security-Policy directive string embedded in `html`.
    pub csp: String,
    /// The configuration embedded in `html`, kept typed for the runtime.
    pub config: GuestConfig,
}

impl BootstrapDocument {
    pub fn file_name(&self) -> &str {
        &self.config.metadata.file_name
    }
}

/// Reject empty or oversized content before any context is created.
pub fn validate_content(content: &str, max_size: usize) -> Result<(), SandboxError> {
    if content.len() > max_size {
        return Err(SandboxError::new(
            ErrorCode::InvalidDocument,
            format!(
                "document too large: {} bytes (max {} bytes)",
                content.len(),
                max_size
            ),
        )
        .with_detail("size", content.len())
        .with_detail("max", max_size));
    }
    if content.trim().is_empty() {
        return Err(SandboxError::new(
            ErrorCode::InvalidDocument,
            "document is empty",
        ));
    }
    Ok(())
}

/// Assemble the bootstrap document.
pub fn build(raw: &str, policy: &SandboxPolicy, metadata: &DocumentMetadata) -> BootstrapDocument {
    let csp = content_security_policy(policy);
    let config = GuestConfig {
        policy: policy.clone(),
        metadata: metadata.clone(),
    };

    let injected = format!(
        concat!(
            "<meta http-equiv=\"Content-Security-Policy\" content=\"{csp}\">",
            "<script>window.{global} = {payload};</script>",
            "<script src=\"{src}\"></script>"
        ),
        csp = csp,
        global = CONFIG_GLOBAL,
        payload = config_payload(&config),
        src = GUEST_RUNTIME_SRC,
    );

    BootstrapDocument {
        html: splice_head(raw, &injected),
        csp,
        config,
    }
}

/// Directive string blocking every outbound category except the allow-list
/// and in-memory schemes.
pub fn content_security_policy(policy: &SandboxPolicy) -> String {
    let mut sources: Vec<String> = Vec::new();
    for spec in policy.endpoint_specs() {
        let source = spec.csp_source();
        if !sources.contains(&source) {
            sources.push(source);
        }
    }
    for scheme in IN_MEMORY_SCHEMES {
        let source = EndpointSpec::Scheme(scheme.trim_end_matches(':').to_string()).csp_source();
        if !sources.contains(&source) {
            sources.push(source);
        }
    }
    let allowed = sources.join(" ");
    let runtime_scheme = GUEST_RUNTIME_SRC
        .split_once("://")
        .map(|(scheme, _)| scheme)
        .unwrap_or("scenebox");

    [
        "default-src 'none'".to_string(),
        format!("script-src {allowed} {runtime_scheme}: 'unsafe-inline'"),
        format!("connect-src {allowed}"),
        format!("img-src {allowed}"),
        format!("media-src {allowed}"),
        format!("font-src {allowed}"),
        format!("style-src {allowed} 'unsafe-inline'"),
        format!("worker-src {allowed}"),
    ]
    .join("; ")
}

fn config_payload(config: &GuestConfig) -> String {
    // Serialization of plain data cannot fail; fall back to an empty object anyway.
    let json = serde_json::to_string(config).unwrap_or_else(|_| "{}".to_string());
    json.replace("</", "<\\/")
}

fn splice_head(raw: &str, injected: &str) -> String {
    if let Some(m) = HEAD_TAG_RE.find(raw) {
        return format!("{}{}{}", &raw[..m.end()], injected, &raw[m.end()..]);
    }
    if let Some(m) = HTML_TAG_RE.find(raw) {
        return format!(
            "{}<head>{}</head>{}",
            &raw[..m.end()],
            injected,
            &raw[m.end()..]
        );
    }
    format!("<!DOCTYPE html><html><head>{injected}</head><body>{raw}</body></html>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::normalize;
    use serde_json::json;

    fn meta() -> DocumentMetadata {
        DocumentMetadata {
            file_name: "scene.html".into(),
            origin: None,
        }
    }

    #[test]
    fn injects_after_existing_head() {
        let doc = build(
            "<html><HEAD lang=\"en\"><title>x</title></HEAD><body></body></html>",
            &SandboxPolicy::default(),
            &meta(),
        );
        let head_end = doc.html.find("<HEAD lang=\"en\">").unwrap() + "<HEAD lang=\"en\">".len();
        assert!(doc.html[head_end..].starts_with("<meta http-equiv=\"Content-Security-Policy\""));
        assert!(doc.html.contains(GUEST_RUNTIME_SRC));
        assert!(doc.html.find(GUEST_RUNTIME_SRC).unwrap() < doc.html.find("<title>").unwrap());
    }

    #[test]
    fn synthesizes_head_inside_html() {
        let doc = build("<html><body>hi</body></html>", &SandboxPolicy::default(), &meta());
        assert!(doc.html.starts_with("<html><head><meta"));
        assert!(doc.html.ends_with("</head><body>hi</body></html>"));
    }

    #[test]
    fn wraps_fragments() {
        let doc = build("<script>go()</script>", &SandboxPolicy::default(), &meta());
        assert!(doc.html.starts_with("<!DOCTYPE html><html><head>"));
        assert!(doc.html.ends_with("<body><script>go()</script></body></html>"));
    }

    #[test]
    fn headers_is_not_a_head_tag() {
        let doc = build("<headers></headers>", &SandboxPolicy::default(), &meta());
        assert!(doc.html.starts_with("<!DOCTYPE html>"));
    }

    #[test]
    fn config_payload_cannot_close_the_script() {
        let metadata = DocumentMetadata {
            file_name: "</script><script>alert(1)</script>.html".into(),
            origin: None,
        };
        let doc = build("<p>x</p>", &SandboxPolicy::default(), &metadata);
        assert!(!doc.html.contains("</script><script>alert(1)"));
        assert!(doc.html.contains("<\\/script>"));
        assert_eq!(doc.config.metadata, metadata);
    }

    #[test]
    fn csp_blocks_by_default_and_lists_allowed_sources() {
        let policy = normalize(&json!({
            "allowedEndpoints": ["self", "https://cdn.example.com/", "*.assets.test"]
        }));
        let csp = content_security_policy(&policy);
        assert!(csp.starts_with("default-src 'none'"));
        for directive in [
            "script-src",
            "connect-src",
            "img-src",
            "media-src",
            "font-src",
            "style-src",
            "worker-src",
        ] {
            let part = csp
                .split("; ")
                .find(|d| d.starts_with(directive))
                .unwrap_or_else(|| panic!("missing {directive}"));
            assert!(part.contains("'self'"));
            assert!(part.contains("https://cdn.example.com"));
            assert!(part.contains("*.assets.test"));
            assert!(part.contains("data:"));
            assert!(part.contains("blob:"));
        }
        assert!(!csp.contains("connect-src *"));
    }

    #[test]
    fn validation_rejects_empty_and_oversized() {
        assert_eq!(
            validate_content("   ", 10).unwrap_err().code,
            ErrorCode::InvalidDocument
        );
        let err = validate_content("<p>too long</p>", 4).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidDocument);
        assert_eq!(err.detail["max"], 4);
        assert!(validate_content("<p>ok</p>", 64).is_ok());
    }
}
