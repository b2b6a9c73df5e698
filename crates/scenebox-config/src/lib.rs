//! # scenebox-config
//!
//! Configuration loading for scenebox.
//!
//! Reads a TOML file, substituting `${VAR}` references from the environment.
//! Policy values are only a candidate: the sandbox normalizes them again
//! before any guest runs.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! execution_mode = "isolate"      # or "process"
//! max_document_kb = 512
//! max_heap_mb = 128
//! max_concurrent = 4
//! max_log_entries = 200
//!
//! [policy]
//! allowed_endpoints = ["self", "https://${ASSET_HOST}"]
//! max_execution_ms = 8000
//! idle_export_ms = 1500
//! max_network_requests = 16
//!
//! [audit]
//! tracing = true
//! jsonl_path = "/var/log/scenebox/audit.jsonl"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Why a config could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level scenebox configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SceneboxConfig {
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Default policy candidate for every conversion.
    #[serde(default)]
    pub policy: PolicyOverrides,

    #[serde(default)]
    pub audit: AuditSettings,
}

/// Host-side sandbox overrides. Absent values keep the sandbox defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxOverrides {
    /// `"isolate"` (default) or `"process"`.
    #[serde(default)]
    pub execution_mode: Option<String>,

    #[serde(default)]
    pub max_document_kb: Option<usize>,

    /// Maximum V8 heap size in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Guest log lines retained per conversion.
    #[serde(default)]
    pub max_log_entries: Option<usize>,

    /// Log lines attached to a failed conversion.
    #[serde(default)]
    pub error_log_tail: Option<usize>,
}

/// Policy candidate. Out-of-range numbers are clamped later, not rejected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyOverrides {
    #[serde(default)]
    pub allowed_endpoints: Option<Vec<String>>,
    #[serde(default)]
    pub max_execution_ms: Option<i64>,
    #[serde(default)]
    pub idle_export_ms: Option<i64>,
    #[serde(default)]
    pub max_network_requests: Option<i64>,
}

/// Where conversion audit records go.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditSettings {
    /// Emit audit records as tracing events.
    #[serde(default)]
    pub tracing: bool,

    /// Append audit records as JSON lines to this file.
    #[serde(default)]
    pub jsonl_path: Option<PathBuf>,
}

impl PolicyOverrides {
    /// The candidate in the wire shape the policy normalizer reads.
    pub fn to_candidate(&self) -> Value {
        let mut map = Map::new();
        if let Some(endpoints) = &self.allowed_endpoints {
            map.insert("allowedEndpoints".into(), endpoints.clone().into());
        }
        if let Some(ms) = self.max_execution_ms {
            map.insert("maxExecutionMs".into(), ms.into());
        }
        if let Some(ms) = self.idle_export_ms {
            map.insert("idleExportMs".into(), ms.into());
        }
        if let Some(n) = self.max_network_requests {
            map.insert("maxNetworkRequests".into(), n.into());
        }
        Value::Object(map)
    }
}

impl SceneboxConfig {
    /// Parse TOML without touching the environment.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: SceneboxConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a file as-is.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let sandbox = &self.sandbox;
        if let Some(mode) = &sandbox.execution_mode {
            if !matches!(mode.as_str(), "isolate" | "process") {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.execution_mode: unsupported mode '{mode}', supported: isolate, process"
                )));
            }
        }
        let positive = [
            ("max_document_kb", sandbox.max_document_kb),
            ("max_concurrent", sandbox.max_concurrent),
            ("max_log_entries", sandbox.max_log_entries),
        ];
        for (name, value) in positive {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.{name} must be greater than zero"
                )));
            }
        }
        if let Some(heap) = sandbox.max_heap_mb {
            if heap < 16 {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.max_heap_mb must be at least 16, got {heap}"
                )));
            }
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns using environment variables. Unknown
/// variables are left in place.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => result.push_str(&format!("${{{var_name}}}")),
            }
        } else {
            result.push(ch);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_valid() {
        let config = SceneboxConfig::from_toml("").unwrap();
        assert!(config.sandbox.execution_mode.is_none());
        assert_eq!(config.policy.to_candidate(), serde_json::json!({}));
        assert!(!config.audit.tracing);
    }

    #[test]
    fn parses_full_example() {
        let toml = r#"
            [sandbox]
            execution_mode = "process"
            max_document_kb = 512
            max_heap_mb = 128
            max_concurrent = 4
            max_log_entries = 200
            error_log_tail = 20

            [policy]
            allowed_endpoints = ["self", "https://cdn.example.com"]
            max_execution_ms = 8000
            idle_export_ms = 1500
            max_network_requests = 16

            [audit]
            tracing = true
            jsonl_path = "audit.jsonl"
        "#;
        let config = SceneboxConfig::from_toml(toml).unwrap();
        assert_eq!(config.sandbox.execution_mode.as_deref(), Some("process"));
        assert_eq!(config.sandbox.max_heap_mb, Some(128));
        assert_eq!(config.sandbox.error_log_tail, Some(20));
        assert!(config.audit.tracing);
        assert_eq!(config.audit.jsonl_path, Some(PathBuf::from("audit.jsonl")));

        let candidate = config.policy.to_candidate();
        assert_eq!(candidate["allowedEndpoints"][1], "https://cdn.example.com");
        assert_eq!(candidate["maxExecutionMs"], 8000);
        assert_eq!(candidate["maxNetworkRequests"], 16);
    }

    #[test]
    fn out_of_range_policy_values_are_kept_for_the_normalizer() {
        let config = SceneboxConfig::from_toml(
            r#"
            [policy]
            max_execution_ms = -5
            max_network_requests = 1000
        "#,
        )
        .unwrap();
        let candidate = config.policy.to_candidate();
        assert_eq!(candidate["maxExecutionMs"], -5);
        assert_eq!(candidate["maxNetworkRequests"], 1000);
        assert!(candidate.get("idleExportMs").is_none());
    }

    #[test]
    fn expands_environment_variables() {
        std::env::set_var("SCENEBOX_TEST_ASSET_HOST", "assets.example.com");
        let toml = r#"
            [policy]
            allowed_endpoints = ["https://${SCENEBOX_TEST_ASSET_HOST}", "${SCENEBOX_TEST_UNSET}"]
        "#;
        let config = SceneboxConfig::from_toml_with_env(toml).unwrap();
        std::env::remove_var("SCENEBOX_TEST_ASSET_HOST");
        let endpoints = config.policy.allowed_endpoints.unwrap();
        assert_eq!(endpoints[0], "https://assets.example.com");
        assert_eq!(endpoints[1], "${SCENEBOX_TEST_UNSET}");
    }

    #[test]
    fn rejects_unknown_mode() {
        let err = SceneboxConfig::from_toml("[sandbox]\nexecution_mode = \"wasm\"").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("wasm"), "{msg}");
        assert!(msg.contains("isolate"), "{msg}");
    }

    #[test]
    fn rejects_zero_limits_and_tiny_heaps() {
        assert!(SceneboxConfig::from_toml("[sandbox]\nmax_concurrent = 0").is_err());
        assert!(SceneboxConfig::from_toml("[sandbox]\nmax_heap_mb = 4").is_err());
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = SceneboxConfig::from_toml("[sandbox]\ntimeout_secs = 5").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenebox.toml");
        std::fs::write(&path, "[sandbox]\nmax_concurrent = 2\n").unwrap();
        let config = SceneboxConfig::from_file(&path).unwrap();
        assert_eq!(config.sandbox.max_concurrent, Some(2));
    }
}
