//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::OriginAllowlist;
use crate::types::Identity;

/// Top-level sandbox bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<HostConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai: Option<AiConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence: Option<PersistenceConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime: Option<RealtimeConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Origin the host stamps on frames it sends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    /// Origins sandboxed interactions may be mounted from.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_port() -> u16 {
    18790
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Uniform timeout for awaited requests (default: 30000).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,

    /// Origin the client expects host frames to carry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_origin: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    /// Bound on `request_ai_response` (default: 30000).
    #[serde(default = "default_ai_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Apply the display policy to every pushed AI response.
    #[serde(default = "default_true")]
    pub auto_display: bool,
}

fn default_ai_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub base_url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl PersistenceConfig {
    pub fn resolve_api_token(&self) -> Option<String> {
        resolve_secret_field(&self.api_token, &self.api_token_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    pub url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

impl RealtimeConfig {
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "sandbox_bridge_host=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::BridgeError::Io)?;
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::BridgeError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn host_port(&self) -> u16 {
        self.host.as_ref().map(|h| h.port).unwrap_or(18790)
    }

    pub fn host_bind(&self) -> String {
        self.host
            .as_ref()
            .and_then(|h| h.bind.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    pub fn host_origin(&self) -> String {
        self.host
            .as_ref()
            .and_then(|h| h.origin.clone())
            .unwrap_or_else(|| format!("http://localhost:{}", self.host_port()))
    }

    pub fn allowed_origins(&self) -> OriginAllowlist {
        OriginAllowlist::new(
            self.host
                .as_ref()
                .map(|h| h.allowed_origins.clone())
                .unwrap_or_default(),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(
            self.client
                .as_ref()
                .and_then(|c| c.request_timeout_ms)
                .unwrap_or(30_000),
        )
    }

    pub fn ai_response_timeout(&self) -> Duration {
        Duration::from_millis(
            self.ai
                .as_ref()
                .map(|a| a.response_timeout_ms)
                .unwrap_or(30_000),
        )
    }

    pub fn auto_display(&self) -> bool {
        self.ai.as_ref().map(|a| a.auto_display).unwrap_or(true)
    }

    pub fn identity(&self) -> Identity {
        let id = self.identity.clone().unwrap_or_default();
        Identity {
            user_id: id.user_id,
            tenant_id: id.tenant_id,
        }
    }

    /// Get a config value by dotted path (e.g. "host.port", "ai.response_timeout_ms").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(host) = &self.host {
            if host.port == 0 {
                errors.push("Host port cannot be 0".to_string());
            }
            if host.allowed_origins.iter().any(|o| o.trim() == "*") {
                errors.push("Wildcard '*' is not a valid allowed origin".to_string());
            }
        }
        if self.allowed_origins().is_empty() {
            warnings.push("No allowed origins configured; every mount will be rejected".to_string());
        }

        if let Some(p) = &self.persistence {
            if !(p.base_url.starts_with("http://") || p.base_url.starts_with("https://")) {
                errors.push(format!("Persistence base_url is not an http(s) URL: {}", p.base_url));
            }
            if p.resolve_api_token().is_none() {
                warnings.push("Persistence API has no token configured".to_string());
            }
        } else {
            warnings.push("No persistence API configured; persistence calls will fail".to_string());
        }

        if let Some(r) = &self.realtime {
            if !(r.url.starts_with("ws://") || r.url.starts_with("wss://")) {
                errors.push(format!("Realtime url is not a ws(s) URL: {}", r.url));
            }
        }

        let identity = self.identity();
        if identity.user_id.is_none() || identity.tenant_id.is_none() {
            warnings.push("Identity is incomplete (user_id / tenant_id)".to_string());
        }

        (warnings, errors)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for sandbox bridge data: `~/.sandbox_bridge/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sandbox_bridge")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_SB_TOKEN", "tok-123") };
        let input = r#"{"token": "${TEST_SB_TOKEN}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("tok-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_SB_TOKEN") };
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host_port(), 18790);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.ai_response_timeout(), Duration::from_secs(30));
        assert!(config.auto_display());
        assert!(config.allowed_origins().is_empty());
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let config = Config::load(Path::new("/nonexistent/sandbox-bridge.json")).unwrap();
        assert!(config.host.is_none());
    }

    #[test]
    fn test_load_json5_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are fine in JSON5
                host: { port: 9000, allowed_origins: ["https://widgets.example"] },
                ai: { response_timeout_ms: 5000 },
                identity: { user_id: "u-1", tenant_id: "t-1" },
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.host_port(), 9000);
        assert!(config.allowed_origins().allows("https://widgets.example"));
        assert_eq!(config.ai_response_timeout(), Duration::from_secs(5));
        assert!(config.auto_display());
        assert_eq!(config.identity().tenant_id.as_deref(), Some("t-1"));
    }

    #[test]
    fn test_get_path() {
        let config: Config = json5::from_str(r#"{ host: { port: 9001 } }"#).unwrap();
        assert_eq!(config.get_path("host.port"), Some(serde_json::json!(9001)));
        assert!(config.get_path("host.nope").is_none());
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: Config = json5::from_str(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_persistence_resolve_token() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_SB_API_TOKEN", "from-env") };
        let p = PersistenceConfig {
            base_url: "https://api.example".into(),
            api_token: None,
            api_token_env: Some("TEST_SB_API_TOKEN".into()),
            timeout_ms: None,
        };
        assert_eq!(p.resolve_api_token(), Some("from-env".into()));
        unsafe { std::env::remove_var("TEST_SB_API_TOKEN") };
    }

    #[test]
    fn test_validate_rejects_wildcard_origin() {
        let config: Config =
            json5::from_str(r#"{ host: { port: 1, allowed_origins: ["*"] } }"#).unwrap();
        let (_warnings, errors) = config.validate();
        assert!(
            errors.iter().any(|e| e.contains("Wildcard")),
            "Expected a wildcard error, got: {errors:?}"
        );
    }

    #[test]
    fn test_validate_bad_urls() {
        let config: Config = json5::from_str(
            r#"{ persistence: { base_url: "ftp://x" }, realtime: { url: "http://x" } }"#,
        )
        .unwrap();
        let (_warnings, errors) = config.validate();
        assert_eq!(errors.len(), 2, "got: {errors:?}");
    }
}
