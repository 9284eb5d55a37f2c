use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::debug;

/// Placeholder substituted with the target origin when rendering helper args.
pub const ORIGIN_PLACEHOLDER: &str = "{origin}";

/// Credential helper invocation: one program, two argument templates.
/// Each argument may contain `{origin}`, replaced with the target origin
/// (scheme://host[:port]) at invocation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperConfig {
    #[serde(default = "default_helper_program")]
    pub program: String,
    #[serde(default = "default_token_args")]
    pub token_args: Vec<String>,
    #[serde(default = "default_login_args")]
    pub login_args: Vec<String>,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            program: default_helper_program(),
            token_args: default_token_args(),
            login_args: default_login_args(),
        }
    }
}

fn default_helper_program() -> String {
    "cloudflared".to_string()
}

fn default_token_args() -> Vec<String> {
    vec![
        "access".to_string(),
        "token".to_string(),
        format!("--app={ORIGIN_PLACEHOLDER}"),
    ]
}

fn default_login_args() -> Vec<String> {
    vec![
        "access".to_string(),
        "login".to_string(),
        ORIGIN_PLACEHOLDER.to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Additional forwarding attempts beyond the first.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Lifetime of a cached credential, from the moment it is stored.
    #[serde(default = "default_cache_timeout_ms")]
    pub cache_timeout_ms: u64,
    /// Path marker preceding the target URL in inbound requests.
    #[serde(default = "default_proxy_prefix")]
    pub proxy_prefix: String,
    /// Cookie name carrying the credential on forwarded requests.
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default)]
    pub helper: HelperConfig,
}

fn default_port() -> u16 {
    3000
}

fn default_retry_count() -> u32 {
    3
}

fn default_cache_timeout_ms() -> u64 {
    3_600_000
}

fn default_proxy_prefix() -> String {
    "/curl/".to_string()
}

fn default_cookie_name() -> String {
    "CF_Authorization".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            retry_count: default_retry_count(),
            cache_timeout_ms: default_cache_timeout_ms(),
            proxy_prefix: default_proxy_prefix(),
            cookie_name: default_cookie_name(),
            helper: HelperConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let cfg: Config = serde_json::from_str(&raw).context("parsing config JSON")?;
        Ok(cfg)
    }

    /// Load from `path` when it exists, otherwise start from defaults;
    /// env overrides are applied on top either way.
    pub fn load(path: &str) -> Result<Self> {
        let mut cfg = if std::path::Path::new(path).is_file() {
            Self::from_file(path)?
        } else {
            debug!(path = %path, "config file not found, using defaults");
            Self::default()
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(port) = env_parse("ACCESS_PROXY_PORT") {
            self.port = port;
        }
        if let Some(retries) = env_parse("ACCESS_PROXY_RETRY_COUNT") {
            self.retry_count = retries;
        }
        if let Some(timeout) = env_parse("ACCESS_PROXY_CACHE_TIMEOUT_MS") {
            self.cache_timeout_ms = timeout;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
