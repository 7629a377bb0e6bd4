use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level relay configuration, loaded from TOML with per-field defaults so an
/// absent or partial config file still produces a complete, validated configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub jwt: JwtConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub freemium: FreemiumConfig,
    #[serde(default)]
    pub stripe: StripeConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http_port: u16,
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            bind: "0.0.0.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    /// HMAC signing secret for access JWTs. If empty at startup a random one is
    /// generated and logged as a warning — fine for a single dev process, wrong
    /// for anything that needs tokens to survive a restart or a multi-node fleet.
    pub secret: String,
    pub issuer: String,
    pub access_ttl_sec: u64,
    pub refresh_ttl_sec: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            issuer: "agent-relay".to_string(),
            access_ttl_sec: 900,
            refresh_ttl_sec: 2_592_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    pub ttl_sec: u64,
    pub max_attempts: u32,
    /// Named `rate_per_hour` to match the wire config option name; the window
    /// it's actually evaluated over is `rate_window_sec`, not a literal hour.
    pub rate_per_hour: u32,
    pub rate_window_sec: u64,
    pub allow_legacy_global_agent_secret: bool,
    pub legacy_global_agent_secret: Option<String>,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            ttl_sec: 600,
            max_attempts: 5,
            rate_per_hour: 5,
            rate_window_sec: 60,
            allow_legacy_global_agent_secret: false,
            legacy_global_agent_secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub msg_max_bytes: usize,
    pub offline_queue_max: usize,
    pub offline_ttl_sec: u64,
    pub idle_timeout_sec: u64,
    pub client_msg_rate_per_window: u32,
    pub client_msg_rate_window_sec: u64,
    pub ping_interval_sec: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            msg_max_bytes: 32 * 1024,
            offline_queue_max: 10,
            offline_ttl_sec: 60,
            idle_timeout_sec: 300,
            client_msg_rate_per_window: 60,
            client_msg_rate_window_sec: 60,
            ping_interval_sec: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FreemiumConfig {
    pub free_agent_limit: u32,
}

impl Default for FreemiumConfig {
    fn default() -> Self {
        Self { free_agent_limit: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StripeConfig {
    pub api_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub price_id_pro: Option<String>,
    pub checkout_success_url: Option<String>,
    pub checkout_cancel_url: Option<String>,
    pub portal_return_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./data/relay.sqlite".to_string(),
        }
    }
}

/// Load configuration from a TOML file at the given path. Falls back to
/// defaults if the file doesn't exist — absence is not an error, since a
/// bare `relay-server` binary should still come up for local development.
pub fn load_config(path: &Path) -> Result<RelayConfig> {
    if !path.exists() {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(RelayConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: RelayConfig =
        toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;

    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

impl RelayConfig {
    /// Validate configuration semantics beyond what TOML deserialization checks.
    /// Returns a list of `ERROR:`/`WARNING:` prefixed strings; callers should
    /// abort startup on any `ERROR:` entry and merely log `WARNING:` ones.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.jwt.secret.is_empty() {
            issues.push(
                "WARNING: jwt.secret is empty, a random secret will be generated for this process only (tokens will not survive a restart)"
                    .to_string(),
            );
        }
        if self.jwt.access_ttl_sec == 0 {
            issues.push("ERROR: jwt.access_ttl_sec must be greater than zero".to_string());
        }
        if self.jwt.refresh_ttl_sec <= self.jwt.access_ttl_sec {
            issues.push(
                "ERROR: jwt.refresh_ttl_sec must be greater than jwt.access_ttl_sec".to_string(),
            );
        }
        if self.pairing.max_attempts == 0 {
            issues.push("ERROR: pairing.max_attempts must be greater than zero".to_string());
        }
        if self.router.msg_max_bytes == 0 {
            issues.push("ERROR: router.msg_max_bytes must be greater than zero".to_string());
        }
        if self.router.offline_queue_max == 0 {
            issues.push(
                "WARNING: router.offline_queue_max is zero, chat.request will never be queued for an offline agent"
                    .to_string(),
            );
        }
        if self.pairing.allow_legacy_global_agent_secret
            && self.pairing.legacy_global_agent_secret.is_none()
        {
            issues.push(
                "ERROR: pairing.allow_legacy_global_agent_secret is true but no legacy_global_agent_secret is configured"
                    .to_string(),
            );
        }
        if self.freemium.free_agent_limit == 0 {
            issues.push(
                "WARNING: freemium.free_agent_limit is zero, free-plan accounts can never pair any agent"
                    .to_string(),
            );
        }

        if issues.iter().any(|i| i.starts_with("ERROR:")) {
            Err(issues)
        } else {
            for issue in &issues {
                tracing::warn!("{issue}");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_internally_consistent() {
        let config = RelayConfig::default();
        match config.validate() {
            Ok(()) => {}
            Err(issues) => panic!("expected default config to validate, got {issues:?}"),
        }
    }

    #[test]
    fn rejects_refresh_ttl_not_exceeding_access_ttl() {
        let mut config = RelayConfig::default();
        config.jwt.access_ttl_sec = 900;
        config.jwt.refresh_ttl_sec = 900;
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().iter().any(|i| i.contains("refresh_ttl_sec")));
    }

    #[test]
    fn rejects_legacy_secret_flag_without_secret() {
        let mut config = RelayConfig::default();
        config.pairing.allow_legacy_global_agent_secret = true;
        config.pairing.legacy_global_agent_secret = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml_str = r#"
            [server]
            http_port = 9000

            [freemium]
            free_agent_limit = 3
        "#;
        let config: RelayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.http_port, 9000);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.freemium.free_agent_limit, 3);
        assert_eq!(config.jwt.access_ttl_sec, 900);
    }
}
