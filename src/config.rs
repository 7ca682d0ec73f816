//! Configuration management

use std::{
    env,
    path::{Path, PathBuf},
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before credentials are resolved.
    /// Paths support ~ expansion. Loaded in order; missing files are skipped.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// API-key admission configuration
    pub auth: AuthConfig,
    /// Realtime channel configuration
    pub channel: ChannelConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: vec![".env".to_string()],
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Cross-origin policy for HTTP routes
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            cors: CorsConfig::default(),
        }
    }
}

/// API-key admission configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Request header carrying the API key
    pub header: String,

    /// Every path under this prefix requires a valid key
    pub protected_prefix: String,

    /// Valid API keys (each supports `env:VAR_NAME`)
    pub api_keys: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            header: "x-api-key".to_string(),
            protected_prefix: "/api".to_string(),
            api_keys: Vec::new(),
        }
    }
}

impl AuthConfig {
    /// Resolve API keys (expand `env:` references).
    ///
    /// A reference to an unset variable yields no key at all, so the
    /// reference text itself never becomes a credential.
    #[must_use]
    pub fn resolve_api_keys(&self) -> Vec<String> {
        self.api_keys.iter().filter_map(|key| resolve_secret(key)).collect()
    }
}

/// Resolve a secret value: `env:VAR_NAME` reads the variable, anything else
/// is taken literally.
fn resolve_secret(value: &str) -> Option<String> {
    let Some(var_name) = value.strip_prefix("env:") else {
        return Some(value.to_string());
    };

    match env::var(var_name) {
        Ok(secret) => Some(secret),
        Err(e) => {
            tracing::warn!("Skipping API key {value}: {e}");
            None
        }
    }
}

/// Expand a leading `~/` to the home directory
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Realtime channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Enable the WebSocket upgrade endpoint
    pub enabled: bool,
    /// Upgrade path
    pub path: String,
    /// Outbound event queue size per connection
    pub buffer_size: usize,
    /// Cross-origin policy for upgrade requests
    pub cors: CorsConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/ws".to_string(),
            buffer_size: 64,
            cors: CorsConfig {
                allowed_origins: vec!["*".to_string()],
                allowed_methods: vec!["GET".to_string(), "POST".to_string()],
            },
        }
    }
}

impl ChannelConfig {
    /// Upgrade path as routed: requests arrive with trailing slashes
    /// trimmed, so the path is trimmed the same way (`/ws/` serves `/ws`).
    #[must_use]
    pub fn upgrade_path(&self) -> String {
        let trimmed = self.path.trim_end_matches('/');
        if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() }
    }
}

/// Cross-origin allow-lists
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Allowed origins (`"*"` allows any origin)
    pub allowed_origins: Vec<String>,
    /// Allowed methods (`"*"` allows any method)
    pub allowed_methods: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: ["GET", "HEAD", "PUT", "PATCH", "POST", "DELETE"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (ZENTH_GATEWAY_ prefix)
        figment = figment.merge(Env::prefixed("ZENTH_GATEWAY_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files must be in the process environment before `env:` keys resolve
        config.load_env_files();
        config.validate()?;

        Ok(config)
    }

    /// Load `env_files` into the process environment, in order.
    /// Missing files are skipped.
    fn load_env_files(&self) {
        for entry in &self.env_files {
            let path = expand_home(entry);
            if !path.is_file() {
                tracing::debug!(path = %path.display(), "Env file absent, skipped");
                continue;
            }
            if let Err(e) = dotenvy::from_path(&path) {
                tracing::warn!(path = %path.display(), error = %e, "Could not load env file");
            } else {
                tracing::info!(path = %path.display(), "Loaded env file");
            }
        }
    }

    /// Check the values the gateway cannot start without
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.auth.header.trim().is_empty() {
            return Err(Error::Config("auth.header must not be empty".to_string()));
        }
        if !self.auth.protected_prefix.starts_with('/') {
            return Err(Error::Config(format!(
                "auth.protected_prefix must start with '/': {}",
                self.auth.protected_prefix
            )));
        }
        if self.channel.enabled {
            if !self.channel.path.starts_with('/') {
                return Err(Error::Config(format!(
                    "channel.path must start with '/': {}",
                    self.channel.path
                )));
            }
            if self.channel.buffer_size == 0 {
                return Err(Error::Config(
                    "channel.buffer_size must be greater than 0".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.server.port, 4000);
        assert_eq!(config.auth.header, "x-api-key");
        assert_eq!(config.auth.protected_prefix, "/api");
        assert_eq!(config.channel.path, "/ws");
        assert_eq!(config.server.cors.allowed_origins, vec!["*"]);
        assert_eq!(config.channel.cors.allowed_methods, vec!["GET", "POST"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolve_literal_and_env_keys() {
        let auth = AuthConfig {
            api_keys: vec![
                "literal".to_string(),
                "env:PATH".to_string(),
                "env:ZENTH_TEST_UNSET_KEY".to_string(),
            ],
            ..AuthConfig::default()
        };

        let mut expected = vec!["literal".to_string()];
        expected.extend(env::var("PATH").ok());
        assert_eq!(auth.resolve_api_keys(), expected);
    }

    #[test]
    fn test_unset_env_key_is_not_a_credential() {
        let auth = AuthConfig {
            api_keys: vec!["env:ZENTH_TEST_UNSET_KEY".to_string()],
            ..AuthConfig::default()
        };

        assert!(auth.resolve_api_keys().is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.auth.protected_prefix = "api".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.auth.header = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.channel.buffer_size = 0;
        assert!(config.validate().is_err());

        // Disabled channel settings are not checked
        config.channel.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_upgrade_path_trims_trailing_slash() {
        let mut channel = ChannelConfig::default();
        assert_eq!(channel.upgrade_path(), "/ws");

        channel.path = "/ws/".to_string();
        assert_eq!(channel.upgrade_path(), "/ws");

        channel.path = "/".to_string();
        assert_eq!(channel.upgrade_path(), "/");
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/etc/zenth.env"), PathBuf::from("/etc/zenth.env"));
        assert_eq!(expand_home(".env"), PathBuf::from(".env"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/.zenth.env"), home.join(".zenth.env"));
        }
    }

    #[test]
    fn test_missing_config_file() {
        let result = Config::load(Some(Path::new("/nonexistent/zenth.yaml")));
        assert!(matches!(result, Err(Error::Config(msg)) if msg.contains("not found")));
    }
}
