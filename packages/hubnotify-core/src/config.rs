use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use url::Url;

/// Default provider host for the authorization page
const DEFAULT_PROVIDER_URL: &str = "https://github.com";

/// Default provider REST API (user lookup, notifications)
const DEFAULT_API_URL: &str = "https://api.github.com";

/// Default identity gateway that exchanges codes for session tokens
const DEFAULT_GATEWAY_URL: &str = "https://hubnotify.app/api";

/// Default callback, served by the loopback launcher
const DEFAULT_CALLBACK_URL: &str = "http://127.0.0.1:8765/callback";

const DEFAULT_SCOPE: &str = "notifications";

/// Environment variable names for overrides
const ENV_CLIENT_ID: &str = "HUBNOTIFY_CLIENT_ID";
const ENV_SCOPE: &str = "HUBNOTIFY_SCOPE";
const ENV_PROVIDER_URL: &str = "HUBNOTIFY_PROVIDER_URL";
const ENV_GATEWAY_URL: &str = "HUBNOTIFY_GATEWAY_URL";
const ENV_API_URL: &str = "HUBNOTIFY_API_URL";
const ENV_CALLBACK_URL: &str = "HUBNOTIFY_CALLBACK_URL";

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    oauth: Option<OAuthSection>,
    endpoints: Option<EndpointsSection>,
}

#[derive(Debug, Deserialize, Default)]
struct OAuthSection {
    /// OAuth application client id registered with the provider
    client_id: Option<String>,
    /// Requested scope (e.g., "notifications")
    scope: Option<String>,
    /// Deep link or loopback URL the provider redirects to
    callback_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct EndpointsSection {
    provider_url: Option<String>,
    gateway_url: Option<String>,
    api_url: Option<String>,
}

/// Where a configuration value came from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfigSource {
    /// Using default hardcoded values
    Default,
    /// Loaded from environment variable
    Environment,
    /// Loaded from config file
    ConfigFile,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::ConfigFile => write!(f, "config file"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigValue {
    pub value: String,
    pub source: ConfigSource,
}

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct Settings {
    /// No default: every deployment registers its own OAuth app.
    pub client_id: Option<ConfigValue>,
    pub scope: ConfigValue,
    pub provider_url: ConfigValue,
    pub gateway_url: ConfigValue,
    pub api_url: ConfigValue,
    pub callback_url: ConfigValue,
}

fn normalize(value: Option<String>, trim_slash: bool) -> Option<String> {
    value
        .map(|v| {
            let v = v.trim();
            if trim_slash {
                v.trim_end_matches('/').to_string()
            } else {
                v.to_string()
            }
        })
        .filter(|v| !v.is_empty())
}

/// Resolve one value with priority environment > config file > default.
fn resolve(env_value: Option<String>, file_value: Option<String>, trim_slash: bool) -> Option<ConfigValue> {
    if let Some(value) = normalize(env_value, trim_slash) {
        return Some(ConfigValue {
            value,
            source: ConfigSource::Environment,
        });
    }
    normalize(file_value, trim_slash).map(|value| ConfigValue {
        value,
        source: ConfigSource::ConfigFile,
    })
}

fn or_default(value: Option<ConfigValue>, default: &str) -> ConfigValue {
    value.unwrap_or_else(|| ConfigValue {
        value: default.to_string(),
        source: ConfigSource::Default,
    })
}

impl Settings {
    fn resolve_with<F>(file: ConfigFile, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let oauth = file.oauth.unwrap_or_default();
        let endpoints = file.endpoints.unwrap_or_default();

        Settings {
            client_id: resolve(env(ENV_CLIENT_ID), oauth.client_id, false),
            scope: or_default(resolve(env(ENV_SCOPE), oauth.scope, false), DEFAULT_SCOPE),
            provider_url: or_default(
                resolve(env(ENV_PROVIDER_URL), endpoints.provider_url, true),
                DEFAULT_PROVIDER_URL,
            ),
            gateway_url: or_default(
                resolve(env(ENV_GATEWAY_URL), endpoints.gateway_url, true),
                DEFAULT_GATEWAY_URL,
            ),
            api_url: or_default(
                resolve(env(ENV_API_URL), endpoints.api_url, true),
                DEFAULT_API_URL,
            ),
            callback_url: or_default(
                resolve(env(ENV_CALLBACK_URL), oauth.callback_url, false),
                DEFAULT_CALLBACK_URL,
            ),
        }
    }

    /// Build the provider authorization page URL.
    ///
    /// `allow_signup` is always false: this flow never creates accounts.
    pub fn authorize_url(&self) -> Result<Url> {
        let client_id = self.client_id.as_ref().with_context(|| {
            format!(
                "No OAuth client id configured. Set {} or oauth.client_id in {}",
                ENV_CLIENT_ID,
                get_config_file_path_string()
            )
        })?;

        let mut url = Url::parse(&format!("{}/login/oauth/authorize", self.provider_url.value))
            .with_context(|| format!("Invalid provider URL: {}", self.provider_url.value))?;
        url.query_pairs_mut()
            .append_pair("client_id", &client_id.value)
            .append_pair("scope", &self.scope.value)
            .append_pair("allow_signup", "false");
        Ok(url)
    }

    /// Whether the callback is served locally over HTTP rather than through
    /// a custom-scheme deep link.
    pub fn uses_loopback_callback(&self) -> bool {
        Url::parse(&self.callback_url.value)
            .map(|u| u.scheme() == "http" && u.host_str().is_some_and(is_loopback_host))
            .unwrap_or(false)
    }
}

fn is_loopback_host(host: &str) -> bool {
    matches!(host, "127.0.0.1" | "localhost" | "[::1]")
}

/// Get the path to the configuration file
fn get_config_file_path() -> Option<PathBuf> {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|p| p.join("hubnotify").join("config.toml"))
}

/// Load configuration from the config file
fn load_config_file() -> Option<ConfigFile> {
    let path = get_config_file_path()?;

    if !path.exists() {
        return None;
    }

    match fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::debug!("Loaded config from {:?}", path);
                Some(config)
            }
            Err(e) => {
                tracing::warn!("Failed to parse config file {:?}: {}", path, e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("Failed to read config file {:?}: {}", path, e);
            None
        }
    }
}

/// Load settings with priority:
/// 1. Environment variables (HUBNOTIFY_*)
/// 2. Config file (~/.config/hubnotify/config.toml)
/// 3. Default values
pub fn load_settings() -> Settings {
    let file = load_config_file().unwrap_or_default();
    let settings = Settings::resolve_with(file, |name| std::env::var(name).ok());

    tracing::debug!(
        "Using gateway {} (from {}), API {} (from {})",
        settings.gateway_url.value,
        settings.gateway_url.source,
        settings.api_url.value,
        settings.api_url.source
    );
    settings
}

/// Get the path to the config file for documentation purposes
pub fn get_config_file_path_string() -> String {
    get_config_file_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "~/.config/hubnotify/config.toml".to_string())
}

/// Generate example config file content
pub fn generate_example_config() -> String {
    r#"# hubnotify configuration
# Place this file at: ~/.config/hubnotify/config.toml

[oauth]
# Client id of your GitHub OAuth app (required)
# client_id = "Iv1.0123456789abcdef"

# Requested scope
# Default: notifications
# scope = "notifications"

# Where GitHub redirects after sign-in. Either a loopback URL served by
# hubnotify itself, or a custom-scheme deep link registered with your OS.
# Default: http://127.0.0.1:8765/callback
# callback_url = "hubnotify://auth"

[endpoints]
# provider_url = "https://github.com"
# gateway_url = "https://hubnotify.app/api"
# api_url = "https://api.github.com"
"#
    .to_string()
}
