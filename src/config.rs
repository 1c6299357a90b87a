use std::time::Duration;
use url::Url;

const DEFAULT_SERVER_URL: &str = "http://localhost:5000";
const DEFAULT_LIVE_PATH: &str = "/ws";
const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid SERVER_URL '{value}': {source}")]
    InvalidUrl {
        value: String,
        source: url::ParseError,
    },

    #[error("SERVER_URL must use http or https, got '{0}'")]
    UnsupportedScheme(String),

    #[error("Invalid value for {key}: '{value}'")]
    InvalidNumber { key: &'static str, value: String },
}

/// Runtime configuration, read from the environment after `.env` is loaded.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Base server URL shared by REST calls and the live channel.
    pub server_url: Url,
    pub live_path: String,
    pub access_token: Option<String>,
    pub heartbeat: Duration,
    pub request_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_url = lookup("SERVER_URL").unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        let server_url = parse_server_url(&raw_url)?;

        let live_path = lookup("LIVE_PATH")
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LIVE_PATH.to_string());

        let access_token = lookup("ACCESS_TOKEN").filter(|t| !t.trim().is_empty());

        Ok(Self {
            server_url,
            live_path,
            access_token,
            heartbeat: Duration::from_secs(seconds(
                &lookup,
                "HEARTBEAT_SECS",
                DEFAULT_HEARTBEAT_SECS,
            )?),
            request_timeout: Duration::from_secs(seconds(
                &lookup,
                "REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?),
        })
    }
}

// The base always ends with '/' so relative joins keep any path prefix.
fn parse_server_url(raw: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(raw.trim()).map_err(|source| ConfigError::InvalidUrl {
        value: raw.to_string(),
        source,
    })?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::UnsupportedScheme(url.scheme().to_string()));
    }

    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn seconds<F>(lookup: &F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => match value.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(secs),
            _ => Err(ConfigError::InvalidNumber { key, value }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.server_url.as_str(), "http://localhost:5000/");
        assert_eq!(config.live_path, "/ws");
        assert!(config.access_token.is_none());
        assert_eq!(config.heartbeat, Duration::from_secs(30));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_server_url_keeps_path_prefix() {
        let config = config_from(&[("SERVER_URL", "https://welfare.example.org/backend")]).unwrap();
        assert_eq!(
            config.server_url.as_str(),
            "https://welfare.example.org/backend/"
        );
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            config_from(&[("SERVER_URL", "not a url")]),
            Err(ConfigError::InvalidUrl { .. })
        ));
        assert!(matches!(
            config_from(&[("SERVER_URL", "ftp://files.example.org")]),
            Err(ConfigError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            config_from(&[("HEARTBEAT_SECS", "0")]),
            Err(ConfigError::InvalidNumber {
                key: "HEARTBEAT_SECS",
                ..
            })
        ));
    }

    #[test]
    fn test_blank_token_is_absent() {
        let config = config_from(&[("ACCESS_TOKEN", "  "), ("LIVE_PATH", "/socket")]).unwrap();
        assert!(config.access_token.is_none());
        assert_eq!(config.live_path, "/socket");
    }
}
