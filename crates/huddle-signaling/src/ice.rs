//! Relay/reflexive server list handed to each new peer connection.

use std::env;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
const ICE_SCHEMES: [&str; 4] = ["stun", "stuns", "turn", "turns"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

pub trait IceServerResolver: Send + Sync {
    fn resolve(&self) -> Vec<IceServer>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
    /// Localhost-only operation: no servers at all.
    pub disable_stun: bool,
}

impl IceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let stun_urls = env::var("HUDDLE_ICE_URLS")
            .map(|raw| split_urls(&raw))
            .unwrap_or_else(|_| vec![DEFAULT_STUN_URL.to_string()]);
        let turn_urls = env::var("HUDDLE_TURN_URLS")
            .map(|raw| split_urls(&raw))
            .unwrap_or_default();
        let disable_stun = env::var("HUDDLE_DISABLE_STUN")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let config = Self {
            stun_urls,
            turn_urls,
            turn_username: env::var("HUDDLE_TURN_USERNAME").ok(),
            turn_credential: env::var("HUDDLE_TURN_CREDENTIAL").ok(),
            disable_stun,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for url in self.stun_urls.iter().chain(self.turn_urls.iter()) {
            validate_url(url)?;
        }
        if !self.turn_urls.is_empty()
            && (self.turn_username.is_none() || self.turn_credential.is_none())
        {
            return Err(ConfigError::MissingTurnCredentials);
        }
        Ok(())
    }

    pub fn servers(&self) -> Vec<IceServer> {
        if self.disable_stun {
            return Vec::new();
        }
        let mut servers = Vec::new();
        if !self.stun_urls.is_empty() {
            servers.push(IceServer {
                urls: self.stun_urls.clone(),
                username: None,
                credential: None,
            });
        }
        if !self.turn_urls.is_empty() {
            servers.push(IceServer {
                urls: self.turn_urls.clone(),
                username: self.turn_username.clone(),
                credential: self.turn_credential.clone(),
            });
        }
        servers
    }
}

fn split_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

fn validate_url(raw: &str) -> Result<(), ConfigError> {
    let url = Url::parse(raw).map_err(|err| ConfigError::InvalidIceUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    if !ICE_SCHEMES.contains(&url.scheme()) {
        return Err(ConfigError::InvalidIceUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    if url.path().trim().is_empty() {
        return Err(ConfigError::InvalidIceUrl {
            url: raw.to_string(),
            reason: "missing host".into(),
        });
    }
    Ok(())
}

/// Fixed server list resolved once at startup.
#[derive(Debug, Clone)]
pub struct StaticIceServers {
    servers: Vec<IceServer>,
}

impl Default for StaticIceServers {
    fn default() -> Self {
        Self::new(vec![IceServer::stun(DEFAULT_STUN_URL)])
    }
}

impl StaticIceServers {
    pub fn new(servers: Vec<IceServer>) -> Self {
        Self { servers }
    }

    pub fn from_config(config: &IceConfig) -> Self {
        Self::new(config.servers())
    }
}

impl IceServerResolver for StaticIceServers {
    fn resolve(&self) -> Vec<IceServer> {
        self.servers.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::ENV_MUTEX;

    const VARS: [&str; 5] = [
        "HUDDLE_ICE_URLS",
        "HUDDLE_TURN_URLS",
        "HUDDLE_TURN_USERNAME",
        "HUDDLE_TURN_CREDENTIAL",
        "HUDDLE_DISABLE_STUN",
    ];

    fn clear() {
        for var in VARS {
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    fn default_is_single_public_stun() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        let config = IceConfig::from_env().expect("valid default");
        assert_eq!(config.servers(), vec![IceServer::stun(DEFAULT_STUN_URL)]);
    }

    #[test]
    fn turn_requires_credentials() {
        let config = IceConfig {
            turn_urls: vec!["turn:turn.example.com:3478".into()],
            ..IceConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingTurnCredentials)
        ));
    }

    #[test]
    fn turn_server_carries_credentials() {
        let config = IceConfig {
            stun_urls: vec!["stun:stun.example.com:3478".into()],
            turn_urls: vec!["turns:turn.example.com:5349".into()],
            turn_username: Some("huddle".into()),
            turn_credential: Some("secret".into()),
            disable_stun: false,
        };
        config.validate().expect("valid");
        let servers = StaticIceServers::from_config(&config).resolve();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].username.as_deref(), Some("huddle"));
        assert_eq!(servers[1].credential.as_deref(), Some("secret"));
    }

    #[test]
    fn rejects_non_ice_schemes() {
        let err = validate_url("https://example.com").expect_err("scheme");
        assert!(matches!(err, ConfigError::InvalidIceUrl { .. }));
        assert!(validate_url("not a url").is_err());
    }

    #[test]
    fn disabled_stun_yields_no_servers() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        unsafe { env::set_var("HUDDLE_DISABLE_STUN", "1") };
        let config = IceConfig::from_env();
        clear();
        assert!(config.expect("valid").servers().is_empty());
    }
}
