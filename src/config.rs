//! Configuration loading for the relay.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::debounce::{Channel, ChannelPolicy};
use crate::core::queue::validate_destination;
use crate::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Get the relay home directory (~/.autsys-relay).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".autsys-relay"))
}

/// Get the default settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from `path`, or from ~/.autsys-relay/settings.json.
///
/// A missing file yields the defaults; a present but invalid file is an error.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => get_settings_path()?,
    };

    let settings = if path.exists() {
        let content = std::fs::read_to_string(&path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        tracing::debug!("Loaded settings from {}", path.display());
        settings
    } else {
        tracing::debug!("No settings at {}, using defaults", path.display());
        Settings::default()
    };

    validate_settings(&settings)?;
    Ok(settings)
}

fn validate_settings(settings: &Settings) -> Result<()> {
    let routing = &settings.routing;

    if routing.parties.len() != 2 {
        return Err(Error::Config(format!(
            "routing.parties must name exactly two parties, got {}",
            routing.parties.len()
        )));
    }
    for party in &routing.parties {
        validate_destination(party)
            .map_err(|_| Error::Config(format!("invalid party name '{}'", party)))?;
    }
    if routing.parties[0] == routing.parties[1] {
        return Err(Error::Config("routing.parties must be distinct".to_string()));
    }

    let is_party = |name: &str| routing.parties.iter().any(|p| p == name);

    if !is_party(&routing.fallback) {
        return Err(Error::Config(format!(
            "routing.fallback '{}' is not a party",
            routing.fallback
        )));
    }
    for (alias, target) in &routing.aliases {
        if !is_party(target) {
            return Err(Error::Config(format!(
                "routing.aliases.{} points to unknown party '{}'",
                alias, target
            )));
        }
    }

    let mut origins = HashSet::new();
    for channel in &settings.debounce.channels {
        if !is_party(&channel.origin) || !is_party(&channel.responder) {
            return Err(Error::Config(format!(
                "debounce channel {} -> {} must name parties",
                channel.responder, channel.origin
            )));
        }
        if channel.origin == channel.responder {
            return Err(Error::Config(format!(
                "debounce channel for '{}' answers itself",
                channel.origin
            )));
        }
        if !origins.insert(channel.origin.as_str()) {
            return Err(Error::Config(format!(
                "more than one debounce channel for '{}'",
                channel.origin
            )));
        }
    }

    Ok(())
}

/// HTTP server configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    10010
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Storage configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct StorageConfig {
    /// Where queue logs live (default: ~/.autsys-relay/data)
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(get_home_dir()?.join("data")),
        }
    }
}

/// Routing table: external identifiers to logical parties.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RoutingConfig {
    /// The two logical parties.
    #[serde(default = "default_parties")]
    pub parties: Vec<String>,
    /// Extra external names for the parties (case-insensitive).
    #[serde(default = "default_aliases")]
    pub aliases: BTreeMap<String, String>,
    /// Party used when a destination is missing and cannot be inferred, or unknown.
    #[serde(default = "default_fallback")]
    pub fallback: String,
}

fn default_parties() -> Vec<String> {
    vec!["mobile".to_string(), "core".to_string()]
}

fn default_aliases() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "mobile".to_string()),
        ("client".to_string(), "mobile".to_string()),
        ("agent".to_string(), "core".to_string()),
        ("backend".to_string(), "core".to_string()),
    ])
}

fn default_fallback() -> String {
    "core".to_string()
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            parties: default_parties(),
            aliases: default_aliases(),
            fallback: default_fallback(),
        }
    }
}

/// One debounced response channel.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DebounceChannelConfig {
    /// Party whose activity gates responses to it.
    pub origin: String,
    /// Party sending the responses.
    pub responder: String,
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,
    /// Release a withheld response after this long regardless of activity.
    #[serde(default)]
    pub max_hold_ms: Option<u64>,
    /// Deliver only the newest queued response.
    #[serde(default)]
    pub coalesce: bool,
}

fn default_quiet_period_ms() -> u64 {
    2000
}

impl DebounceChannelConfig {
    pub fn channel(&self) -> Channel {
        Channel::new(&self.origin, &self.responder)
    }

    pub fn policy(&self) -> ChannelPolicy {
        ChannelPolicy {
            quiet_period: Duration::from_millis(self.quiet_period_ms),
            max_hold: self.max_hold_ms.map(Duration::from_millis),
            coalesce: self.coalesce,
        }
    }
}

/// Debounce configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DebounceConfig {
    #[serde(default = "default_debounce_channels")]
    pub channels: Vec<DebounceChannelConfig>,
}

fn default_debounce_channels() -> Vec<DebounceChannelConfig> {
    vec![DebounceChannelConfig {
        origin: "mobile".to_string(),
        responder: "core".to_string(),
        quiet_period_ms: default_quiet_period_ms(),
        max_hold_ms: None,
        coalesce: false,
    }]
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            channels: default_debounce_channels(),
        }
    }
}

/// Logging configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct LoggingConfig {
    /// Log directory (default: platform data dir)
    pub dir: Option<PathBuf>,
    /// Filter used when RUST_LOG is unset
    pub filter: Option<String>,
}

/// Relay settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub debounce: DebounceConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let settings = load_settings(Some(&temp_dir.path().join("nope.json"))).unwrap();

        assert_eq!(settings.server.port, 10010);
        assert_eq!(settings.routing.parties, vec!["mobile", "core"]);
        assert_eq!(settings.routing.fallback, "core");
        assert_eq!(settings.debounce.channels.len(), 1);
        assert_eq!(settings.debounce.channels[0].quiet_period_ms, 2000);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{
                "server": { "port": 8080 },
                "routing": {
                    "parties": ["freja", "roberta"],
                    "aliases": { "mobile": "freja" },
                    "fallback": "roberta"
                },
                "debounce": { "channels": [
                    { "origin": "freja", "responder": "roberta", "quiet_period_ms": 500, "coalesce": true }
                ] }
            }"#,
        )
        .unwrap();

        let settings = load_settings(Some(&path)).unwrap();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.host, "0.0.0.0");

        let channel = &settings.debounce.channels[0];
        assert_eq!(channel.channel(), Channel::new("freja", "roberta"));
        assert_eq!(channel.policy().quiet_period, Duration::from_millis(500));
        assert!(channel.policy().coalesce);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut settings = Settings::default();
        settings.routing.fallback = "nobody".to_string();
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings.routing.parties.push("third".to_string());
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings.routing.parties = vec!["core".to_string(), "core".to_string()];
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings
            .routing
            .aliases
            .insert("x".to_string(), "ghost".to_string());
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings.debounce.channels[0].responder = "mobile".to_string();
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings.routing.parties[0] = "bad/name".to_string();
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(load_settings(Some(&path)), Err(Error::Json(_))));
    }
}
