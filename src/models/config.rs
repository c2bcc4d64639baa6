//! Configuration model for the corpus editor server
//!
//! Components (data providers and client interfaces) are declared as a flat
//! key/value table so that the CLI and the config file can both add to it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OceConfig {
    #[serde(default)]
    pub server: ServerSettings,

    /// Component key -> value, e.g. `websocket = "8081"`, `json = "data/corpus.json"`
    #[serde(default)]
    pub components: BTreeMap<String, String>,

    #[serde(default)]
    pub langid: LangIdSettings,
}

/// Controller and transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "defaults::motd_file")]
    pub motd_file: PathBuf,

    /// Bound of each channel's inbound and outbound queue
    #[serde(default = "defaults::queue_depth")]
    pub queue_depth: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            motd_file: defaults::motd_file(),
            queue_depth: defaults::queue_depth(),
        }
    }
}

/// Language identification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LangIdSettings {
    #[serde(default = "defaults::model_path")]
    pub model_path: PathBuf,
}

impl Default for LangIdSettings {
    fn default() -> Self {
        Self {
            model_path: defaults::model_path(),
        }
    }
}

pub(crate) mod defaults {
    use std::path::PathBuf;

    // Server
    pub fn motd_file() -> PathBuf {
        PathBuf::from("data/motd.txt")
    }
    pub fn queue_depth() -> usize {
        32
    }

    // Components
    pub const WEBSOCKET_PORT: u16 = 8081;
    pub fn store_path() -> PathBuf {
        PathBuf::from("data/corpus.json")
    }

    // Language identification
    pub fn model_path() -> PathBuf {
        PathBuf::from("data/langid-model.json")
    }
}

// ============================================================================
// Components
// ============================================================================

pub mod keys {
    pub const WEBSOCKET: &str = "websocket";
    pub const TELNET: &str = "telnet";
    pub const JSON: &str = "json";
    pub const MEMORY: &str = "memory";

    pub const INTERFACES: &[&str] = &[WEBSOCKET, TELNET];
    pub const PROVIDERS: &[&str] = &[JSON, MEMORY];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    WebSocket,
    Telnet,
}

impl InterfaceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebSocket => keys::WEBSOCKET,
            Self::Telnet => keys::TELNET,
        }
    }
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceSpec {
    pub kind: InterfaceKind,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderSpec {
    Json(PathBuf),
    Memory,
}

impl ProviderSpec {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Json(_) => keys::JSON,
            Self::Memory => keys::MEMORY,
        }
    }
}

/// Validated set of requested components.
///
/// Counting rules (exactly one provider, at least one interface) are enforced
/// by the controller builder, not here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentSet {
    pub providers: Vec<ProviderSpec>,
    pub interfaces: Vec<InterfaceSpec>,
}

impl ComponentSet {
    pub fn from_components(components: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut set = Self::default();

        for (key, value) in components {
            match key.as_str() {
                keys::WEBSOCKET => set.interfaces.push(InterfaceSpec {
                    kind: InterfaceKind::WebSocket,
                    port: parse_port(key, value)?,
                }),
                keys::TELNET => set.interfaces.push(InterfaceSpec {
                    kind: InterfaceKind::Telnet,
                    port: parse_port(key, value)?,
                }),
                keys::JSON => {
                    if value.trim().is_empty() {
                        return Err(ConfigError::InvalidValue {
                            key: key.clone(),
                            message: "store path is empty".to_string(),
                        });
                    }
                    set.providers.push(ProviderSpec::Json(PathBuf::from(value)));
                }
                keys::MEMORY => set.providers.push(ProviderSpec::Memory),
                other => return Err(ConfigError::UnknownComponent(other.to_string())),
            }
        }

        Ok(set)
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{}' is not a valid port ({})", value, e),
        })
}

impl OceConfig {
    /// Fill in the default interface and provider when none is configured.
    pub fn with_default_components(mut self) -> Self {
        let has = |names: &[&str], c: &BTreeMap<String, String>| {
            c.keys().any(|k| names.contains(&k.as_str()))
        };

        if !has(keys::INTERFACES, &self.components) {
            self.components.insert(
                keys::WEBSOCKET.to_string(),
                defaults::WEBSOCKET_PORT.to_string(),
            );
        }
        if !has(keys::PROVIDERS, &self.components) {
            self.components.insert(
                keys::JSON.to_string(),
                defaults::store_path().display().to_string(),
            );
        }
        self
    }

    pub fn component_set(&self) -> Result<ComponentSet, ConfigError> {
        ComponentSet::from_components(&self.components)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn components(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = OceConfig::default();
        assert_eq!(config.server.queue_depth, 32);
        assert_eq!(config.server.motd_file, PathBuf::from("data/motd.txt"));
        assert!(config.components.is_empty());
    }

    #[test]
    fn test_default_components_filled() {
        let config = OceConfig::default().with_default_components();
        let set = config.component_set().unwrap();
        assert_eq!(
            set.interfaces,
            vec![InterfaceSpec {
                kind: InterfaceKind::WebSocket,
                port: 8081
            }]
        );
        assert_eq!(
            set.providers,
            vec![ProviderSpec::Json(PathBuf::from("data/corpus.json"))]
        );
    }

    #[test]
    fn test_default_components_respect_existing() {
        let mut config = OceConfig::default();
        config.components = components(&[("telnet", "9000"), ("memory", "")]);
        let set = config.with_default_components().component_set().unwrap();
        assert_eq!(set.interfaces.len(), 1);
        assert_eq!(set.interfaces[0].kind, InterfaceKind::Telnet);
        assert_eq!(set.providers, vec![ProviderSpec::Memory]);
    }

    #[test]
    fn test_unknown_component_rejected() {
        let err = ComponentSet::from_components(&components(&[("ftp", "21")])).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownComponent(k) if k == "ftp"));
    }

    #[test]
    fn test_invalid_port_rejected() {
        let err =
            ComponentSet::from_components(&components(&[("websocket", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "websocket"));
    }

    #[test]
    fn test_parse_toml() {
        let config: OceConfig = toml::from_str(
            r#"
            [server]
            motd_file = "motd.txt"

            [components]
            websocket = "8081"
            telnet = "8082"
            json = "corpus.json"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.motd_file, PathBuf::from("motd.txt"));
        assert_eq!(config.server.queue_depth, 32);
        let set = config.component_set().unwrap();
        assert_eq!(set.interfaces.len(), 2);
        assert_eq!(set.providers.len(), 1);
    }
}
