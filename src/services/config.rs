//! Configuration service for the corpus editor server

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::ConfigError;
use crate::models::config::OceConfig;

#[async_trait]
pub trait ConfigService: Send + Sync {
    async fn load(&self) -> Result<OceConfig, ConfigError>;
    fn config_path(&self) -> PathBuf;
}

pub struct DefaultConfigService {
    explicit: Option<PathBuf>,
}

impl DefaultConfigService {
    /// `explicit` comes from `--config`; without it the global path is used.
    pub fn new(explicit: Option<PathBuf>) -> Self {
        Self { explicit }
    }

    fn global_config_path() -> PathBuf {
        // XDG standard: ~/.config/oce/config.toml
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .ok()
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("oce")
            .join("config.toml")
    }

    async fn load_from_path(path: &Path) -> Result<OceConfig, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[async_trait]
impl ConfigService for DefaultConfigService {
    async fn load(&self) -> Result<OceConfig, ConfigError> {
        let path = self.config_path();

        let config = if path.exists() {
            tracing::debug!("Loading config from {}", path.display());
            Self::load_from_path(&path).await?
        } else if self.explicit.is_some() {
            return Err(ConfigError::InvalidValue {
                key: "config".to_string(),
                message: format!("Config file does not exist: {}", path.display()),
            });
        } else {
            OceConfig::default()
        };

        Ok(apply_env_overrides(config))
    }

    fn config_path(&self) -> PathBuf {
        self.explicit
            .clone()
            .unwrap_or_else(Self::global_config_path)
    }
}

fn apply_env_overrides(mut config: OceConfig) -> OceConfig {
    if let Ok(val) = std::env::var("OCE_MOTD_FILE")
        && !val.is_empty()
    {
        config.server.motd_file = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("OCE_LANGID_MODEL")
        && !val.is_empty()
    {
        config.langid.model_path = PathBuf::from(val);
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_explicit_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oce.toml");
        tokio::fs::write(
            &path,
            r#"
            [server]
            queue_depth = 4

            [components]
            telnet = "9001"
            memory = ""
            "#,
        )
        .await
        .unwrap();

        let config = DefaultConfigService::new(Some(path)).load().await.unwrap();
        assert_eq!(config.server.queue_depth, 4);
        assert_eq!(config.components.get("telnet").map(String::as_str), Some("9001"));
    }

    #[tokio::test]
    async fn test_missing_explicit_file_is_error() {
        let dir = TempDir::new().unwrap();
        let service = DefaultConfigService::new(Some(dir.path().join("absent.toml")));
        assert!(matches!(
            service.load().await,
            Err(ConfigError::InvalidValue { key, .. }) if key == "config"
        ));
    }

    #[tokio::test]
    async fn test_invalid_toml_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oce.toml");
        tokio::fs::write(&path, "[server\nqueue_depth = ").await.unwrap();

        let service = DefaultConfigService::new(Some(path));
        assert!(matches!(service.load().await, Err(ConfigError::Parse(_))));
    }
}
