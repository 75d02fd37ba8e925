use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use dirs_next::{config_dir, data_dir};
use serde::{Deserialize, Serialize};

use crate::types::Translation;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub translation: Translation,
    /// Percent of an episode's duration that counts as watched.
    pub completion_threshold: u8,
    /// Overrides the platform data directory for history and token files.
    pub storage_path: Option<PathBuf>,
    pub request_timeout_secs: u64,
    pub player: PlayerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub command: String,
    /// Extra arguments appended to every player invocation, shell-style.
    pub extra_args: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            translation: Translation::Sub,
            completion_threshold: 85,
            storage_path: None,
            request_timeout_secs: 15,
            player: PlayerConfig::default(),
        }
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            command: String::from("mpv"),
            extra_args: String::new(),
        }
    }
}

impl AppConfig {
    /// Layers defaults, the TOML config file, and `ANISYNC_*` environment
    /// variables, in that order.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?);

        match explicit_path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path.to_path_buf()));
            }
            None => {
                if let Some(path) = default_config_path()
                    && path.exists()
                {
                    builder = builder.add_source(config::File::from(path));
                }
            }
        }

        let cfg: AppConfig = builder
            .add_source(
                config::Environment::with_prefix("ANISYNC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("configuration has an invalid shape")?;

        if cfg.completion_threshold == 0 || cfg.completion_threshold > 100 {
            bail!(
                "completion_threshold must be between 1 and 100, got {}",
                cfg.completion_threshold
            );
        }
        Ok(cfg)
    }

    pub fn storage_dir(&self) -> Result<PathBuf> {
        if let Some(path) = &self.storage_path {
            return Ok(path.clone());
        }
        let base = data_dir().ok_or_else(|| anyhow!("Could not determine data directory"))?;
        Ok(base.join("anisync"))
    }

    /// Writes the current settings out as a starting point for edits.
    pub fn write_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let body = toml::to_string_pretty(self).context("failed to serialize configuration")?;
        std::fs::write(path, body)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|base| base.join("anisync").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.translation, Translation::Sub);
        assert_eq!(cfg.completion_threshold, 85);
        assert_eq!(cfg.player.command, "mpv");
        assert!(cfg.player.extra_args.is_empty());
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = AppConfig {
            completion_threshold: 90,
            translation: Translation::Dub,
            ..AppConfig::default()
        };
        let body = toml::to_string_pretty(&cfg).expect("serialize");
        let parsed: AppConfig = toml::from_str(&body).expect("parse");
        assert_eq!(parsed.completion_threshold, 90);
        assert_eq!(parsed.translation, Translation::Dub);
    }
}
