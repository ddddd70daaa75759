use crate::conflicts::PatchStateMode;
use crate::game::{self, GameId};
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_PATCH_PREFIX: &str = "patchsmith_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub game: GameId,
    #[serde(default)]
    pub user_dir: PathBuf,
    #[serde(default = "default_patch_prefix")]
    pub patch_prefix: String,
    #[serde(default)]
    pub mode: PatchStateMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            game: GameId::default(),
            user_dir: PathBuf::new(),
            patch_prefix: default_patch_prefix(),
            mode: PatchStateMode::default(),
        }
    }
}

impl EngineConfig {
    pub fn load_or_create() -> Result<Self> {
        let base_dir = base_data_dir()?;
        Self::load_or_create_in(&base_dir)
    }

    pub fn load_or_create_in(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read engine config")?;
            let mut config: EngineConfig =
                serde_json::from_str(&raw).context("parse engine config")?;
            if !game::supported_games().contains(&config.game) {
                config.game = GameId::default();
                config.save_in(base_dir)?;
            }
            if config.patch_prefix.trim().is_empty() {
                config.patch_prefix = default_patch_prefix();
            }
            return Ok(config);
        }

        let config = EngineConfig::default();
        config.save_in(base_dir)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let base_dir = base_data_dir()?;
        self.save_in(&base_dir)
    }

    pub fn save_in(&self, base_dir: &Path) -> Result<()> {
        fs::create_dir_all(base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        let raw = serde_json::to_string_pretty(self).context("serialize engine config")?;
        fs::write(path, raw).context("write engine config")?;
        Ok(())
    }
}

fn default_patch_prefix() -> String {
    DEFAULT_PATCH_PREFIX.to_string()
}

pub fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("patchsmith"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn first_load_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::load_or_create_in(dir.path()).unwrap();
        assert_eq!(config.patch_prefix, DEFAULT_PATCH_PREFIX);
        assert_eq!(config.mode, PatchStateMode::Default);
        assert!(dir.path().join("config.json").exists());
    }

    #[test]
    fn blank_prefix_falls_back_to_default() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("config.json"),
            r#"{"game":"ck3","user_dir":"/games/ck3","patch_prefix":"  ","mode":"advanced"}"#,
        )
        .unwrap();
        let config = EngineConfig::load_or_create_in(dir.path()).unwrap();
        assert_eq!(config.game, GameId::CrusaderKings3);
        assert_eq!(config.mode, PatchStateMode::Advanced);
        assert_eq!(config.patch_prefix, DEFAULT_PATCH_PREFIX);
    }
}
