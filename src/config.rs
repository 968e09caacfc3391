use std::{
    env, fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ActilogError, Result},
    permit::StaticGrants,
};

pub const DEFAULT_PORT: u16 = 7610;
pub const DEFAULT_LIST_PAGE_SIZE: usize = 50;
pub const DEFAULT_PAGE_LIMIT: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    pub data_dir: PathBuf,
    /// Bounded page size the CLI falls back to when none is requested.
    pub list_page_size: usize,
    /// Hard cap on any requested page size.
    pub page_limit: usize,
    /// Events older than this many days are purged by the retention task.
    /// Absent means no automatic purging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    // Last so the TOML table serializes after the scalar fields.
    #[serde(default)]
    pub grants: StaticGrants,
}

impl Default for Config {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            port: DEFAULT_PORT,
            data_dir: default_data_dir(),
            list_page_size: DEFAULT_LIST_PAGE_SIZE,
            page_limit: DEFAULT_PAGE_LIMIT,
            retention_days: None,
            created_at: now,
            updated_at: now,
            grants: StaticGrants::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub list_page_size: Option<usize>,
    pub page_limit: Option<usize>,
    pub retention_days: Option<Option<u32>>,
}

pub fn default_config_path() -> Result<PathBuf> {
    let mut path = env::current_dir().map_err(|err| ActilogError::Config(err.to_string()))?;
    path.push(".actilog");
    path.push("config.toml");
    Ok(path)
}

pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let config_path = if let Some(path) = path {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        path
    } else {
        default_config_path()?
    };

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let cfg: Config = toml::from_str(&contents)?;
        cfg.ensure_data_dir()?;
        Ok((cfg, config_path))
    } else {
        let cfg = Config::default();
        cfg.ensure_data_dir()?;
        cfg.save(&config_path)?;
        Ok((cfg, config_path))
    }
}

impl Config {
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn apply_update(&mut self, update: ConfigUpdate) {
        if let Some(port) = update.port {
            self.port = port;
        }
        if let Some(dir) = update.data_dir {
            self.data_dir = dir;
        }
        if let Some(size) = update.list_page_size {
            self.list_page_size = size;
        }
        if let Some(limit) = update.page_limit {
            self.page_limit = limit;
        }
        if let Some(days) = update.retention_days {
            self.retention_days = days;
        }
        self.updated_at = Utc::now();
    }

    pub fn ensure_data_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn event_store_path(&self) -> PathBuf {
        self.data_dir.join("event_store")
    }
}

fn default_data_dir() -> PathBuf {
    let Ok(current_dir) = env::current_dir() else {
        return PathBuf::from(".actilog");
    };
    current_dir.join(".actilog")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.list_page_size, DEFAULT_LIST_PAGE_SIZE);
        assert!(cfg.retention_days.is_none());
    }

    #[test]
    fn saved_config_reloads_with_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut cfg = Config::default();
        cfg.data_dir = dir.path().join("data");
        cfg.apply_update(ConfigUpdate {
            port: Some(9000),
            retention_days: Some(Some(30)),
            ..ConfigUpdate::default()
        });
        cfg.save(&path).unwrap();

        let (reloaded, written_path) = load_or_default(Some(path.clone())).unwrap();
        assert_eq!(written_path, path);
        assert_eq!(reloaded.port, 9000);
        assert_eq!(reloaded.retention_days, Some(30));
        assert!(reloaded.data_dir.exists());
    }
}
