use async_trait::async_trait;
use dashmap::DashMap;
use std::{env, path::PathBuf};
use tracing::{info, warn};

/// A source of `KEY=value` overrides layered on top of the settings file.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Reads the process environment, after loading `env_file` into it when present.
#[derive(Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("Loaded .env from {}", env_file.display()),
                Err(e) => warn!("could not parse {}: {}", env_file.display(), e),
            }
        } else {
            info!("no .env at {}, using the process environment only", env_file.display());
        }
        Box::new(Self { env_file })
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self { map: DashMap::new() })
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_map_config_manager_basic() {
        let mgr = MapConfigManager::new();
        mgr.set("foo", "bar");
        assert_eq!(mgr.get("foo").await, Some("bar".to_string()));

        mgr.set("foo", "baz");
        assert_eq!(mgr.get("foo").await, Some("baz".to_string()));
        assert_eq!(mgr.get("missing").await, None);
    }

    #[tokio::test]
    async fn test_map_config_manager_through_wrapper() {
        let map = MapConfigManager::new();
        map.set("a", "1");
        map.set("b", "2");

        let mgr = ConfigManager(map);
        assert_eq!(mgr.get("b").await, Some("2".to_string()));
        assert_eq!(format!("{mgr:?}"), "MapConfigManager(2 entries)");
    }

    #[tokio::test]
    async fn test_env_config_manager_with_temp_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "INTERPRETER_TEST_ENV_KEY=abc123\n").unwrap();

        let mgr = ConfigManager(EnvConfigManager::new(env_path));
        assert_eq!(mgr.get("INTERPRETER_TEST_ENV_KEY").await, Some("abc123".to_string()));
        assert!(format!("{mgr:?}").starts_with("EnvConfigManager("));
    }

    #[tokio::test]
    async fn test_env_config_manager_missing_file() {
        let mgr = EnvConfigManager::new(PathBuf::from("/nonexistent/.env"));
        assert_eq!(mgr.get("INTERPRETER_SURELY_UNSET_KEY").await, None);
    }
}
