use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs, str::FromStr};

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const ENV_PREFIX: &str = "SIDECHANNEL_";
pub const ROOT_KEY: &str = "SIDECHANNEL_ROOT";
pub const LOG_LEVEL_KEY: &str = "SIDECHANNEL_LOG_LEVEL";
pub const LOG_DIR_KEY: &str = "SIDECHANNEL_LOG_DIR";
pub const TICK_MILLIS_KEY: &str = "SIDECHANNEL_TICK_MILLIS";
pub const QUERY_TIMEOUT_MILLIS_KEY: &str = "SIDECHANNEL_QUERY_TIMEOUT_MILLIS";

// -----------------------------------------------------------------------------
// Config sources
// -----------------------------------------------------------------------------

#[async_trait::async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    async fn del(&self, key: &str) -> Result<(), String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }

    /// Read and parse `key`, `None` when unset or blank.
    pub async fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.get(key).await {
            Some(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .with_context(|| format!("invalid value `{raw}` for {key}")),
            _ => Ok(None),
        }
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, optionally seeded from a `.env` file. Only
/// `SIDECHANNEL_*` variables are listed by `keys`. Without a file the
/// manager is read-only; with one, `set` and `del` update both the process
/// environment and the file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: Option<PathBuf>,
}

impl EnvConfigManager {
    pub fn new(env_file: Option<PathBuf>) -> Box<Self> {
        if let Some(path) = env_file.as_ref().filter(|p| p.exists()) {
            match dotenvy::from_path(path) {
                Ok(()) => debug!("loaded .env from {}", path.display()),
                Err(err) => warn!("could not load .env from {}: {err}", path.display()),
            }
        }
        Box::new(Self { env_file })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars()
            .map(|(k, _)| k)
            .filter(|k| k.starts_with(ENV_PREFIX))
            .collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        let path = self.writable(key)?;
        rewrite_env_file(path, key, Some(value)).map_err(|e| format!("could not write {}: {e}", path.display()))?;
        // SAFETY: config is only changed from the single CLI command path
        unsafe {
            env::set_var(key, value);
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), String> {
        let path = self.writable(key)?;
        rewrite_env_file(path, key, None).map_err(|e| format!("could not write {}: {e}", path.display()))?;
        // SAFETY: see `set`
        unsafe {
            env::remove_var(key);
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        match &self.env_file {
            Some(p) => format!("EnvConfigManager({})", p.display()),
            None => "EnvConfigManager".to_string(),
        }
    }
}

impl EnvConfigManager {
    fn writable(&self, key: &str) -> Result<&Path, String> {
        self.env_file
            .as_deref()
            .ok_or_else(|| format!("environment config has no .env file, cannot change {key}"))
    }
}

/// Replace, append or (with `None`) drop `key` in a `.env` file, keeping
/// every other line as it was.
fn rewrite_env_file(path: &Path, key: &str, value: Option<&str>) -> std::io::Result<()> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err),
    };
    let mut lines = Vec::new();
    let mut found = false;
    for line in content.lines() {
        match line.split_once('=') {
            Some((k, _)) if k.trim() == key => {
                found = true;
                if let Some(v) = value {
                    lines.push(format!("{key}={v}"));
                }
            }
            _ => lines.push(line.to_string()),
        }
    }
    if let (false, Some(v)) = (found, value) {
        lines.push(format!("{key}={v}"));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = lines.join("\n");
    out.push('\n');
    fs::write(path, out)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigManager {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::default()
    }

    pub fn with(self: Box<Self>, key: &str, value: &str) -> Box<Self> {
        self.map.insert(key.to_string(), value.to_string());
        self
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), String> {
        self.map.remove(key);
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

// -----------------------------------------------------------------------------
// Settings
// -----------------------------------------------------------------------------

/// Runtime settings resolved from a [`ConfigManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Settings {
    pub root: PathBuf,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    /// Period of the client's main-loop tick (overlay sweep + replay).
    pub tick_millis: u64,
    /// Deadline the server puts on queries it waits for. 0 waits forever.
    pub query_timeout_millis: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./sidechannel"),
            log_level: "info".to_string(),
            log_dir: None,
            tick_millis: 50,
            query_timeout_millis: 5_000,
        }
    }
}

impl Settings {
    pub async fn load(config: &ConfigManager) -> Result<Self> {
        let defaults = Self::default();
        let root = config
            .get(ROOT_KEY)
            .await
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.root);
        let log_dir = config
            .get(LOG_DIR_KEY)
            .await
            .filter(|v| !v.trim().is_empty())
            .map(|d| resolve(&root, Path::new(&d)));

        let tick_millis = config.parse::<u64>(TICK_MILLIS_KEY).await?.unwrap_or(defaults.tick_millis);
        if tick_millis == 0 {
            anyhow::bail!("{TICK_MILLIS_KEY} must be greater than zero");
        }

        Ok(Self {
            log_level: config.get(LOG_LEVEL_KEY).await.unwrap_or(defaults.log_level),
            log_dir,
            tick_millis,
            query_timeout_millis: config
                .parse::<u64>(QUERY_TIMEOUT_MILLIS_KEY)
                .await?
                .unwrap_or(defaults.query_timeout_millis),
            root,
        })
    }

    /// Move to `root`, carrying a log directory that lived under the old root along.
    pub fn rebase(mut self, root: PathBuf) -> Self {
        let moved = self
            .log_dir
            .as_deref()
            .and_then(|d| d.strip_prefix(&self.root).ok())
            .map(|rel| root.join(rel));
        if moved.is_some() {
            self.log_dir = moved;
        }
        self.root = root;
        self
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn permissions_file(&self) -> PathBuf {
        self.config_dir().join("permissions.json")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.root.join("audit")
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        (self.query_timeout_millis > 0).then(|| Duration::from_millis(self.query_timeout_millis))
    }
}

fn resolve(root: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() { p.to_path_buf() } else { root.join(p) }
}
