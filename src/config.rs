use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf};
use tracing::{info, warn};

/// Upper bound on simultaneously running agent processes; 0 or unset means
/// unlimited.
pub const MAX_PROVIDER_PROCESSES: &str = "maxProviderProcesses";
/// Installation directory handed to every agent.
pub const HOME: &str = "home";

#[async_trait::async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    /// Every property whose current value differs from its default. This is
    /// what a new agent receives in its handshake.
    async fn non_default_properties(&self) -> Vec<(String, String)> {
        let mut changed = vec![];
        for key in self.keys().await {
            let Some(current) = self.get(&key).await else {
                continue;
            };
            if self.default_value(&key).await.as_deref() != Some(current.as_str()) {
                changed.push((key, current));
            }
        }
        changed.sort();
        changed
    }
    async fn keys(&self) -> Vec<String>;
    /// Current value.
    async fn get(&self, key: &str) -> Option<String>;
    async fn default_value(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }

    /// Read on every agent start so changes apply without a restart.
    pub async fn max_provider_processes(&self) -> u32 {
        match self.0.get(MAX_PROVIDER_PROCESSES).await {
            None => 0,
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!("ignoring invalid {MAX_PROVIDER_PROCESSES}={raw}");
                0
            }),
        }
    }

    pub async fn home(&self) -> String {
        self.0.get(HOME).await.unwrap_or_else(|| ".".to_string())
    }

    pub async fn non_default_properties(&self) -> Vec<(String, String)> {
        self.0.non_default_properties().await
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

/// Properties taken from the process environment, optionally seeded from a
/// `.env` file. Only variables starting with `prefix` are visible, with the
/// prefix stripped. Environment properties have no defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
    prefix: String,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf, prefix: impl Into<String>) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(env_file.clone()).ok();
            info!("Loaded .env from {}", env_file.display());
        } else {
            warn!("could not load .env from {}", env_file.display())
        }

        Box::new(Self { env_file, prefix: prefix.into() })
    }

    fn var_name(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars()
            .filter_map(|(k, _)| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(self.var_name(key)).ok()
    }

    async fn default_value(&self, _key: &str) -> Option<String> {
        None
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        let name = self.var_name(key);
        unsafe {
            env::set_var(&name, value);
        };
        // Update .env file
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut lines: Vec<String> = Vec::new();
        let mut found = false;

        for line in content.lines() {
            match line.split_once('=') {
                Some((k, _)) if k.trim() == name => {
                    lines.push(format!("{name}={value}"));
                    found = true;
                }
                _ => lines.push(line.to_string()),
            }
        }

        if !found {
            lines.push(format!("{name}={value}"));
        }

        fs::write(&self.env_file, lines.join("\n")).map_err(|e| e.to_string())?;

        Ok(())
    }

    async fn del(&self, key: &str) {
        let name = self.var_name(key);
        unsafe {
            env::remove_var(&name);
        };
        if let Ok(content) = fs::read_to_string(&self.env_file) {
            let lines: Vec<&str> = content
                .lines()
                .filter(|line| match line.split_once('=') {
                    Some((k, _)) => k.trim() != name,
                    None => true,
                })
                .collect();

            let _ = fs::write(&self.env_file, lines.join("\n"));
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({}*)", self.prefix)
    }
}

/// In-memory properties with separate current and default values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapConfigManager {
    current: DashMap<String, String>,
    defaults: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    /// Registers `key` with a default value that also becomes its current
    /// value.
    pub fn with_default(self: Box<Self>, key: &str, value: &str) -> Box<Self> {
        self.defaults.insert(key.to_string(), value.to_string());
        self.current.entry(key.to_string()).or_insert_with(|| value.to_string());
        self
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.current.iter().map(|entry| entry.key().clone()).collect();
        for entry in self.defaults.iter() {
            if !self.current.contains_key(entry.key()) {
                keys.push(entry.key().clone());
            }
        }
        keys
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.current.get(key).map(|v| v.clone())
    }

    async fn default_value(&self, key: &str) -> Option<String> {
        self.defaults.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.current.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.current.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }
    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.current.len())
    }
}
