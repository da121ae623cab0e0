use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BACKEND_URL_ENV: &str = "COMMERCE_CHAT_BACKEND_URL";

fn default_backend_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_reveal_interval_ms() -> u64 {
    18
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub reveal: RevealConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_url")]
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RevealConfig {
    /// Milliseconds between typewriter ticks.
    #[serde(default = "default_reveal_interval_ms")]
    pub interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NotificationConfig {
    /// Mirror error banners as desktop notifications.
    #[serde(default = "default_true")]
    pub desktop: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            url: default_backend_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for RevealConfig {
    fn default() -> Self {
        RevealConfig {
            interval_ms: default_reveal_interval_ms(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            width: 900,
            height: 700,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        NotificationConfig { desktop: true }
    }
}

impl RevealConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

impl Config {
    /// Load the user config, falling back to defaults, then apply environment overrides.
    pub fn load() -> Self {
        let mut config = Self::load_from(&Self::get_config_path());
        config.apply_env_override(std::env::var(BACKEND_URL_ENV).ok());
        config
    }

    pub fn load_from(config_path: &Path) -> Self {
        if config_path.exists() {
            match fs::read_to_string(config_path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => tracing::warn!("Error parsing config.toml: {}. Using defaults.", e),
                },
                Err(e) => tracing::warn!("Error reading config.toml: {}. Using defaults.", e),
            }
        } else if let Some(parent) = config_path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        Config::default()
    }

    fn apply_env_override(&mut self, backend_url: Option<String>) {
        if let Some(url) = backend_url.filter(|url| !url.trim().is_empty()) {
            self.backend.url = url;
        }
    }

    pub fn get_config_path() -> PathBuf {
        Self::get_config_dir().join("config.toml")
    }

    pub fn get_config_dir() -> PathBuf {
        if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home).join(".config/commerce-chat")
        } else {
            PathBuf::from(".")
        }
    }
}
