use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub model: ModelConfig,
    pub alarm: AlarmConfig,
    pub recording: RecordingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub base_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Serve `POST /api/gateway` from this process.
    pub serve_gateway: bool,
}

/// How the recording controller and dashboard reach the analysis model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GatewayMode {
    /// Call the hosted model from this process.
    Direct,
    /// Go through a gateway proxy endpoint over HTTP.
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub mode: GatewayMode,
    pub endpoint: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub api_base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_seconds: u64,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    pub poll_interval_ms: u64,
    pub suppression_seconds: i64,
    pub snooze_minutes: i64,
    /// Minutes skipped by a clock jump that are still evaluated. 0 disables catch-up.
    pub catch_up_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// `microphone` or `file`.
    pub input: String,
    /// Source file for the `file` input.
    pub input_file: Option<String>,
    pub timeslice_ms: u64,
    pub keep_playback_copy: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: "~/.somnus".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8787".to_string(),
            serve_gateway: true,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mode: GatewayMode::Direct,
            endpoint: "http://127.0.0.1:8787/api/gateway".to_string(),
            timeout_seconds: 180,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://generativelanguage.googleapis.com".to_string(),
            model: "gemini-2.5-flash".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            timeout_seconds: 180,
            temperature: 0.4,
        }
    }
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            suppression_seconds: 61,
            snooze_minutes: 9,
            catch_up_minutes: 0,
        }
    }
}

impl AlarmConfig {
    /// Suppression has to outlast the rest of the matching minute.
    pub const MIN_SUPPRESSION_SECONDS: i64 = 60;
    pub const MAX_SUPPRESSION_SECONDS: i64 = 3600;
    pub const MAX_SNOOZE_MINUTES: i64 = 120;
    pub const MAX_CATCH_UP_MINUTES: i64 = 24 * 60;

    pub fn validate(&self) -> Result<()> {
        if !(Self::MIN_SUPPRESSION_SECONDS..=Self::MAX_SUPPRESSION_SECONDS)
            .contains(&self.suppression_seconds)
        {
            return Err(CoreError::Config(format!(
                "alarm.suppression_seconds must be between {} and {}",
                Self::MIN_SUPPRESSION_SECONDS,
                Self::MAX_SUPPRESSION_SECONDS
            )));
        }
        if !(1..=Self::MAX_SNOOZE_MINUTES).contains(&self.snooze_minutes) {
            return Err(CoreError::Config(format!(
                "alarm.snooze_minutes must be between 1 and {}",
                Self::MAX_SNOOZE_MINUTES
            )));
        }
        if !(0..=Self::MAX_CATCH_UP_MINUTES).contains(&self.catch_up_minutes) {
            return Err(CoreError::Config(format!(
                "alarm.catch_up_minutes must be between 0 and {}",
                Self::MAX_CATCH_UP_MINUTES
            )));
        }
        Ok(())
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            input: "microphone".to_string(),
            input_file: None,
            timeslice_ms: 1000,
            keep_playback_copy: true,
        }
    }
}

impl AppConfig {
    /// Load config from `~/.somnus/config.toml`, creating defaults if missing.
    pub fn load() -> Result<Self> {
        let base_dir = Self::default_base_dir()?;
        let config_path = base_dir.join("config.toml");

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = AppConfig::default();
            config.ensure_dirs()?;
            let toml_str = toml::to_string_pretty(&config)
                .map_err(|e| CoreError::Config(format!("failed to serialize config: {e}")))?;
            fs::write(&config_path, toml_str)?;
            Ok(config)
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("failed to read config: {e}")))?;
        let config: AppConfig = toml::from_str(&contents)
            .map_err(|e| CoreError::Config(format!("failed to parse config: {e}")))?;
        config.alarm.validate()?;
        Ok(config)
    }

    /// Returns the resolved base directory (expands `~`).
    pub fn base_dir(&self) -> Result<PathBuf> {
        resolve_tilde(&self.storage.base_dir)
    }

    pub fn default_base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Config("could not determine home directory".to_string()))?;
        Ok(home.join(".somnus"))
    }

    /// Path to the SQLite record store.
    pub fn db_path(&self) -> Result<PathBuf> {
        Ok(self.base_dir()?.join("somnus.db"))
    }

    /// Directory for local playback copies of the last recording.
    pub fn playback_dir(&self) -> Result<PathBuf> {
        Ok(self.base_dir()?.join("playback"))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let base = self.base_dir()?;
        fs::create_dir_all(&base)?;
        fs::create_dir_all(base.join("playback"))?;
        Ok(())
    }
}

fn resolve_tilde(path: &str) -> Result<PathBuf> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Config("could not determine home directory".to_string()))?;
        Ok(home.join(rest))
    } else if path == "~" {
        dirs::home_dir()
            .ok_or_else(|| CoreError::Config("could not determine home directory".to_string()))
    } else {
        Ok(PathBuf::from(path))
    }
}

/// Initialize tracing with an env filter.
///
/// Respects `RUST_LOG`. Defaults to `info`.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
