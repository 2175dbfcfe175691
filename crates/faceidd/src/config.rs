use faceid_core::EngineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Config file read when `FACEID_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/faceid/faceid.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Daemon configuration: TOML file first, then `FACEID_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite enrollment database.
    pub db_path: PathBuf,
    /// Seal stored encodings with a key derived from this file.
    pub store_key_file: Option<PathBuf>,
    /// Number of recognition worker threads.
    pub worker_threads: usize,
    /// Timeout in seconds for one enroll, authenticate or verify request.
    pub request_timeout_secs: u64,
    /// Largest image payload accepted over D-Bus.
    pub max_image_bytes: usize,
    /// Register on the session bus instead of the system bus (development).
    pub session_bus: bool,
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/faceid/faceid.db"),
            store_key_file: None,
            worker_threads: 2,
            request_timeout_secs: 10,
            max_image_bytes: 16 * 1024 * 1024,
            session_bus: false,
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    /// Load from `FACEID_CONFIG` (or [`DEFAULT_CONFIG_PATH`] if present), then
    /// apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("FACEID_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    /// Apply `FACEID_*` overrides. Unparseable values are logged and ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("FACEID_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(path) = var("FACEID_STORE_KEY_FILE") {
            self.store_key_file = (!path.is_empty()).then(|| PathBuf::from(path));
        }
        env_parse(&var, "FACEID_THRESHOLD", &mut self.engine.matching.threshold);
        env_parse(&var, "FACEID_WORKERS", &mut self.worker_threads);
        env_parse(&var, "FACEID_REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs);
        env_parse(&var, "FACEID_MAX_IMAGE_BYTES", &mut self.max_image_bytes);
        env_flag(&var, "FACEID_STRICT_MODE", &mut self.engine.strict_mode);
        env_flag(&var, "FACEID_SESSION_BUS", &mut self.session_bus);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.engine.matching.threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "match threshold {threshold} is outside [0, 1]"
            )));
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request_timeout_secs must be at least 1".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = var(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
        }
    }
}

fn env_flag(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut bool) {
    if let Some(raw) = var(key) {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => *slot = true,
            "0" | "false" | "no" | "off" => *slot = false,
            _ => tracing::warn!(key, value = %raw, "ignoring unparseable flag"),
        }
    }
}
