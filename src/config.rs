//! Runner configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via STATECRAFT_CONFIG or --config)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use statecraft_interp::DEFAULT_MAX_MICROSTEPS;
use statecraft_storage::SnapshotPolicy;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub interpreter: InterpreterSettings,
    pub storage: StorageSettings,
}

impl Config {
    /// Loads defaults, then `path` (or the file named by STATECRAFT_CONFIG),
    /// then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var_os("STATECRAFT_CONFIG").map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        self.interpreter.apply_env_overrides();
        self.storage.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interpreter.max_microsteps == 0 {
            return Err(ConfigError::Validation(
                "interpreter.max_microsteps must be at least 1".to_string(),
            ));
        }
        if self.interpreter.step_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "interpreter.step_timeout_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterSettings {
    /// Microsteps a macrostep may take before it is aborted.
    pub max_microsteps: usize,
    /// How long the runner waits for an event before stepping again.
    pub step_timeout_ms: u64,
}

impl Default for InterpreterSettings {
    fn default() -> Self {
        Self {
            max_microsteps: DEFAULT_MAX_MICROSTEPS,
            step_timeout_ms: 200,
        }
    }
}

impl InterpreterSettings {
    fn apply_env_overrides(&mut self) {
        if let Some(n) = env_parse("STATECRAFT_MAX_MICROSTEPS") {
            self.max_microsteps = n;
        }
        if let Some(ms) = env_parse("STATECRAFT_STEP_TIMEOUT_MS") {
            self.step_timeout_ms = ms;
        }
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Snapshot directory. Sessions are not persisted when unset.
    pub snapshot_dir: Option<PathBuf>,
    /// Persist after this many configuration changes; 0 persists only on exit.
    pub snapshot_every: u64,
}

impl StorageSettings {
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("STATECRAFT_SNAPSHOT_DIR") {
            self.snapshot_dir = (!dir.is_empty()).then(|| PathBuf::from(dir));
        }
        if let Some(n) = env_parse("STATECRAFT_SNAPSHOT_EVERY") {
            self.snapshot_every = n;
        }
    }

    pub fn policy(&self) -> SnapshotPolicy {
        match (&self.snapshot_dir, self.snapshot_every) {
            (None, _) => SnapshotPolicy::Never,
            (Some(_), 0) => SnapshotPolicy::OnExit,
            (Some(_), n) => SnapshotPolicy::EveryNSteps(n),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(variable = name, value = %value, "ignoring unparsable setting");
            None
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {err}", path = .0.display(), err = .1)]
    Io(PathBuf, std::io::Error),

    #[error("failed to parse config file '{path}': {err}", path = .0.display(), err = .1)]
    Parse(PathBuf, String),

    #[error("invalid configuration: {0}")]
    Validation(String),
}
