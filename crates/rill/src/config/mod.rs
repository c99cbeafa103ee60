use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PROGRESSIVE_CHUNK_SIZE: usize = 12_800;
pub const DEFAULT_VIEW_SIZE: usize = 2048;
pub const DEFAULT_STREAM_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Development,
    Production,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Development => write!(f, "development"),
            Mode::Production => write!(f, "production"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Mode::Development),
            "production" | "prod" => Ok(Mode::Production),
            _ => Err(ConfigError::InvalidMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub mode: Mode,
    pub identifier_prefix: String,
    pub progressive_chunk_size: usize,
    pub view_size: usize,
    pub work_budget: Option<usize>,
    pub stream_capacity: usize,
    pub environment_name: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Development,
            identifier_prefix: String::new(),
            progressive_chunk_size: DEFAULT_PROGRESSIVE_CHUNK_SIZE,
            view_size: DEFAULT_VIEW_SIZE,
            work_budget: None,
            stream_capacity: DEFAULT_STREAM_CAPACITY,
            environment_name: "Server".to_string(),
        }
    }
}

impl RenderConfig {
    pub fn new(mode: Mode) -> Self {
        match mode {
            Mode::Development => Self::development(),
            Mode::Production => Self::production(),
        }
    }

    pub fn development() -> Self {
        Self { mode: Mode::Development, ..Self::default() }
    }

    pub fn production() -> Self {
        Self { mode: Mode::Production, work_budget: Some(512), ..Self::default() }
    }

    /// Client-render markers carry raw error messages only in development.
    pub fn include_error_messages(&self) -> bool {
        self.mode == Mode::Development
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.view_size == 0 {
            return Err(ConfigError::InvalidValue("view_size must be greater than 0".to_string()));
        }

        if self.stream_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "stream_capacity must be greater than 0".to_string(),
            ));
        }

        if self.work_budget == Some(0) {
            return Err(ConfigError::InvalidValue(
                "work_budget must be greater than 0 when set".to_string(),
            ));
        }

        if self.identifier_prefix.contains(['"', '<', '>']) {
            return Err(ConfigError::InvalidValue(format!(
                "identifier_prefix may not contain quotes or angle brackets: {}",
                self.identifier_prefix
            )));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(mode_str) = std::env::var("RILL_MODE") {
            config.mode = mode_str.parse()?;
        }

        if let Ok(prefix) = std::env::var("RILL_IDENTIFIER_PREFIX") {
            config.identifier_prefix = prefix;
        }

        if let Ok(size_str) = std::env::var("RILL_PROGRESSIVE_CHUNK_SIZE") {
            config.progressive_chunk_size = size_str.parse().map_err(|_| {
                ConfigError::InvalidConfig("RILL_PROGRESSIVE_CHUNK_SIZE".to_string())
            })?;
        }

        if let Ok(view_str) = std::env::var("RILL_VIEW_SIZE") {
            config.view_size = view_str
                .parse()
                .map_err(|_| ConfigError::InvalidConfig("RILL_VIEW_SIZE".to_string()))?;
        }

        if let Ok(budget_str) = std::env::var("RILL_WORK_BUDGET") {
            config.work_budget = Some(
                budget_str
                    .parse()
                    .map_err(|_| ConfigError::InvalidConfig("RILL_WORK_BUDGET".to_string()))?,
            );
        }

        if let Ok(capacity_str) = std::env::var("RILL_STREAM_CAPACITY") {
            config.stream_capacity = capacity_str
                .parse()
                .map_err(|_| ConfigError::InvalidConfig("RILL_STREAM_CAPACITY".to_string()))?;
        }

        if let Ok(environment_name) = std::env::var("RILL_ENVIRONMENT_NAME") {
            config.environment_name = environment_name;
        }

        config.validate()?;

        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::FileRead)?;

        let config: Self = toml::from_str(&contents).map_err(ConfigError::TomlParse)?;
        config.validate()?;

        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self).map_err(ConfigError::TomlSerialize)?;

        std::fs::write(path, contents).map_err(ConfigError::FileWrite)
    }

    pub fn resumable(&self) -> ResumableConfig {
        ResumableConfig {
            mode: self.mode,
            identifier_prefix: self.identifier_prefix.clone(),
            progressive_chunk_size: self.progressive_chunk_size,
        }
    }

    /// Fields that shaped an already-flushed document win over the caller's.
    pub fn apply_resumable(&mut self, resumable: &ResumableConfig) {
        self.mode = resumable.mode;
        self.identifier_prefix.clone_from(&resumable.identifier_prefix);
        self.progressive_chunk_size = resumable.progressive_chunk_size;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumableConfig {
    pub mode: Mode,
    pub identifier_prefix: String,
    pub progressive_chunk_size: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid mode: {0}")]
    InvalidMode(String),

    #[error("Invalid config value: {0}")]
    InvalidValue(String),

    #[error("Invalid config value for {0}")]
    InvalidConfig(String),

    #[error("Failed to read config file: {0}")]
    FileRead(std::io::Error),

    #[error("Failed to write config file: {0}")]
    FileWrite(std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParse(toml::de::Error),

    #[error("Failed to serialize TOML: {0}")]
    TomlSerialize(toml::ser::Error),
}
