use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from runtally.toml.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TallyConfig {
    pub target: TargetConfig,
    pub filter: FilterConfig,
    pub timing: TimingConfig,
    pub run: RunConfig,
    pub report: ReportConfig,
}

/// The program launched once per cycle.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TargetConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Overrides the inherited working directory when set.
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Only lines containing this substring are considered.
    pub substring: String,
    pub threshold: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimingConfig {
    pub window_ms: u64,
    pub pause_ms: u64,
    pub poll_interval_ms: u64,
    pub final_drain_ms: u64,
    pub grace_period_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RunConfig {
    /// Stop after this many cycles. Runs until interrupted when unset.
    pub max_cycles: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReportConfig {
    pub format: ReportFormat,
    /// Append the raw source line to each report.
    pub include_line: bool,
}

// --- Default implementations ---

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            command: "electron".to_string(),
            args: vec![
                "--no-sandbox".to_string(),
                "--enable-blink-features=CanvasHDR".to_string(),
                "./dist/main.js".to_string(),
            ],
            working_dir: None,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            substring: "importSharedTexture".to_string(),
            threshold: 300,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            window_ms: 15_000,
            pause_ms: 500,
            poll_interval_ms: 100,
            final_drain_ms: 200,
            grace_period_ms: 2_000,
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            format: ReportFormat::Text,
            include_line: true,
        }
    }
}

impl TimingConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn final_drain(&self) -> Duration {
        Duration::from_millis(self.final_drain_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Errors produced while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML for this schema.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A setting has a value the runner cannot work with.
    Invalid { field: &'static str, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid { field, reason } => {
                write!(f, "invalid config value for {}: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

impl TallyConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Reject settings that would make a cycle meaningless or spin the CPU.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.command.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "target.command",
                reason: "must not be empty".to_string(),
            });
        }
        if self.filter.substring.is_empty() {
            return Err(ConfigError::Invalid {
                field: "filter.substring",
                reason: "must not be empty".to_string(),
            });
        }
        if self.timing.window_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "timing.window_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.timing.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "timing.poll_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}
