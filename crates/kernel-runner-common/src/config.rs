//! Runner defaults loaded from a TOML file with environment overrides.
//!
//! [`RunnerConfig`] holds defaults for the generic options. Values are layered
//! as: built-in defaults, then the TOML file, then `KERNEL_RUNNER_*`
//! environment variables. Explicit command-line values win over all of them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::ecosystem::Ecosystem;
use crate::options::LanguageStandard;

pub const ENV_ECOSYSTEM: &str = "KERNEL_RUNNER_ECOSYSTEM";
pub const ENV_DEVICE: &str = "KERNEL_RUNNER_DEVICE";
pub const ENV_PLATFORM: &str = "KERNEL_RUNNER_PLATFORM";
pub const ENV_NUM_RUNS: &str = "KERNEL_RUNNER_NUM_RUNS";
pub const ENV_KERNEL_SOURCES_DIR: &str = "KERNEL_RUNNER_KERNEL_SOURCES_DIR";
pub const ENV_INPUT_BUFFER_DIR: &str = "KERNEL_RUNNER_INPUT_BUFFER_DIR";
pub const ENV_OUTPUT_BUFFER_DIR: &str = "KERNEL_RUNNER_OUTPUT_BUFFER_DIR";
pub const ENV_LOG_LEVEL: &str = "KERNEL_RUNNER_LOG_LEVEL";

/// Every environment variable [`RunnerConfig::apply_env_overrides`] reads.
pub const ENV_KEYS: [&str; 8] = [
    ENV_ECOSYSTEM,
    ENV_DEVICE,
    ENV_PLATFORM,
    ENV_NUM_RUNS,
    ENV_KERNEL_SOURCES_DIR,
    ENV_INPUT_BUFFER_DIR,
    ENV_OUTPUT_BUFFER_DIR,
    ENV_LOG_LEVEL,
];

/// Minimum severity of emitted log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
    Off,
}

impl LogLevel {
    /// The equivalent `tracing` filter directive.
    pub fn filter_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error | Self::Critical => "error",
            Self::Off => "off",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
            Self::Off => "off",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warning),
            "error" | "err" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            "off" => Ok(Self::Off),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// Defaults for generic runner options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Override: `KERNEL_RUNNER_ECOSYSTEM`
    pub ecosystem: Option<Ecosystem>,
    /// Override: `KERNEL_RUNNER_DEVICE`
    pub device: usize,
    /// Override: `KERNEL_RUNNER_PLATFORM`
    pub platform: Option<usize>,
    /// Override: `KERNEL_RUNNER_NUM_RUNS`
    pub num_runs: u32,
    /// Override: `KERNEL_RUNNER_KERNEL_SOURCES_DIR`
    pub kernel_sources_dir: PathBuf,
    /// Override: `KERNEL_RUNNER_INPUT_BUFFER_DIR`
    pub input_buffer_dir: PathBuf,
    /// Override: `KERNEL_RUNNER_OUTPUT_BUFFER_DIR`
    pub output_buffer_dir: PathBuf,
    /// Override: `KERNEL_RUNNER_LOG_LEVEL`
    pub log_level: LogLevel,
    /// Messages at or above this level flush the log sink immediately.
    pub log_flush_threshold: LogLevel,
    /// Language standard passed to the compiler; `None` keeps the compiler default.
    pub language_standard: Option<LanguageStandard>,
    /// Write output buffers to files after the final run.
    pub write_output: bool,
    /// Allow output files to replace existing ones.
    pub overwrite_allowed: bool,
    /// Zero output-only device buffers before every run.
    pub zero_output_buffers: bool,
    /// Time each kernel run.
    pub time_execution: bool,
    /// Emit line info for profilers.
    pub generate_line_info: bool,
    /// Extra include directories for kernel compilation.
    pub include_paths: Vec<PathBuf>,
    /// Raw `NAME` or `NAME=VALUE` preprocessor definitions.
    pub defines: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            ecosystem: None,
            device: 0,
            platform: None,
            num_runs: 1,
            kernel_sources_dir: PathBuf::from("."),
            input_buffer_dir: PathBuf::from("."),
            output_buffer_dir: PathBuf::from("."),
            log_level: LogLevel::Warning,
            log_flush_threshold: LogLevel::Info,
            language_standard: None,
            write_output: true,
            overwrite_allowed: false,
            zero_output_buffers: false,
            time_execution: false,
            generate_line_info: true,
            include_paths: Vec::new(),
            defines: Vec::new(),
        }
    }
}

/// Errors that can occur when loading or validating a [`RunnerConfig`].
#[derive(Debug, thiserror::Error)]
pub enum RunnerConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride {
        key: String,
        value: String,
        reason: String,
    },
}

impl RunnerConfig {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, RunnerConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from TOML text, then apply environment overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, RunnerConfigError> {
        let mut cfg: RunnerConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, RunnerConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), RunnerConfigError> {
        if self.num_runs == 0 {
            return Err(RunnerConfigError::Validation("num_runs must be > 0".into()));
        }
        if self.platform.is_some() && self.ecosystem == Some(Ecosystem::Cuda) {
            return Err(RunnerConfigError::Validation(
                "platform is only meaningful for the opencl ecosystem".into(),
            ));
        }
        if let Some(bad) = self.defines.iter().find(|d| d.trim().is_empty()) {
            return Err(RunnerConfigError::Validation(format!(
                "preprocessor definitions must not be blank, got {bad:?}"
            )));
        }
        Ok(())
    }

    /// Apply `KERNEL_RUNNER_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), RunnerConfigError> {
        if let Ok(val) = std::env::var(ENV_ECOSYSTEM) {
            self.ecosystem = Some(val.parse::<Ecosystem>().map_err(|reason| {
                RunnerConfigError::EnvOverride { key: ENV_ECOSYSTEM.into(), value: val.clone(), reason }
            })?);
        }

        if let Ok(val) = std::env::var(ENV_DEVICE) {
            self.device = val.parse::<usize>().map_err(|e| RunnerConfigError::EnvOverride {
                key: ENV_DEVICE.into(),
                value: val.clone(),
                reason: e.to_string(),
            })?;
        }

        if let Ok(val) = std::env::var(ENV_PLATFORM) {
            self.platform = Some(val.parse::<usize>().map_err(|e| {
                RunnerConfigError::EnvOverride {
                    key: ENV_PLATFORM.into(),
                    value: val.clone(),
                    reason: e.to_string(),
                }
            })?);
        }

        if let Ok(val) = std::env::var(ENV_NUM_RUNS) {
            self.num_runs = val.parse::<u32>().map_err(|e| RunnerConfigError::EnvOverride {
                key: ENV_NUM_RUNS.into(),
                value: val.clone(),
                reason: e.to_string(),
            })?;
        }

        if let Ok(val) = std::env::var(ENV_KERNEL_SOURCES_DIR) {
            self.kernel_sources_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var(ENV_INPUT_BUFFER_DIR) {
            self.input_buffer_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var(ENV_OUTPUT_BUFFER_DIR) {
            self.output_buffer_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(ENV_LOG_LEVEL) {
            self.log_level = val.parse::<LogLevel>().map_err(|reason| {
                RunnerConfigError::EnvOverride { key: ENV_LOG_LEVEL.into(), value: val.clone(), reason }
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn cleared() -> Vec<(&'static str, Option<&'static str>)> {
        ENV_KEYS.iter().map(|k| (*k, None)).collect()
    }

    fn with_env(overrides: &[(&'static str, &'static str)], f: impl FnOnce()) {
        let mut vars = cleared();
        for (key, value) in overrides {
            if let Some(slot) = vars.iter_mut().find(|(k, _)| k == key) {
                slot.1 = Some(*value);
            }
        }
        temp_env::with_vars(vars, f);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(RunnerConfig::default().validate().is_ok());
    }

    #[test]
    #[serial(kernel_runner_env)]
    fn test_from_toml_partial_uses_defaults() {
        with_env(&[], || {
            let cfg = RunnerConfig::from_toml(
                r#"
ecosystem = "opencl"
platform = 1
num_runs = 5
language_standard = "c++14"
defines = ["TILE=16"]
"#,
            )
            .unwrap();
            assert_eq!(cfg.ecosystem, Some(Ecosystem::OpenCl));
            assert_eq!(cfg.platform, Some(1));
            assert_eq!(cfg.num_runs, 5);
            assert_eq!(cfg.language_standard, Some(LanguageStandard::Cxx14));
            assert_eq!(cfg.defines, vec!["TILE=16".to_string()]);
            assert_eq!(cfg.log_level, LogLevel::Warning);
            assert!(cfg.write_output);
        });
    }

    #[test]
    fn test_validation_zero_runs() {
        let cfg = RunnerConfig { num_runs: 0, ..Default::default() };
        assert!(cfg.validate().unwrap_err().to_string().contains("num_runs must be > 0"));
    }

    #[test]
    fn test_validation_platform_with_cuda() {
        let cfg = RunnerConfig {
            ecosystem: Some(Ecosystem::Cuda),
            platform: Some(0),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    #[serial(kernel_runner_env)]
    fn test_env_override_fields() {
        with_env(
            &[
                (ENV_ECOSYSTEM, "opencl"),
                (ENV_DEVICE, "2"),
                (ENV_NUM_RUNS, "7"),
                (ENV_OUTPUT_BUFFER_DIR, "/tmp/out"),
                (ENV_LOG_LEVEL, "debug"),
            ],
            || {
                let cfg = RunnerConfig::from_env().unwrap();
                assert_eq!(cfg.ecosystem, Some(Ecosystem::OpenCl));
                assert_eq!(cfg.device, 2);
                assert_eq!(cfg.num_runs, 7);
                assert_eq!(cfg.output_buffer_dir, PathBuf::from("/tmp/out"));
                assert_eq!(cfg.log_level, LogLevel::Debug);
            },
        );
    }

    #[test]
    #[serial(kernel_runner_env)]
    fn test_env_override_invalid_ecosystem() {
        with_env(&[(ENV_ECOSYSTEM, "metal")], || match RunnerConfig::from_env().unwrap_err() {
            RunnerConfigError::EnvOverride { key, .. } => assert_eq!(key, ENV_ECOSYSTEM),
            other => panic!("expected EnvOverride, got: {other}"),
        });
    }

    #[test]
    #[serial(kernel_runner_env)]
    fn test_env_override_wins_over_toml() {
        with_env(&[(ENV_NUM_RUNS, "3")], || {
            let cfg = RunnerConfig::from_toml("num_runs = 10").unwrap();
            assert_eq!(cfg.num_runs, 3);
        });
    }

    #[test]
    #[serial(kernel_runner_env)]
    fn test_load_from_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "device = 1\ntime_execution = true").unwrap();
        with_env(&[], || {
            let cfg = RunnerConfig::load(file.path()).unwrap();
            assert_eq!(cfg.device, 1);
            assert!(cfg.time_execution);
        });
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!(LogLevel::Critical.filter_directive(), "error");
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!("loud".parse::<LogLevel>().is_err());
    }
}
