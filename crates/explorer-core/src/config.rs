//! Configuration parsing for the test explorer.
//!
//! Reads the key=value format from `.rspec-explorer/config`.
//! Precedence: CLI flags > `--config` file > `.rspec-explorer/config` > defaults.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Project-relative location of the config file.
pub const PROJECT_CONFIG_PATH: &str = ".rspec-explorer/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("empty value for {0}")]
    EmptyValue(String),
}

/// Settings for discovery and execution.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Command line that invokes the test framework, run through `sh -c`.
    pub test_command: String,
    /// Spec root as it appears in the formatter's `file_path` values.
    pub spec_directory: String,
    /// Working directory for the framework and prefix for absolute paths.
    pub project_root: PathBuf,
    /// Helper formatter passed with `--require`, if any.
    pub formatter_path: Option<PathBuf>,
    /// File name suffix of spec files.
    pub spec_file_suffix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            test_command: "bundle exec rspec".to_string(),
            spec_directory: "./spec/".to_string(),
            project_root: PathBuf::from("."),
            formatter_path: None,
            spec_file_suffix: "_spec.rb".to_string(),
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load `<project_root>/.rspec-explorer/config` if it exists.
    pub fn load_project(project_root: &Path) -> Result<Self, ConfigError> {
        let mut config = Self {
            project_root: project_root.to_path_buf(),
            ..Self::default()
        };
        let path = project_root.join(PROJECT_CONFIG_PATH);
        if path.exists() {
            config.load_file(&path)?;
        }
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content, &path.display().to_string())
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str, source: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value, source)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str, source: &str) -> Result<(), ConfigError> {
        match key {
            "test_command" => self.test_command = Self::non_empty(key, value)?,
            "spec_directory" => self.spec_directory = normalize_spec_directory(value),
            "project_root" => self.project_root = PathBuf::from(Self::non_empty(key, value)?),
            "formatter_path" => {
                self.formatter_path = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "spec_file_suffix" => self.spec_file_suffix = Self::non_empty(key, value)?,
            _ => {
                warn!(key, source, "unknown config key");
            }
        }
        Ok(())
    }

    fn non_empty(key: &str, value: &str) -> Result<String, ConfigError> {
        if value.is_empty() {
            return Err(ConfigError::EmptyValue(key.to_string()));
        }
        Ok(value.to_string())
    }

    /// Resolve relative paths against a workspace root.
    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        if self.project_root.is_relative() {
            self.project_root = workspace_root.join(&self.project_root);
        }
        if let Some(formatter) = self.formatter_path.take() {
            self.formatter_path = Some(if formatter.is_relative() {
                self.project_root.join(formatter)
            } else {
                formatter
            });
        }
    }
}

/// Ensure the spec root ends with a separator so prefix stripping works on
/// whole path segments. Empty falls back to the default.
fn normalize_spec_directory(value: &str) -> String {
    if value.is_empty() {
        return Config::default().spec_directory;
    }
    if value.ends_with('/') {
        value.to_string()
    } else {
        format!("{value}/")
    }
}
