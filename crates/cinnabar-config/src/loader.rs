//! Configuration loader with multi-source merging

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::{CinnabarConfig, ConfigError};

/// Project config filename, looked up in the working directory.
const PROJECT_CONFIG_FILE: &str = "cinnabar.toml";

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    config_file: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "CNB".to_string(),
            config_file: None,
        }
    }

    /// Set the project directory
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "CNB")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Load one explicit config file (the `--config <path>` override)
    /// instead of discovering user/project files. The file must exist and
    /// parse.
    pub fn with_config_file(mut self, path: impl AsRef<Path>) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<CinnabarConfig, ConfigError> {
        let mut builder = config::Config::builder();

        // 1. Start with built-in defaults
        let defaults = CinnabarConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        if let Some(config_file) = &self.config_file {
            // An explicit file replaces discovery and must be valid.
            validate_config_file(config_file)?;
            builder = builder.add_source(
                config::File::from(config_file.clone()).format(config::FileFormat::Toml),
            );
        } else {
            // 2. User config (~/.config/cinnabar/config.toml)
            if let Some(user_config_file) = user_config_file() {
                if user_config_file.exists() {
                    builder = builder.add_source(
                        config::File::from(user_config_file)
                            .required(false)
                            .format(config::FileFormat::Toml),
                    );
                }
            }

            // 3. Project config (cinnabar.toml)
            let project_config_file = self.project_dir.join(PROJECT_CONFIG_FILE);
            if project_config_file.exists() {
                builder = builder.add_source(
                    config::File::from(project_config_file)
                        .required(false)
                        .format(config::FileFormat::Toml),
                );
            }
        }

        // 4. Environment variables (CNB_*)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("_")
                .try_parsing(true),
        );

        let merged = builder.build()?;
        Ok(merged.try_deserialize()?)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks that an explicitly named config file is readable TOML, so the
/// error names the file instead of a generic merge failure.
fn validate_config_file(path: &Path) -> Result<(), ConfigError> {
    let text = fs::read_to_string(path).map_err(|e| ConfigError::InvalidFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    toml::from_str::<toml::Value>(&text).map_err(|e| ConfigError::InvalidFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(())
}

/// `~/.config/cinnabar/config.toml` (platform-appropriate).
fn user_config_file() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "cinnabar")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}
