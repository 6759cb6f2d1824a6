//! Configuration loader with multi-source merging.

use crate::{ConfigError, ConfigResult, Paths, WarrenConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Builder-pattern loader over the `config` crate.
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    /// A loader rooted at the current directory.
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "WARREN".to_string(),
        }
    }

    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Loads configuration from all sources with proper precedence.
    pub fn load(self) -> ConfigResult<WarrenConfig> {
        let mut builder = config::Config::builder();

        // 1. Built-in defaults.
        let defaults = WarrenConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. User config (~/.config/warren/config.toml).
        let paths = Paths::new();
        if let Ok(user_config_file) = paths.user_config_file() {
            if user_config_file.exists() {
                builder = builder.add_source(
                    config::File::from(user_config_file)
                        .required(false)
                        .format(config::FileFormat::Toml),
                );
            }
        }

        // 3. Project config (warren.toml).
        let project_config_file = Paths::project_config_file(&self.project_dir);
        if project_config_file.exists() {
            builder = builder.add_source(
                config::File::from(project_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 4. Local overrides (warren.local.toml, gitignored).
        let local_config_file = Paths::local_config_file(&self.project_dir);
        if local_config_file.exists() {
            builder = builder.add_source(
                config::File::from(local_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 5. Environment variables (WARREN_*).
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("_")
                .try_parsing(true),
        );

        let merged = builder.build()?;
        let mut warren_config: WarrenConfig = merged.try_deserialize()?;

        if warren_config.tls.is_partial() {
            return Err(ConfigError::Validation(
                "tls requires ca_file, cert_file, and key_file together".to_string(),
            ));
        }

        warren_config.resolve_paths(&self.project_dir);
        Ok(warren_config)
    }

    /// Loads configuration, falling back to defaults on any failure.
    pub fn load_or_default(self) -> WarrenConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn load_defaults_from_empty_dir() {
        let dir = tempdir().unwrap();
        let config = ConfigLoader::new()
            .with_project_dir(dir.path())
            .load()
            .unwrap();
        assert_eq!(config.manager.listen_addr, "0.0.0.0:7421");
        // data_dir resolves against the project dir.
        assert!(config.node.data_dir.starts_with(dir.path()));
    }

    #[test]
    fn project_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("warren.toml"),
            r#"
[manager]
listen_addr = "10.1.2.3:9000"
scheduler_interval_ms = 2500
"#,
        )
        .unwrap();

        let config = ConfigLoader::new()
            .with_project_dir(dir.path())
            .load()
            .unwrap();
        assert_eq!(config.manager.listen_addr, "10.1.2.3:9000");
        assert_eq!(config.manager.scheduler_interval_ms, 2_500);
        // Untouched sections keep their defaults.
        assert_eq!(config.worker.poll_interval_ms, 5_000);
    }

    #[test]
    fn local_file_overrides_project_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("warren.toml"), "[manager]\nlisten_addr = \"a:1\"\n").unwrap();
        fs::write(
            dir.path().join("warren.local.toml"),
            "[manager]\nlisten_addr = \"b:2\"\n",
        )
        .unwrap();

        let config = ConfigLoader::new()
            .with_project_dir(dir.path())
            .load()
            .unwrap();
        assert_eq!(config.manager.listen_addr, "b:2");
    }

    #[test]
    fn partial_tls_fails_validation() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("warren.toml"), "[tls]\nca_file = \"ca.pem\"\n").unwrap();

        let result = ConfigLoader::new().with_project_dir(dir.path()).load();
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }
}
