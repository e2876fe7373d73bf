/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::connections::ConnectionConfig;
use crate::protocol::WorkerConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Outbound request timeout in seconds, 0 to disable (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Default tracing directive for this crate (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Rows returned to a panel unless the host overrides it (default: 50)
    #[serde(default = "default_row_limit")]
    pub row_limit: u64,

    /// Connections known before the host sends its own configuration
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

fn default_request_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_row_limit() -> u64 {
    50
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            log_level: default_log_level(),
            row_limit: default_row_limit(),
            connections: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from standard paths or a specific file.
    ///
    /// # Errors
    ///
    /// Fails when a file cannot be parsed or a value is invalid.
    pub fn load(explicit_file: Option<PathBuf>) -> Result<Self> {
        let user_file = dirs::config_dir().map(|dir| dir.join("worker-link").join("config.toml"));
        Self::load_layers(user_file, explicit_file)
    }

    /// Loads defaults, then `user_file` if it exists, then `explicit_file`,
    /// then `WORKER_LINK_*` environment variables.
    ///
    /// # Errors
    ///
    /// Fails when a file cannot be parsed or a value is invalid.
    pub fn load_layers(user_file: Option<PathBuf>, explicit_file: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // 1. Start with defaults
        builder = builder
            .set_default("request_timeout", default_request_timeout())?
            .set_default("log_level", default_log_level())?
            .set_default("row_limit", default_row_limit())?;

        // 2. Load from user config directory (~/.config/worker-link/config.toml)
        if let Some(path) = user_file.filter(|path| path.exists()) {
            builder = builder.add_source(config::File::from(path));
        }

        // 3. Load from explicit file if provided
        if let Some(path) = explicit_file {
            builder = builder.add_source(config::File::from(path));
        }

        // 4. Environment (WORKER_LINK_ROW_LIMIT, etc.)
        builder = builder.add_source(
            config::Environment::with_prefix("WORKER_LINK")
                .prefix_separator("_")
                .separator("__"),
        );

        let config: Self = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.row_limit == 0 {
            bail!("row_limit must be greater than zero");
        }
        if self.log_level.trim().is_empty() {
            bail!("log_level must not be empty");
        }
        Ok(())
    }

    /// Request timeout, `None` when disabled.
    pub const fn request_timeout(&self) -> Option<Duration> {
        if self.request_timeout == 0 {
            None
        } else {
            Some(Duration::from_secs(self.request_timeout))
        }
    }

    /// Worker configuration in effect before the host sends `malloy/config`.
    pub fn initial_worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            row_limit: Some(self.row_limit),
            connections: self.connections.clone(),
            ..WorkerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::ConnectionBackend;

    fn write(dir: &tempfile::TempDir, name: &str, value: &toml::Table) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, toml::to_string(value).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = Config::load_layers(None, None).unwrap();
        assert_eq!(config.request_timeout, 30);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.row_limit, 50);
        assert!(config.connections.is_empty());
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_explicit_file_overrides_user_file() {
        let dir = tempfile::tempdir().unwrap();
        let user: toml::Table = toml::from_str("row_limit = 10\nlog_level = \"debug\"").unwrap();
        let explicit: toml::Table = toml::from_str("row_limit = 20").unwrap();
        let user = write(&dir, "user.toml", &user);
        let explicit = write(&dir, "explicit.toml", &explicit);

        let config = Config::load_layers(Some(user), Some(explicit)).unwrap();
        assert_eq!(config.row_limit, 20);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_missing_user_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_layers(Some(dir.path().join("absent.toml")), None).unwrap();
        assert_eq!(config.row_limit, 50);
    }

    #[test]
    fn test_connections_and_worker_config() {
        let dir = tempfile::tempdir().unwrap();
        let table: toml::Table = toml::from_str(
            r#"
            request_timeout = 0

            [[connections]]
            name = "warehouse"
            backend = "postgres"

            [[connections]]
            name = "local"
            backend = "duckdb"
            "#,
        )
        .unwrap();
        let path = write(&dir, "config.toml", &table);

        let config = Config::load_layers(None, Some(path)).unwrap();
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.connections.len(), 2);
        assert_eq!(config.connections[1].backend, ConnectionBackend::DuckDb);

        let initial = config.initial_worker_config();
        assert_eq!(initial.row_limit, Some(50));
        assert_eq!(crate::connections::default_index(&initial.connections), Some(0));
    }

    #[test]
    fn test_zero_row_limit_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let table: toml::Table = toml::from_str("row_limit = 0").unwrap();
        let path = write(&dir, "config.toml", &table);
        assert!(Config::load_layers(None, Some(path)).is_err());
    }
}
