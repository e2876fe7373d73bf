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

//! Database connection entries and default-connection lookup.

use serde::{Deserialize, Serialize};

/// Database engine behind a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionBackend {
    /// Google BigQuery.
    BigQuery,
    /// PostgreSQL.
    Postgres,
    /// Embedded DuckDB.
    DuckDb,
}

impl ConnectionBackend {
    /// Name shown to users.
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::BigQuery => "BigQuery",
            Self::Postgres => "Postgres",
            Self::DuckDb => "DuckDB",
        }
    }
}

/// One configured connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Connection name referenced from models.
    pub name: String,
    /// Engine.
    pub backend: ConnectionBackend,
    /// Marks the connection used when a model names none.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_default: bool,
}

/// Index of the default connection.
///
/// The first entry flagged default wins; without a flag the first entry is
/// the default. Returns `None` for an empty list.
pub fn default_index(configs: &[ConnectionConfig]) -> Option<usize> {
    if configs.is_empty() {
        return None;
    }
    Some(configs.iter().position(|c| c.is_default).unwrap_or(0))
}

/// The default connection, if any.
pub fn default_connection(configs: &[ConnectionConfig]) -> Option<&ConnectionConfig> {
    default_index(configs).and_then(|i| configs.get(i))
}

/// `(name, description)` pairs such as `("warehouse", "(Postgres, default)")`.
pub fn describe(configs: &[ConnectionConfig]) -> Vec<(String, String)> {
    let default = default_index(configs);
    configs
        .iter()
        .enumerate()
        .map(|(index, config)| {
            let suffix = if Some(index) == default { ", default" } else { "" };
            (
                config.name.clone(),
                format!("({}{})", config.backend.display_name(), suffix),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(name: &str, backend: ConnectionBackend, is_default: bool) -> ConnectionConfig {
        ConnectionConfig {
            name: name.to_string(),
            backend,
            is_default,
        }
    }

    #[test]
    fn test_default_index_prefers_flag() {
        let configs = vec![
            connection("bq", ConnectionBackend::BigQuery, false),
            connection("pg", ConnectionBackend::Postgres, true),
            connection("duck", ConnectionBackend::DuckDb, true),
        ];
        assert_eq!(default_index(&configs), Some(1));
        assert_eq!(default_connection(&configs).map(|c| c.name.as_str()), Some("pg"));
    }

    #[test]
    fn test_default_index_falls_back_to_first() {
        let configs = vec![
            connection("duck", ConnectionBackend::DuckDb, false),
            connection("pg", ConnectionBackend::Postgres, false),
        ];
        assert_eq!(default_index(&configs), Some(0));
        assert_eq!(default_index(&[]), None);
    }

    #[test]
    fn test_describe() {
        let configs = vec![
            connection("bq", ConnectionBackend::BigQuery, false),
            connection("duck", ConnectionBackend::DuckDb, true),
        ];
        assert_eq!(
            describe(&configs),
            vec![
                ("bq".to_string(), "(BigQuery)".to_string()),
                ("duck".to_string(), "(DuckDB, default)".to_string()),
            ]
        );
    }

    #[test]
    fn test_backend_wire_names() {
        let parsed: ConnectionConfig =
            serde_json::from_str(r#"{"name":"x","backend":"duckdb"}"#).unwrap();
        assert_eq!(parsed.backend, ConnectionBackend::DuckDb);
        assert!(!parsed.is_default);

        let bq: ConnectionBackend = serde_json::from_str(r#""bigquery""#).unwrap();
        assert_eq!(bq, ConnectionBackend::BigQuery);
    }
}
