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

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies what a worker must execute.
///
/// Serialized with a `type` tag. Every variant carries the `uri` of the
/// originating document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerQuerySpec {
    /// A query declared by name in the document.
    Named {
        /// Declared query name.
        name: String,
        /// Source document.
        uri: String,
    },
    /// Inline query text.
    #[serde(rename = "string")]
    Text {
        /// Raw query text.
        text: String,
        /// Source document.
        uri: String,
    },
    /// The statement at `index` of a multi-statement document.
    File {
        /// Zero-based statement index.
        index: usize,
        /// Source document.
        uri: String,
    },
    /// A named SQL statement.
    NamedSql {
        /// Declared statement name.
        name: String,
        /// Source document.
        uri: String,
    },
    /// The SQL statement at `index`.
    UnnamedSql {
        /// Zero-based statement index.
        index: usize,
        /// Source document.
        uri: String,
    },
}

impl WorkerQuerySpec {
    /// Document the query came from.
    pub fn uri(&self) -> &str {
        match self {
            Self::Named { uri, .. }
            | Self::Text { uri, .. }
            | Self::File { uri, .. }
            | Self::NamedSql { uri, .. }
            | Self::UnnamedSql { uri, .. } => uri,
        }
    }

    /// Wire tag of the variant.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Named { .. } => "named",
            Self::Text { .. } => "string",
            Self::File { .. } => "file",
            Self::NamedSql { .. } => "named_sql",
            Self::UnnamedSql { .. } => "unnamed_sql",
        }
    }
}

impl fmt::Display for WorkerQuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named { name, uri } => write!(f, "query '{name}' in {uri}"),
            Self::Text { uri, .. } => write!(f, "inline query in {uri}"),
            Self::File { index, uri } => write!(f, "statement {index} in {uri}"),
            Self::NamedSql { name, uri } => write!(f, "sql '{name}' in {uri}"),
            Self::UnnamedSql { index, uri } => write!(f, "sql statement {index} in {uri}"),
        }
    }
}
