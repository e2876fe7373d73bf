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

//! Supporting payload types shared by several messages.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::connections::ConnectionConfig;

/// Settings pushed from the host with `malloy/config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Maximum rows returned to a panel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_limit: Option<u64>,

    /// Maximum rows written by a download.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_size: Option<u64>,

    /// Database connections known to the host.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<ConnectionConfig>,

    /// Keys this crate does not interpret, preserved as sent.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One notebook cell, as returned by `malloy/fetchCellData`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellData {
    /// Cell document uri.
    pub uri: String,
    /// Cell source.
    pub text: String,
}

/// Binary content, carried on the wire as a standard base64 string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Binary(pub Vec<u8>);

impl From<Vec<u8>> for Binary {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<Binary> for Vec<u8> {
    fn from(binary: Binary) -> Self {
        binary.0
    }
}

impl Serialize for Binary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Binary {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded)
            .map(Self)
            .map_err(|err| serde::de::Error::custom(format!("Invalid base64 content: {err}")))
    }
}

/// File format of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadFormat {
    /// Pretty-printed JSON array of rows.
    Json,
    /// Comma separated values with a header row.
    Csv,
}

/// Named download sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmountKeyword {
    /// As many rows as the panel currently shows.
    Current,
    /// Every row.
    All,
}

/// How many rows a download should contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DownloadAmount {
    /// `"current"` or `"all"`.
    Keyword(AmountKeyword),
    /// An explicit row count.
    Rows(u64),
}

impl DownloadAmount {
    /// Resolves the amount to a row cap given the panel's current limit.
    pub const fn row_cap(self, current_limit: Option<u64>) -> Option<u64> {
        match self {
            Self::Keyword(AmountKeyword::Current) => current_limit,
            Self::Keyword(AmountKeyword::All) => None,
            Self::Rows(n) => Some(n),
        }
    }
}

/// Options attached to `malloy/download`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDownloadOptions {
    /// Output format.
    pub format: DownloadFormat,
    /// Row count.
    pub amount: DownloadAmount,
}

/// Lifecycle of a query as reported to its panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum QueryStatus {
    /// Source is being resolved.
    Compiling,
    /// The executor is running.
    Running,
    /// Finished successfully.
    Done {
        /// Executor output.
        result: Value,
        /// Whether only the statement text was requested.
        #[serde(rename = "showSQLOnly", default)]
        show_sql_only: bool,
    },
    /// Finished with an error.
    Error {
        /// Error text.
        error: String,
    },
    /// Cancelled by the host.
    Cancelled,
}

/// Opaque panel update carried by `malloy/queryPanel` and
/// `malloy/MSQLQueryPanel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PanelMessage(pub Value);

impl PanelMessage {
    const STATUS_TYPE: &'static str = "query-status";

    /// Wraps a status update as `{"type": "query-status", "status": ...}`.
    pub fn status(status: &QueryStatus) -> Self {
        let mut value = serde_json::to_value(status).unwrap_or(Value::Null);
        if let Value::Object(object) = &mut value {
            object.insert("type".to_string(), Value::from(Self::STATUS_TYPE));
        }
        Self(value)
    }

    /// Decodes a status update, if this is one.
    pub fn query_status(&self) -> Option<QueryStatus> {
        if self.0.get("type").and_then(Value::as_str) != Some(Self::STATUS_TYPE) {
            return None;
        }
        serde_json::from_value(self.0.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_is_base64_on_the_wire() {
        let value = serde_json::to_value(Binary(b"PAR1".to_vec())).unwrap();
        assert_eq!(value, "UEFSMQ==");

        let back: Binary = serde_json::from_value(value).unwrap();
        assert_eq!(back.0, b"PAR1");

        assert!(serde_json::from_value::<Binary>(serde_json::json!([1, 2])).is_err());
        assert!(serde_json::from_value::<Binary>(serde_json::json!("not base64!")).is_err());
    }
    use serde_json::json;

    #[test]
    fn test_download_amount_forms() {
        let all: DownloadAmount = serde_json::from_value(json!("all")).unwrap();
        assert_eq!(all, DownloadAmount::Keyword(AmountKeyword::All));
        assert_eq!(all.row_cap(Some(10)), None);

        let current: DownloadAmount = serde_json::from_value(json!("current")).unwrap();
        assert_eq!(current.row_cap(Some(10)), Some(10));

        let rows: DownloadAmount = serde_json::from_value(json!(250)).unwrap();
        assert_eq!(rows, DownloadAmount::Rows(250));
        assert_eq!(serde_json::to_value(rows).unwrap(), json!(250));
    }

    #[test]
    fn test_config_keeps_unknown_keys() {
        let raw = json!({
            "rowLimit": 20,
            "connections": [{"name": "warehouse", "backend": "postgres", "isDefault": true}],
            "telemetry": false
        });
        let config: WorkerConfig = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(config.row_limit, Some(20));
        assert_eq!(config.download_size, None);
        assert_eq!(config.connections.len(), 1);
        assert_eq!(config.extra.get("telemetry"), Some(&json!(false)));

        assert_eq!(serde_json::to_value(&config).unwrap(), raw);
    }

    #[test]
    fn test_panel_status_shape() {
        let message = PanelMessage::status(&QueryStatus::Error {
            error: "boom".to_string(),
        });
        assert_eq!(
            message.0,
            json!({"type": "query-status", "status": "error", "error": "boom"})
        );
        assert_eq!(
            message.query_status(),
            Some(QueryStatus::Error {
                error: "boom".to_string()
            })
        );

        let other = PanelMessage(json!({"type": "start-download"}));
        assert_eq!(other.query_status(), None);
    }
}
