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

//! Payload shapes, one struct per message.

#![allow(missing_docs, reason = "Fields mirror the wire format one to one")]

use serde::{Deserialize, Serialize};

use super::query::WorkerQuerySpec;
use super::types::{Binary, CellData, PanelMessage, QueryDownloadOptions, WorkerConfig};

// Host -> worker

/// `malloy/run`: execute a query and stream status to a panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRun {
    pub query: WorkerQuerySpec,
    pub panel_id: String,
    pub name: String,
    #[serde(rename = "showSQLOnly")]
    pub show_sql_only: bool,
}

/// `malloy/run-msql`: execute a statement of a SQL notebook document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRunMsql {
    pub panel_id: String,
    #[serde(rename = "malloySQLQuery")]
    pub malloy_sql_query: String,
    /// `null` runs the whole document.
    pub statement_index: Option<usize>,
    #[serde(
        rename = "showSQLOnly",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub show_sql_only: Option<bool>,
}

/// `malloy/cancel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCancel {
    pub panel_id: String,
}

/// `malloy/cancelMSQL`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCancelMsql {
    pub panel_id: String,
}

/// `malloy/config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageConfig {
    pub config: WorkerConfig,
}

/// `malloy/fetch`: text content the worker asked for, or why it failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFetch {
    pub id: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `malloy/fetchBinary`. `data` is base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFetchBinary {
    pub id: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Binary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `malloy/fetchCellData`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFetchCellData {
    pub id: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<CellData>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `malloy/download`: execute a query and write its rows to `uri`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDownload {
    pub query: WorkerQuerySpec,
    pub panel_id: String,
    pub name: String,
    pub uri: String,
    pub download_options: QueryDownloadOptions,
}

// Worker -> host

/// `malloy/download`: completion of a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDownloadMessage {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `malloy/log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLogMessage {
    pub message: String,
}

/// `malloy/queryPanel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerQueryPanelMessage {
    pub panel_id: String,
    pub message: PanelMessage,
}

/// `malloy/MSQLQueryPanel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSqlQueryPanelMessage {
    pub panel_id: String,
    pub message: PanelMessage,
}

/// `malloy/fetch`: resolve a uri to text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFetchMessage {
    pub uri: String,
}

/// `malloy/fetchBinary`: resolve a uri to bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFetchBinaryMessage {
    pub uri: String,
}

/// `malloy/fetchCellData`: resolve a notebook uri to its cells.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFetchCellDataMessage {
    pub uri: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{AmountKeyword, DownloadAmount, DownloadFormat};
    use serde_json::json;

    #[test]
    fn test_run_wire_names() {
        let run = MessageRun {
            query: WorkerQuerySpec::Named {
                name: "by_carrier".to_string(),
                uri: "file:///flights.malloy".to_string(),
            },
            panel_id: "panel-7".to_string(),
            name: "by_carrier".to_string(),
            show_sql_only: false,
        };
        let value = serde_json::to_value(&run).unwrap();
        assert_eq!(value["panelId"], "panel-7");
        assert_eq!(value["showSQLOnly"], false);
        assert_eq!(value["query"]["type"], "named");
    }

    #[test]
    fn test_run_msql_statement_index_nullable() {
        let value = json!({
            "panelId": "p",
            "malloySQLQuery": "select 1",
            "statementIndex": null
        });
        let msg: MessageRunMsql = serde_json::from_value(value).unwrap();
        assert_eq!(msg.statement_index, None);
        assert_eq!(msg.show_sql_only, None);

        let out = serde_json::to_value(&msg).unwrap();
        assert_eq!(out["statementIndex"], json!(null));
        assert!(out.get("showSQLOnly").is_none());
    }

    #[test]
    fn test_download_options() {
        let value = json!({
            "query": {"type": "file", "index": 0, "uri": "file:///a.malloy"},
            "panelId": "p",
            "name": "export",
            "uri": "file:///tmp/out.csv",
            "downloadOptions": {"format": "csv", "amount": "all"}
        });
        let msg: MessageDownload = serde_json::from_value(value).unwrap();
        assert_eq!(msg.download_options.format, DownloadFormat::Csv);
        assert_eq!(
            msg.download_options.amount,
            DownloadAmount::Keyword(AmountKeyword::All)
        );
    }

    #[test]
    fn test_fetch_reply_omits_absent_fields() {
        let reply = MessageFetch {
            id: "1".to_string(),
            uri: "file:///a".to_string(),
            data: None,
            error: Some("ENOENT".to_string()),
        };
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"id": "1", "uri": "file:///a", "error": "ENOENT"})
        );
    }
}
