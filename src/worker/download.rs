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

//! Writing query results to disk for `malloy/download`.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::protocol::DownloadFormat;

/// Resolves a download target. `file://` uris map to their path; anything
/// without a scheme is taken as a plain filesystem path.
pub fn target_path(uri: &str) -> Result<PathBuf> {
    match Url::parse(uri) {
        Ok(url) if url.scheme() == "file" => url
            .to_file_path()
            .map_err(|()| anyhow!("Not a local file uri: {uri}")),
        Ok(url) => Err(anyhow!(
            "Unsupported download scheme '{}' in {uri}",
            url.scheme()
        )),
        Err(url::ParseError::RelativeUrlWithoutBase) => Ok(PathBuf::from(uri)),
        Err(e) => Err(e).with_context(|| format!("Invalid download uri: {uri}")),
    }
}

/// Serializes rows in the requested format.
pub fn render(rows: &[Map<String, Value>], format: DownloadFormat) -> Result<Vec<u8>> {
    match format {
        DownloadFormat::Json => {
            serde_json::to_vec_pretty(rows).context("Failed to encode rows as JSON")
        }
        DownloadFormat::Csv => render_csv(rows),
    }
}

fn render_csv(rows: &[Map<String, Value>]) -> Result<Vec<u8>> {
    // Columns in first-seen order across all rows.
    let mut columns: Vec<&str> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.contains(&key.as_str()) {
                columns.push(key);
            }
        }
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    if !columns.is_empty() {
        writer.write_record(&columns)?;
    }
    for row in rows {
        writer.write_record(columns.iter().map(|column| cell(row.get(*column))))?;
    }

    writer
        .into_inner()
        .map_err(|e| anyhow!("Failed to flush CSV output: {}", e.error()))
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Renders `rows` and writes them to `uri`, returning the path written.
pub async fn write(uri: &str, rows: &[Map<String, Value>], format: DownloadFormat) -> Result<PathBuf> {
    let path = target_path(uri)?;
    let bytes = render(rows, format)?;
    tokio::fs::write(&path, &bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    debug!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> Vec<Map<String, Value>> {
        let value = json!([
            {"carrier": "AA", "flights": 10},
            {"carrier": "B6, Inc", "flights": null, "note": "late"},
        ]);
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_csv_union_of_columns_and_quoting() {
        let bytes = render(&rows(), DownloadFormat::Csv).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "carrier,flights,note");
        assert_eq!(lines[1], "AA,10,");
        assert_eq!(lines[2], "\"B6, Inc\",,late");
    }

    #[test]
    fn test_json_is_an_array() {
        let bytes = render(&rows(), DownloadFormat::Json).unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_target_path() {
        assert_eq!(
            target_path("file:///tmp/out.csv").unwrap(),
            PathBuf::from("/tmp/out.csv")
        );
        assert_eq!(
            target_path("results/out.json").unwrap(),
            PathBuf::from("results/out.json")
        );
        assert!(target_path("https://example.com/out.csv").is_err());
    }

    #[tokio::test]
    async fn test_write_to_file_uri() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let uri = Url::from_file_path(&path).unwrap().to_string();

        let written = write(&uri, &rows(), DownloadFormat::Json).await.unwrap();
        assert_eq!(written, path);
        assert!(std::fs::read_to_string(&path).unwrap().contains("\"AA\""));
    }
}
