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

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

/// Which statements of a source text a query refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementSelector {
    /// The source is itself the statement.
    Whole,
    /// Every statement, in order.
    All,
    /// The statement at a zero-based index.
    Index(usize),
    /// The statement declaring `query: <name>` or `sql: <name>`.
    Named(String),
}

/// Input to [`QueryExecutor::execute`].
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// Resolved document or query text.
    pub source: String,
    /// Statement selection within `source`.
    pub selector: StatementSelector,
    /// Return the statement text without rows.
    pub show_sql_only: bool,
    /// Maximum number of rows, `None` for unlimited.
    pub row_limit: Option<u64>,
}

/// Output of a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryOutcome {
    /// Selected statement text.
    pub sql: String,
    /// Result rows.
    pub rows: Vec<Map<String, Value>>,
    /// True if rows were dropped to honor the row limit.
    pub truncated: bool,
}

/// Runs a resolved query. Injected into the worker so the protocol layer
/// never depends on a particular engine.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Executes `request`.
    ///
    /// # Errors
    ///
    /// Fails when the selected statement does not exist or cannot run.
    async fn execute(&self, request: QueryRequest) -> Result<QueryOutcome>;
}

/// Executor that selects statements from `;`-separated source text and
/// returns one row per selected statement.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatementExecutor;

#[async_trait]
impl QueryExecutor for StatementExecutor {
    async fn execute(&self, request: QueryRequest) -> Result<QueryOutcome> {
        let selected = select(&request.source, &request.selector)?;
        let sql = selected
            .iter()
            .map(|(_, text)| *text)
            .collect::<Vec<_>>()
            .join(";\n");

        if request.show_sql_only {
            return Ok(QueryOutcome {
                sql,
                ..QueryOutcome::default()
            });
        }

        let mut rows: Vec<Map<String, Value>> = selected
            .iter()
            .map(|(index, text)| {
                let mut row = Map::new();
                row.insert("index".to_string(), Value::from(*index));
                row.insert("statement".to_string(), Value::from(*text));
                row
            })
            .collect();

        let mut truncated = false;
        if let Some(limit) = request.row_limit {
            let limit = usize::try_from(limit).unwrap_or(usize::MAX);
            if rows.len() > limit {
                rows.truncate(limit);
                truncated = true;
            }
        }

        Ok(QueryOutcome {
            sql,
            rows,
            truncated,
        })
    }
}

/// Splits on `;`, dropping empty statements.
pub fn statements(source: &str) -> Vec<&str> {
    source
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn select<'a>(source: &'a str, selector: &StatementSelector) -> Result<Vec<(usize, &'a str)>> {
    let all = statements(source);

    match selector {
        StatementSelector::Whole => {
            let text = source.trim();
            if text.is_empty() {
                bail!("Query text is empty");
            }
            Ok(vec![(0, text)])
        }
        StatementSelector::All => {
            if all.is_empty() {
                bail!("Document contains no statements");
            }
            Ok(all.into_iter().enumerate().collect())
        }
        StatementSelector::Index(index) => match all.get(*index) {
            Some(text) => Ok(vec![(*index, *text)]),
            None => bail!(
                "Statement index {} out of range ({} statements)",
                index,
                all.len()
            ),
        },
        StatementSelector::Named(name) => all
            .iter()
            .enumerate()
            .find(|(_, text)| declares(text, name))
            .map(|(index, text)| vec![(index, *text)])
            .ok_or_else(|| anyhow::anyhow!("No query named '{name}'")),
    }
}

fn declares(statement: &str, name: &str) -> bool {
    ["query:", "sql:"].iter().any(|keyword| {
        statement.match_indices(keyword).any(|(at, _)| {
            let rest = statement[at + keyword.len()..].trim_start();
            rest.strip_prefix(name)
                .is_some_and(|tail| !tail.starts_with(|c: char| c.is_alphanumeric() || c == '_'))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = "source: flights is duckdb.table('flights.parquet');\n\
                         query: by_carrier is flights -> { group_by: carrier };\n\
                         query: by_carrier_total is flights -> { aggregate: n is count() };\n";

    fn request(selector: StatementSelector) -> QueryRequest {
        QueryRequest {
            source: MODEL.to_string(),
            selector,
            show_sql_only: false,
            row_limit: None,
        }
    }

    #[tokio::test]
    async fn test_select_by_index() {
        let outcome = StatementExecutor
            .execute(request(StatementSelector::Index(1)))
            .await
            .unwrap();
        assert!(outcome.sql.starts_with("query: by_carrier is"));
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0]["index"], 1);
    }

    #[tokio::test]
    async fn test_select_by_name_is_exact() {
        let outcome = StatementExecutor
            .execute(request(StatementSelector::Named("by_carrier_total".to_string())))
            .await
            .unwrap();
        assert!(outcome.sql.contains("aggregate"));

        let outcome = StatementExecutor
            .execute(request(StatementSelector::Named("by_carrier".to_string())))
            .await
            .unwrap();
        assert!(outcome.sql.contains("group_by"));
    }

    #[tokio::test]
    async fn test_out_of_range_and_unknown_name() {
        let err = StatementExecutor
            .execute(request(StatementSelector::Index(9)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));

        let err = StatementExecutor
            .execute(request(StatementSelector::Named("missing".to_string())))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No query named 'missing'"));
    }

    #[tokio::test]
    async fn test_row_limit_and_sql_only() {
        let mut all = request(StatementSelector::All);
        all.row_limit = Some(2);
        let outcome = StatementExecutor.execute(all).await.unwrap();
        assert_eq!(outcome.rows.len(), 2);
        assert!(outcome.truncated);

        let mut sql_only = request(StatementSelector::All);
        sql_only.show_sql_only = true;
        let outcome = StatementExecutor.execute(sql_only).await.unwrap();
        assert!(outcome.rows.is_empty());
        assert_eq!(outcome.sql.matches(";\n").count(), 2);
    }

    #[test]
    fn test_statements_skip_blanks() {
        assert_eq!(statements(" a ;; b;\n"), vec!["a", "b"]);
        assert!(statements("  ").is_empty());
    }
}
