// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Integration tests for the `query-worker` command line.
//!
//! Verifies the `methods` listing, version output, and that configuration
//! errors from files and environment variables stop the worker before it
//! starts serving.

use std::process::{Command, Output, Stdio};

use anyhow::{Context, Result};
use serde_json::Value;

fn query_worker(args: &[&str], envs: &[(&str, &str)]) -> Result<Output> {
    let dir = tempfile::tempdir()?;
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_query-worker"));
    cmd.args(args)
        // Isolate from user-level config
        .env("XDG_CONFIG_HOME", dir.path())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in envs {
        cmd.env(key, value);
    }
    cmd.output().context("Failed to run query-worker")
}

#[test]
fn test_methods_lists_both_directions() -> Result<()> {
    let output = query_worker(&["methods"], &[])?;
    assert!(output.status.success());

    let listing: Value = serde_json::from_slice(&output.stdout)?;
    let to_worker = listing["toWorker"]
        .as_array()
        .context("Missing toWorker")?;
    let to_host = listing["toHost"].as_array().context("Missing toHost")?;

    assert_eq!(to_worker.len(), 10);
    assert_eq!(to_host.len(), 7);
    assert!(to_worker.contains(&Value::from("malloy/run-msql")));
    assert!(to_worker.contains(&Value::from("malloy/exit")));
    assert!(to_host.contains(&Value::from("malloy/MSQLQueryPanel")));
    assert!(!to_host.contains(&Value::from("malloy/exit")));
    Ok(())
}

#[test]
fn test_version_flag() -> Result<()> {
    let output = query_worker(&["--version"], &[])?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    let expected = concat!("query-worker ", env!("CARGO_PKG_VERSION"));
    assert!(stdout.starts_with(expected), "unexpected: {stdout}");
    Ok(())
}

#[test]
fn test_invalid_config_file_fails() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "row_limit = 0\n")?;
    let path = path.to_str().context("Temp path is not UTF-8")?;

    let output = query_worker(&["--config", path, "serve"], &[])?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("row_limit"), "unexpected stderr: {stderr}");
    Ok(())
}

#[test]
fn test_environment_overrides_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "row_limit = 25\n")?;
    let path = path.to_str().context("Temp path is not UTF-8")?;

    let output = query_worker(&["--config", path], &[("WORKER_LINK_ROW_LIMIT", "0")])?;
    assert!(!output.status.success());
    Ok(())
}

#[test]
fn test_serve_exits_when_stdin_closes() -> Result<()> {
    // Stdin is /dev/null: the host is gone before the first message.
    let output = query_worker(&["serve"], &[])?;
    assert!(output.status.success());
    assert!(output.stdout.is_empty());
    Ok(())
}
