// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Query worker binary.
//!
//! Speaks the worker-link protocol over stdin/stdout until the host sends
//! `malloy/exit` or closes the pipe. Logs go to stderr.

#![allow(clippy::print_stdout, reason = "`methods` prints the registries to stdout")]

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use worker_link::config::Config;
use worker_link::protocol::{to_host, to_worker};
use worker_link::rpc::StreamConnection;
use worker_link::worker::{StatementExecutor, Worker};

/// Time allowed for in-flight responses to reach the host on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Command-line arguments for the query worker.
#[derive(Parser, Debug)]
#[command(name = "query-worker")]
#[command(about = "Background query worker speaking the worker-link protocol over stdio")]
#[command(version = env!("WORKER_LINK_VERSION"))]
struct Args {
    /// The subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Outbound request timeout in seconds (0 to disable).
    /// Overrides config file if set (default in config is 30).
    #[arg(long, global = true)]
    request_timeout: Option<u64>,

    /// Log level for the worker (e.g. "debug").
    /// Overrides config file if set; `RUST_LOG` adds further directives.
    #[arg(long, global = true)]
    log_level: Option<String>,
}

/// Subcommands supported by the query worker.
#[derive(Subcommand, Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    /// Serve the protocol on stdin/stdout (default if no subcommand given).
    Serve,

    /// Print the message names of both directions as JSON.
    Methods,
}

/// Entry point for the query worker.
///
/// # Errors
///
/// Returns an error if configuration cannot be loaded or the subcommand fails.
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        None | Some(Command::Serve) => {
            run_server(args).await?;
            // The stdin reader blocks a runtime thread and cannot be
            // cancelled, so the runtime would never finish shutting down.
            std::process::exit(0);
        }
        Some(Command::Methods) => run_methods(),
    }
}

fn run_methods() -> Result<()> {
    let listing = serde_json::json!({
        "toWorker": to_worker::METHODS,
        "toHost": to_host::METHODS,
    });
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

async fn run_server(args: Args) -> Result<()> {
    // Load configuration
    let mut config = Config::load(args.config)?;

    // CLI flags override the file and environment
    if let Some(timeout) = args.request_timeout {
        config.request_timeout = timeout;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("worker_link={}", config.log_level).parse()?)
                .add_directive(format!("query_worker={}", config.log_level).parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting query worker {}", env!("WORKER_LINK_VERSION"));
    match config.request_timeout() {
        Some(timeout) => info!("Request timeout: {}s", timeout.as_secs()),
        None => info!("Request timeout disabled"),
    }
    for (name, description) in worker_link::connections::describe(&config.connections) {
        info!("Configured connection {} {}", name, description);
    }

    let connection = Arc::new(StreamConnection::stdio(config.request_timeout()));
    let worker = Worker::new(
        connection.clone(),
        Arc::new(StatementExecutor),
        config.initial_worker_config(),
    );

    worker.run().await;

    connection.shutdown(SHUTDOWN_GRACE).await;
    info!("Query worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_serve() {
        let args = Args::try_parse_from(["query-worker"]).unwrap();
        assert_eq!(args.command, None);
        assert!(args.config.is_none());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::try_parse_from([
            "query-worker",
            "serve",
            "--request-timeout",
            "0",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.command, Some(Command::Serve));
        assert_eq!(args.request_timeout, Some(0));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_methods_command() {
        let args = Args::try_parse_from(["query-worker", "methods"]).unwrap();
        assert_eq!(args.command, Some(Command::Methods));
    }
}
