// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Reference worker runtime.
//!
//! Handles every host-originated message: queries run as one task per
//! panel, status updates flow back through `malloy/queryPanel` or
//! `malloy/MSQLQueryPanel`, and source text is pulled from the host with
//! `malloy/fetch`.

pub mod download;
pub mod executor;

pub use executor::{
    QueryExecutor, QueryOutcome, QueryRequest, StatementExecutor, StatementSelector,
};

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, bail};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connections;
use crate::protocol::messages::{
    MessageCancel, MessageCancelMsql, MessageConfig, MessageDownload, MessageFetch,
    MessageFetchBinary, MessageFetchCellData, MessageRun, MessageRunMsql, WorkerDownloadMessage,
    WorkerFetchCellDataMessage, WorkerFetchMessage, WorkerQueryPanelMessage,
    WorkerSqlQueryPanelMessage,
};
use crate::protocol::{
    CellData, FetchTicket, PanelMessage, PendingFetches, QueryStatus, WorkerConfig,
    WorkerMessageHandler, WorkerQuerySpec, to_host, to_worker,
};
use crate::rpc::{Disposable, GenericConnection};

/// Documents with this suffix are notebooks and resolve through
/// `malloy/fetchCellData`.
const NOTEBOOK_SUFFIX: &str = ".malloynb";

/// Rows returned to a panel when neither side configures a limit.
pub const DEFAULT_ROW_LIMIT: u64 = 50;

/// Which panel family a query reports to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PanelKind {
    Query,
    Sql,
}

struct PanelTask {
    generation: u64,
    token: CancellationToken,
    handle: AbortHandle,
}

/// Where the text of a query comes from.
#[derive(Debug, Clone)]
enum QuerySource {
    Spec(WorkerQuerySpec),
    Msql {
        text: String,
        statement_index: Option<usize>,
    },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Adapts a worker method to a typed handler that holds only a weak
/// reference, so the connection's handler table does not keep the worker
/// alive.
fn bind<P, R, F, Fut>(
    worker: &Arc<Worker>,
    f: F,
) -> impl Fn(P) -> BoxFuture<'static, Result<R>> + Send + Sync + 'static
where
    P: Send + 'static,
    R: Send + 'static,
    F: Fn(Arc<Worker>, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let weak = Arc::downgrade(worker);
    move |params| {
        let call = weak.upgrade().map(|worker| f(worker, params));
        async move {
            match call {
                Some(call) => call.await,
                None => bail!("Worker has shut down"),
            }
        }
        .boxed()
    }
}

/// Worker runtime bound to one host connection.
pub struct Worker {
    handler: WorkerMessageHandler,
    executor: Arc<dyn QueryExecutor>,
    config: RwLock<WorkerConfig>,
    default_row_limit: u64,
    panels: Mutex<HashMap<(PanelKind, String), PanelTask>>,
    next_generation: AtomicU64,
    text_fetches: PendingFetches<MessageFetch>,
    binary_fetches: PendingFetches<MessageFetchBinary>,
    cell_fetches: PendingFetches<MessageFetchCellData>,
    shutdown: CancellationToken,
    registrations: Mutex<Vec<Disposable>>,
}

impl Worker {
    /// Creates the worker and installs its handlers on `connection`.
    ///
    /// `initial` holds until the host sends `malloy/config`; its `rowLimit`
    /// remains the fallback when a later host config omits one.
    pub fn new(
        connection: Arc<dyn GenericConnection>,
        executor: Arc<dyn QueryExecutor>,
        initial: WorkerConfig,
    ) -> Arc<Self> {
        let default_row_limit = initial.row_limit.unwrap_or(DEFAULT_ROW_LIMIT);
        let worker = Arc::new(Self {
            handler: WorkerMessageHandler::new(connection),
            executor,
            config: RwLock::new(initial),
            default_row_limit,
            panels: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            text_fetches: PendingFetches::new(),
            binary_fetches: PendingFetches::new(),
            cell_fetches: PendingFetches::new(),
            shutdown: CancellationToken::new(),
            registrations: Mutex::new(Vec::new()),
        });
        worker.install();
        worker
    }

    fn install(self: &Arc<Self>) {
        let handler = &self.handler;
        let registrations = vec![
            handler.on_request::<to_worker::Config, _, _>(bind(
                self,
                |worker, message: MessageConfig| async move {
                    worker.configure(message.config).await;
                    Ok(())
                },
            )),
            handler.on_request::<to_worker::Run, _, _>(bind(
                self,
                |worker, message: MessageRun| async move {
                    worker.start_run(message);
                    Ok(())
                },
            )),
            handler.on_request::<to_worker::RunMsql, _, _>(bind(
                self,
                |worker, message: MessageRunMsql| async move {
                    worker.start_run_msql(message);
                    Ok(())
                },
            )),
            handler.on_request::<to_worker::Cancel, _, _>(bind(
                self,
                |worker, message: MessageCancel| async move {
                    worker.cancel_panel(PanelKind::Query, message.panel_id).await;
                    Ok(())
                },
            )),
            handler.on_request::<to_worker::CancelMsql, _, _>(bind(
                self,
                |worker, message: MessageCancelMsql| async move {
                    worker.cancel_panel(PanelKind::Sql, message.panel_id).await;
                    Ok(())
                },
            )),
            handler.on_request::<to_worker::Download, _, _>(bind(
                self,
                |worker, message: MessageDownload| async move {
                    worker.start_download(message);
                    Ok(())
                },
            )),
            handler.on_request::<to_worker::Fetch, _, _>(bind(
                self,
                |worker, message: MessageFetch| async move {
                    worker.text_fetches.accept(message)
                },
            )),
            handler.on_request::<to_worker::FetchBinary, _, _>(bind(
                self,
                |worker, message: MessageFetchBinary| async move {
                    worker.binary_fetches.accept(message)
                },
            )),
            handler.on_request::<to_worker::FetchCellData, _, _>(bind(
                self,
                |worker, message: MessageFetchCellData| async move {
                    worker.cell_fetches.accept(message)
                },
            )),
            handler.on_request::<to_worker::Exit, _, _>(bind(
                self,
                |worker, (): ()| async move {
                    info!("Host requested exit");
                    worker.shutdown.cancel();
                    Ok(())
                },
            )),
        ];
        *lock(&self.registrations) = registrations;
    }

    /// Runs until the host sends `malloy/exit` or the connection drops, then
    /// stops every running query.
    pub async fn run(&self) {
        tokio::select! {
            () = self.shutdown.cancelled() => info!("Worker shutting down"),
            () = self.handler.closed() => info!("Host connection closed"),
        }
        self.stop();
    }

    /// Cancels all work and removes the worker's handlers.
    pub fn stop(&self) {
        self.shutdown.cancel();

        let panels: Vec<_> = lock(&self.panels).drain().collect();
        for ((_, panel_id), task) in panels {
            debug!("Aborting query in panel {}", panel_id);
            task.token.cancel();
            task.handle.abort();
        }

        self.text_fetches.cancel_all();
        self.binary_fetches.cancel_all();
        self.cell_fetches.cancel_all();

        let registrations: Vec<_> = lock(&self.registrations).drain(..).collect();
        for registration in registrations {
            debug!("Removing handler for {}", registration.method());
            let _ = registration.dispose();
        }
    }

    /// Current configuration.
    pub async fn config(&self) -> WorkerConfig {
        self.config.read().await.clone()
    }

    /// Row limit for panel results.
    pub async fn row_limit(&self) -> u64 {
        self.config
            .read()
            .await
            .row_limit
            .unwrap_or(self.default_row_limit)
    }

    /// Number of panels with a running query.
    pub fn running_panels(&self) -> usize {
        lock(&self.panels).len()
    }

    /// Registers interest in a `malloy/fetch` payload pushed by the host.
    ///
    /// The worker's own queries pull documents with requests to the host;
    /// pushed replies serve embedders that ask the host for content out of
    /// band and hand it the ticket's id. A push whose id matches no ticket is
    /// rejected back to the host.
    pub fn expect_text(&self, uri: &str) -> FetchTicket<String> {
        self.text_fetches.expect(uri)
    }

    /// Registers interest in a `malloy/fetchBinary` payload pushed by the host.
    pub fn expect_binary(&self, uri: &str) -> FetchTicket<Vec<u8>> {
        self.binary_fetches.expect(uri)
    }

    /// Registers interest in a `malloy/fetchCellData` payload pushed by the host.
    pub fn expect_cells(&self, uri: &str) -> FetchTicket<Vec<CellData>> {
        self.cell_fetches.expect(uri)
    }

    async fn configure(&self, config: WorkerConfig) {
        let described = connections::describe(&config.connections);
        info!(
            "Configuration updated: row limit {:?}, {} connection(s)",
            config.row_limit,
            described.len()
        );
        for (name, description) in described {
            self.handler.log(format!("Connection {name} {description}"));
        }
        if let Some(default) = connections::default_connection(&config.connections) {
            debug!("Default connection is {}", default.name);
        }
        *self.config.write().await = config;
    }

    fn start_run(self: &Arc<Self>, message: MessageRun) {
        info!(
            "Running {} [{}] ({}) in panel {}",
            message.name,
            message.query.kind(),
            message.query,
            message.panel_id
        );
        let source = QuerySource::Spec(message.query);
        self.start_panel(PanelKind::Query, message.panel_id, move |worker, panel_id, token| {
            worker.run_query(PanelKind::Query, panel_id, source, message.show_sql_only, token)
        });
    }

    fn start_run_msql(self: &Arc<Self>, message: MessageRunMsql) {
        info!(
            "Running SQL notebook statement {:?} in panel {}",
            message.statement_index, message.panel_id
        );
        let source = QuerySource::Msql {
            text: message.malloy_sql_query,
            statement_index: message.statement_index,
        };
        let show_sql_only = message.show_sql_only.unwrap_or(false);
        self.start_panel(PanelKind::Sql, message.panel_id, move |worker, panel_id, token| {
            worker.run_query(PanelKind::Sql, panel_id, source, show_sql_only, token)
        });
    }

    /// Spawns the query task for a panel, replacing any running one.
    ///
    /// A panel gets exactly one terminal status per run. The task reports
    /// only if its entry is still in the table when it finishes; otherwise a
    /// cancel or a newer run took the entry and the status belongs to them.
    fn start_panel<F, Fut>(self: &Arc<Self>, kind: PanelKind, panel_id: String, job: F)
    where
        F: FnOnce(Arc<Self>, String, CancellationToken) -> Fut,
        Fut: Future<Output = Option<QueryStatus>> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let token = self.shutdown.child_token();
        let key = (kind, panel_id.clone());
        let job = job(Arc::clone(self), panel_id, token.clone());

        let weak = Arc::downgrade(self);
        let finished = key.clone();

        // Held across the spawn so a fast task cannot try to remove its entry
        // before it exists.
        let mut panels = lock(&self.panels);
        let task = tokio::spawn(async move {
            let status = job.await;
            let Some(worker) = weak.upgrade() else {
                return;
            };
            if !worker.release_panel(&finished, generation) {
                debug!("Panel {} was taken over, dropping its result", finished.1);
                return;
            }
            if let Some(status) = status {
                worker.post_status(finished.0, &finished.1, &status).await;
            }
        });

        let replaced = panels.insert(
            key,
            PanelTask {
                generation,
                token,
                handle: task.abort_handle(),
            },
        );
        if let Some(previous) = replaced {
            debug!("Replacing running query in panel");
            previous.token.cancel();
        }
    }

    /// Removes the entry for `key` if it still belongs to `generation`.
    fn release_panel(&self, key: &(PanelKind, String), generation: u64) -> bool {
        let mut panels = lock(&self.panels);
        if panels
            .get(key)
            .is_some_and(|task| task.generation == generation)
        {
            panels.remove(key);
            true
        } else {
            false
        }
    }

    async fn cancel_panel(&self, kind: PanelKind, panel_id: String) {
        let task = lock(&self.panels).remove(&(kind, panel_id.clone()));
        let Some(task) = task else {
            debug!("No query running in panel {}", panel_id);
            return;
        };

        info!("Cancelling query in panel {}", panel_id);
        task.token.cancel();
        self.post_status(kind, &panel_id, &QueryStatus::Cancelled)
            .await;
    }

    /// Runs one query and returns its terminal status, or `None` once the
    /// token is cancelled.
    async fn run_query(
        self: Arc<Self>,
        kind: PanelKind,
        panel_id: String,
        source: QuerySource,
        show_sql_only: bool,
        token: CancellationToken,
    ) -> Option<QueryStatus> {
        self.post_status(kind, &panel_id, &QueryStatus::Compiling)
            .await;

        let outcome = async {
            let (text, selector) = self.resolve(&source, &token).await?;
            if !token.is_cancelled() {
                self.post_status(kind, &panel_id, &QueryStatus::Running)
                    .await;
            }
            let row_limit = Some(self.row_limit().await);
            self.execute(text, selector, show_sql_only, row_limit, &token)
                .await
        }
        .await;

        if token.is_cancelled() {
            debug!("Query in panel {} stopped after cancellation", panel_id);
            return None;
        }

        let status = match outcome {
            Ok(outcome) => match serde_json::to_value(&outcome) {
                Ok(result) => QueryStatus::Done {
                    result,
                    show_sql_only,
                },
                Err(e) => QueryStatus::Error {
                    error: format!("Failed to encode result: {e}"),
                },
            },
            Err(e) => {
                warn!("Query in panel {} failed: {:#}", panel_id, e);
                self.handler.log(format!("Query failed: {e:#}"));
                QueryStatus::Error {
                    error: format!("{e:#}"),
                }
            }
        };
        Some(status)
    }

    fn start_download(self: &Arc<Self>, message: MessageDownload) {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let token = worker.shutdown.child_token();
            let error = match worker.download(&message, &token).await {
                Ok(path) => {
                    info!("Downloaded {} to {}", message.name, path.display());
                    None
                }
                Err(e) => {
                    warn!("Download of {} failed: {:#}", message.name, e);
                    Some(format!("{e:#}"))
                }
            };

            let done = WorkerDownloadMessage {
                name: message.name,
                error,
            };
            if let Err(e) = worker.handler.send_request::<to_host::Download>(done).await {
                warn!("Failed to report download completion: {}", e);
            }
        });
    }

    async fn download(&self, message: &MessageDownload, token: &CancellationToken) -> Result<PathBuf> {
        let current = self.row_limit().await;
        let mut cap = message.download_options.amount.row_cap(Some(current));
        if let Some(max) = self.config.read().await.download_size {
            cap = Some(cap.map_or(max, |cap| cap.min(max)));
        }

        let source = QuerySource::Spec(message.query.clone());
        let (text, selector) = self.resolve(&source, token).await?;
        let outcome = self.execute(text, selector, false, cap, token).await?;
        download::write(&message.uri, &outcome.rows, message.download_options.format).await
    }

    async fn resolve(
        &self,
        source: &QuerySource,
        token: &CancellationToken,
    ) -> Result<(String, StatementSelector)> {
        let spec = match source {
            QuerySource::Msql {
                text,
                statement_index,
            } => {
                let selector = statement_index.map_or(StatementSelector::All, StatementSelector::Index);
                return Ok((text.clone(), selector));
            }
            QuerySource::Spec(spec) => spec,
        };

        match spec {
            WorkerQuerySpec::Text { text, .. } => Ok((text.clone(), StatementSelector::Whole)),
            WorkerQuerySpec::Named { name, uri } | WorkerQuerySpec::NamedSql { name, uri } => {
                let text = self.fetch_document(uri, token).await?;
                Ok((text, StatementSelector::Named(name.clone())))
            }
            WorkerQuerySpec::File { index, uri } | WorkerQuerySpec::UnnamedSql { index, uri } => {
                let text = self.fetch_document(uri, token).await?;
                Ok((text, StatementSelector::Index(*index)))
            }
        }
    }

    async fn fetch_document(&self, uri: &str, token: &CancellationToken) -> Result<String> {
        debug!("Fetching {}", uri);
        if uri.ends_with(NOTEBOOK_SUFFIX) {
            let cells = self
                .handler
                .send_request_with_token::<to_host::FetchCellData>(
                    WorkerFetchCellDataMessage {
                        uri: uri.to_string(),
                    },
                    token.clone(),
                )
                .await
                .with_context(|| format!("Failed to fetch cells of {uri}"))?;
            let texts: Vec<&str> = cells.iter().map(|cell| cell.text.as_str()).collect();
            return Ok(texts.join(";\n"));
        }

        self.handler
            .send_request_with_token::<to_host::Fetch>(
                WorkerFetchMessage {
                    uri: uri.to_string(),
                },
                token.clone(),
            )
            .await
            .with_context(|| format!("Failed to fetch {uri}"))
    }

    async fn execute(
        &self,
        source: String,
        selector: StatementSelector,
        show_sql_only: bool,
        row_limit: Option<u64>,
        token: &CancellationToken,
    ) -> Result<QueryOutcome> {
        let request = QueryRequest {
            source,
            selector,
            show_sql_only,
            row_limit,
        };
        tokio::select! {
            biased;
            () = token.cancelled() => bail!("Query cancelled"),
            outcome = self.executor.execute(request) => outcome,
        }
    }

    async fn post_status(&self, kind: PanelKind, panel_id: &str, status: &QueryStatus) {
        let message = PanelMessage::status(status);
        let panel_id = panel_id.to_string();
        let sent = match kind {
            PanelKind::Query => {
                self.handler
                    .send_request::<to_host::QueryPanel>(WorkerQueryPanelMessage {
                        panel_id,
                        message,
                    })
                    .await
            }
            PanelKind::Sql => {
                self.handler
                    .send_request::<to_host::MsqlQueryPanel>(WorkerSqlQueryPanelMessage {
                        panel_id,
                        message,
                    })
                    .await
            }
        };
        if let Err(e) = sent {
            warn!("Failed to update panel: {}", e);
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::panic,
    reason = "Tests use expect/panic for clear failure messages"
)]
mod tests {
    use super::*;
    use crate::connections::{ConnectionBackend, ConnectionConfig};
    use crate::protocol::ExtensionMessageHandler;
    use crate::protocol::{AmountKeyword, DownloadAmount, DownloadFormat, QueryDownloadOptions};
    use crate::rpc::LocalConnection;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const MODEL_URI: &str = "file:///models/flights.malloy";
    const MODEL: &str = "source: flights is duckdb.table('flights.parquet');\n\
                         query: by_carrier is flights -> { group_by: carrier };\n\
                         query: totals is flights -> { aggregate: n is count() };\n";

    struct StalledExecutor;

    #[async_trait]
    impl QueryExecutor for StalledExecutor {
        async fn execute(&self, _request: QueryRequest) -> Result<QueryOutcome> {
            std::future::pending().await
        }
    }

    struct Host {
        handler: ExtensionMessageHandler,
        statuses: mpsc::UnboundedReceiver<(&'static str, String, QueryStatus)>,
        downloads: mpsc::UnboundedReceiver<WorkerDownloadMessage>,
        fetches: Arc<AtomicUsize>,
        _registrations: Vec<Disposable>,
    }

    impl Host {
        async fn next_status(&mut self) -> (&'static str, String, QueryStatus) {
            tokio::time::timeout(Duration::from_secs(5), self.statuses.recv())
                .await
                .expect("timed out waiting for a panel update")
                .expect("status channel closed")
        }
    }

    /// Returns ten rows, honoring the requested limit.
    struct TenRowExecutor;

    #[async_trait]
    impl QueryExecutor for TenRowExecutor {
        async fn execute(&self, request: QueryRequest) -> Result<QueryOutcome> {
            let take = request.row_limit.map_or(10, |limit| limit.min(10));
            let rows = (0..take)
                .map(|n| {
                    let mut row = serde_json::Map::new();
                    row.insert("n".to_string(), n.into());
                    row
                })
                .collect();
            Ok(QueryOutcome {
                sql: request.source,
                rows,
                truncated: take < 10,
            })
        }
    }

    fn start(executor: Arc<dyn QueryExecutor>) -> (Host, Arc<Worker>) {
        start_with(executor, WorkerConfig::default())
    }

    fn start_with(executor: Arc<dyn QueryExecutor>, initial: WorkerConfig) -> (Host, Arc<Worker>) {
        let (host_end, worker_end) = LocalConnection::pair(Some(Duration::from_secs(5)));
        let worker = Worker::new(Arc::new(worker_end), executor, initial);
        let handler = ExtensionMessageHandler::new(Arc::new(host_end));

        let (status_tx, statuses) = mpsc::unbounded_channel();
        let (download_tx, downloads) = mpsc::unbounded_channel();
        let fetches = Arc::new(AtomicUsize::new(0));

        let query_tx = status_tx.clone();
        let sql_tx = status_tx;
        let fetch_count = Arc::clone(&fetches);
        let registrations = vec![
            handler.on_request::<to_host::Fetch, _, _>(move |message: WorkerFetchMessage| {
                fetch_count.fetch_add(1, Ordering::SeqCst);
                async move {
                    if message.uri == MODEL_URI {
                        Ok(MODEL.to_string())
                    } else {
                        bail!("No such document: {}", message.uri)
                    }
                }
            }),
            handler.on_request::<to_host::FetchCellData, _, _>(|_message| async {
                Ok(vec![
                    CellData {
                        uri: "file:///nb.malloynb#cell0".to_string(),
                        text: "select 1".to_string(),
                    },
                    CellData {
                        uri: "file:///nb.malloynb#cell1".to_string(),
                        text: "select 2".to_string(),
                    },
                ])
            }),
            handler.on_request::<to_host::QueryPanel, _, _>(move |message: WorkerQueryPanelMessage| {
                let status = message.message.query_status();
                let tx = query_tx.clone();
                async move {
                    if let Some(status) = status {
                        let _ = tx.send(("query", message.panel_id, status));
                    }
                    Ok(())
                }
            }),
            handler.on_request::<to_host::MsqlQueryPanel, _, _>(move |message: WorkerSqlQueryPanelMessage| {
                let status = message.message.query_status();
                let tx = sql_tx.clone();
                async move {
                    if let Some(status) = status {
                        let _ = tx.send(("sql", message.panel_id, status));
                    }
                    Ok(())
                }
            }),
            handler.on_request::<to_host::Download, _, _>(move |message: WorkerDownloadMessage| {
                let tx = download_tx.clone();
                async move {
                    let _ = tx.send(message);
                    Ok(())
                }
            }),
            handler.on_request::<to_host::Log, _, _>(|_message| async { Ok(()) }),
        ];

        let host = Host {
            handler,
            statuses,
            downloads,
            fetches,
            _registrations: registrations,
        };
        (host, worker)
    }

    fn run_message(panel_id: &str, query: WorkerQuerySpec) -> MessageRun {
        MessageRun {
            query,
            panel_id: panel_id.to_string(),
            name: "test".to_string(),
            show_sql_only: false,
        }
    }

    #[tokio::test]
    async fn test_named_query_reports_full_lifecycle() {
        let (mut host, _worker) = start(Arc::new(StatementExecutor));
        let query = WorkerQuerySpec::Named {
            name: "totals".to_string(),
            uri: MODEL_URI.to_string(),
        };
        host.handler
            .send_request::<to_worker::Run>(run_message("p1", query))
            .await
            .unwrap();

        assert_eq!(host.next_status().await.2, QueryStatus::Compiling);
        assert_eq!(host.next_status().await.2, QueryStatus::Running);
        let (family, panel, status) = host.next_status().await;
        assert_eq!((family, panel.as_str()), ("query", "p1"));
        let QueryStatus::Done { result, show_sql_only } = status else {
            panic!("expected done, got {status:?}");
        };
        assert!(!show_sql_only);
        assert!(result["sql"].as_str().unwrap().contains("aggregate"));
        assert_eq!(result["rows"][0]["index"], 2);
        assert_eq!(host.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_string_query_needs_no_fetch() {
        let (mut host, _worker) = start(Arc::new(StatementExecutor));
        let query = WorkerQuerySpec::Text {
            text: "run: flights -> { limit: 1 }".to_string(),
            uri: MODEL_URI.to_string(),
        };
        let mut message = run_message("p1", query);
        message.show_sql_only = true;
        host.handler.send_request::<to_worker::Run>(message).await.unwrap();

        host.next_status().await;
        host.next_status().await;
        let QueryStatus::Done { result, show_sql_only } = host.next_status().await.2 else {
            panic!("expected done");
        };
        assert!(show_sql_only);
        assert_eq!(result["rows"], serde_json::json!([]));
        assert_eq!(host.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_becomes_error_status() {
        let (mut host, _worker) = start(Arc::new(StatementExecutor));
        let query = WorkerQuerySpec::File {
            index: 0,
            uri: "file:///missing.malloy".to_string(),
        };
        host.handler
            .send_request::<to_worker::Run>(run_message("p1", query))
            .await
            .unwrap();

        assert_eq!(host.next_status().await.2, QueryStatus::Compiling);
        let QueryStatus::Error { error } = host.next_status().await.2 else {
            panic!("expected error");
        };
        assert!(error.contains("Failed to fetch file:///missing.malloy"));
        assert!(error.contains("No such document"));
    }

    #[tokio::test]
    async fn test_msql_reports_to_sql_panel() {
        let (mut host, _worker) = start(Arc::new(StatementExecutor));
        let message = MessageRunMsql {
            panel_id: "nb".to_string(),
            malloy_sql_query: "select 1; select 2; select 3".to_string(),
            statement_index: Some(1),
            show_sql_only: None,
        };
        host.handler.send_request::<to_worker::RunMsql>(message).await.unwrap();

        host.next_status().await;
        host.next_status().await;
        let (family, panel, status) = host.next_status().await;
        assert_eq!((family, panel.as_str()), ("sql", "nb"));
        let QueryStatus::Done { result, .. } = status else {
            panic!("expected done");
        };
        assert_eq!(result["sql"], "select 2");
    }

    #[tokio::test]
    async fn test_notebook_uri_uses_cell_data() {
        let (mut host, _worker) = start(Arc::new(StatementExecutor));
        let query = WorkerQuerySpec::UnnamedSql {
            index: 1,
            uri: "file:///nb.malloynb".to_string(),
        };
        host.handler
            .send_request::<to_worker::Run>(run_message("p1", query))
            .await
            .unwrap();

        host.next_status().await;
        host.next_status().await;
        let QueryStatus::Done { result, .. } = host.next_status().await.2 else {
            panic!("expected done");
        };
        assert_eq!(result["sql"], "select 2");
        assert_eq!(host.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_running_query() {
        let (mut host, worker) = start(Arc::new(StalledExecutor));
        let query = WorkerQuerySpec::Text {
            text: "run: flights -> { limit: 1 }".to_string(),
            uri: MODEL_URI.to_string(),
        };
        host.handler
            .send_request::<to_worker::Run>(run_message("p1", query))
            .await
            .unwrap();
        assert_eq!(host.next_status().await.2, QueryStatus::Compiling);
        assert_eq!(host.next_status().await.2, QueryStatus::Running);
        assert_eq!(worker.running_panels(), 1);

        host.handler
            .send_request::<to_worker::Cancel>(MessageCancel {
                panel_id: "p1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(host.next_status().await.2, QueryStatus::Cancelled);
        assert_eq!(worker.running_panels(), 0);

        // Cancelling an idle panel or the other panel family is a no-op.
        host.handler
            .send_request::<to_worker::CancelMsql>(MessageCancelMsql {
                panel_id: "p1".to_string(),
            })
            .await
            .unwrap();
        assert!(host.statuses.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_racing_done_yields_one_terminal_status() {
        let (host, worker) = start(Arc::new(StatementExecutor));
        let (status_tx, mut statuses) = mpsc::unbounded_channel();
        let canceller = host.handler.clone();

        // The host cancels the panel the moment it sees the result, before
        // acknowledging it.
        let _panel = host.handler.on_request::<to_host::QueryPanel, _, _>(
            move |message: WorkerQueryPanelMessage| {
                let canceller = canceller.clone();
                let tx = status_tx.clone();
                async move {
                    let Some(status) = message.message.query_status() else {
                        return Ok(());
                    };
                    if matches!(status, QueryStatus::Done { .. }) {
                        canceller
                            .send_request::<to_worker::Cancel>(MessageCancel {
                                panel_id: message.panel_id,
                            })
                            .await?;
                    }
                    let _ = tx.send(status);
                    anyhow::Ok(())
                }
            },
        );

        let query = WorkerQuerySpec::Text {
            text: "run: flights -> { limit: 1 }".to_string(),
            uri: MODEL_URI.to_string(),
        };
        host.handler
            .send_request::<to_worker::Run>(run_message("p1", query))
            .await
            .unwrap();

        let mut seen = Vec::new();
        loop {
            let status = tokio::time::timeout(Duration::from_secs(5), statuses.recv())
                .await
                .expect("timed out waiting for a panel update")
                .expect("status channel closed");
            let done = matches!(status, QueryStatus::Done { .. });
            seen.push(status);
            if done {
                break;
            }
        }
        assert_eq!(seen.len(), 3, "unexpected statuses: {seen:?}");
        assert_eq!(seen[0], QueryStatus::Compiling);
        assert_eq!(seen[1], QueryStatus::Running);
        assert!(statuses.try_recv().is_err());
        assert_eq!(worker.running_panels(), 0);
    }

    #[tokio::test]
    async fn test_new_run_replaces_panel_task() {
        let (host, worker) = start(Arc::new(StalledExecutor));
        for _ in 0..2 {
            let query = WorkerQuerySpec::Text {
                text: "run: flights -> { limit: 1 }".to_string(),
                uri: MODEL_URI.to_string(),
            };
            host.handler
                .send_request::<to_worker::Run>(run_message("p1", query))
                .await
                .unwrap();
        }
        assert_eq!(worker.running_panels(), 1);

        worker.stop();
        assert_eq!(worker.running_panels(), 0);
    }

    #[tokio::test]
    async fn test_config_sets_row_limit() {
        let (mut host, worker) = start(Arc::new(StatementExecutor));
        assert_eq!(worker.row_limit().await, 50);

        let config = WorkerConfig {
            row_limit: Some(1),
            connections: vec![ConnectionConfig {
                name: "warehouse".to_string(),
                backend: ConnectionBackend::Postgres,
                is_default: true,
            }],
            ..WorkerConfig::default()
        };
        host.handler
            .send_request::<to_worker::Config>(MessageConfig { config })
            .await
            .unwrap();
        assert_eq!(worker.row_limit().await, 1);
        assert_eq!(worker.config().await.connections.len(), 1);

        let message = MessageRunMsql {
            panel_id: "nb".to_string(),
            malloy_sql_query: "select 1; select 2".to_string(),
            statement_index: None,
            show_sql_only: Some(false),
        };
        host.handler.send_request::<to_worker::RunMsql>(message).await.unwrap();
        host.next_status().await;
        host.next_status().await;
        let QueryStatus::Done { result, .. } = host.next_status().await.2 else {
            panic!("expected done");
        };
        assert_eq!(result["rows"].as_array().unwrap().len(), 1);
        assert_eq!(result["truncated"], true);
    }

    #[tokio::test]
    async fn test_host_config_without_row_limit_falls_back() {
        let initial = WorkerConfig {
            row_limit: Some(2),
            ..WorkerConfig::default()
        };
        let (mut host, worker) = start_with(Arc::new(TenRowExecutor), initial);
        assert_eq!(worker.row_limit().await, 2);

        let config = WorkerConfig {
            row_limit: Some(7),
            ..WorkerConfig::default()
        };
        host.handler
            .send_request::<to_worker::Config>(MessageConfig { config })
            .await
            .unwrap();
        assert_eq!(worker.row_limit().await, 7);

        host.handler
            .send_request::<to_worker::Config>(MessageConfig::default())
            .await
            .unwrap();
        assert_eq!(worker.row_limit().await, 2);

        let query = WorkerQuerySpec::Text {
            text: "run: flights -> { select: * }".to_string(),
            uri: MODEL_URI.to_string(),
        };
        host.handler
            .send_request::<to_worker::Run>(run_message("p1", query))
            .await
            .unwrap();
        host.next_status().await;
        host.next_status().await;
        let QueryStatus::Done { result, .. } = host.next_status().await.2 else {
            panic!("expected done");
        };
        assert_eq!(result["rows"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_download_size_caps_rows() {
        let (mut host, _worker) = start(Arc::new(TenRowExecutor));
        let config = WorkerConfig {
            download_size: Some(3),
            ..WorkerConfig::default()
        };
        host.handler
            .send_request::<to_worker::Config>(MessageConfig { config })
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        for (name, amount, expected) in [
            ("all", DownloadAmount::Keyword(AmountKeyword::All), 3),
            ("fewer", DownloadAmount::Rows(1), 1),
            ("more", DownloadAmount::Rows(8), 3),
        ] {
            let path = dir.path().join(format!("{name}.json"));
            let message = MessageDownload {
                query: WorkerQuerySpec::Text {
                    text: "run: flights -> { select: * }".to_string(),
                    uri: MODEL_URI.to_string(),
                },
                panel_id: "p1".to_string(),
                name: name.to_string(),
                uri: url::Url::from_file_path(&path).unwrap().to_string(),
                download_options: QueryDownloadOptions {
                    format: DownloadFormat::Json,
                    amount,
                },
            };
            host.handler.send_request::<to_worker::Download>(message).await.unwrap();

            let done = tokio::time::timeout(Duration::from_secs(5), host.downloads.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!((done.name.as_str(), done.error), (name, None));

            let rows: serde_json::Value =
                serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
            assert_eq!(rows.as_array().unwrap().len(), expected, "download {name}");
        }
    }

    #[tokio::test]
    async fn test_download_writes_csv() {
        let (mut host, _worker) = start(Arc::new(StatementExecutor));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("carriers.csv");

        let message = MessageDownload {
            query: WorkerQuerySpec::File {
                index: 1,
                uri: MODEL_URI.to_string(),
            },
            panel_id: "p1".to_string(),
            name: "carriers".to_string(),
            uri: url::Url::from_file_path(&path).unwrap().to_string(),
            download_options: QueryDownloadOptions {
                format: DownloadFormat::Csv,
                amount: DownloadAmount::Keyword(AmountKeyword::All),
            },
        };
        host.handler.send_request::<to_worker::Download>(message).await.unwrap();

        let done = tokio::time::timeout(Duration::from_secs(5), host.downloads.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.name, "carriers");
        assert_eq!(done.error, None);

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("index,statement\n"));
        assert!(written.contains("by_carrier"));
    }

    #[tokio::test]
    async fn test_download_failure_is_reported() {
        let (mut host, _worker) = start(Arc::new(StatementExecutor));
        let message = MessageDownload {
            query: WorkerQuerySpec::File {
                index: 7,
                uri: MODEL_URI.to_string(),
            },
            panel_id: "p1".to_string(),
            name: "broken".to_string(),
            uri: "file:///nonexistent/dir/out.json".to_string(),
            download_options: QueryDownloadOptions {
                format: DownloadFormat::Json,
                amount: DownloadAmount::Rows(10),
            },
        };
        host.handler.send_request::<to_worker::Download>(message).await.unwrap();

        let done = tokio::time::timeout(Duration::from_secs(5), host.downloads.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(done.error.unwrap().contains("out of range"));
    }

    #[tokio::test]
    async fn test_pushed_fetch_reaches_ticket() {
        let (host, worker) = start(Arc::new(StatementExecutor));
        let ticket = worker.expect_text("file:///a.malloy");
        let reply = MessageFetch {
            id: ticket.id.clone(),
            uri: "file:///a.malloy".to_string(),
            data: Some("source: a is duckdb.table('a.csv')".to_string()),
            error: None,
        };
        host.handler.send_request::<to_worker::Fetch>(reply).await.unwrap();
        assert!(ticket.wait().await.unwrap().starts_with("source: a"));

        let ticket = worker.expect_binary("file:///a.parquet");
        let reply = MessageFetchBinary {
            id: ticket.id.clone(),
            uri: "file:///a.parquet".to_string(),
            data: Some(vec![1, 2].into()),
            error: Some("truncated".to_string()),
        };
        host.handler.send_request::<to_worker::FetchBinary>(reply).await.unwrap();
        assert!(ticket.wait().await.is_err());
    }

    #[tokio::test]
    async fn test_unmatched_fetch_push_is_rejected() {
        let (host, worker) = start(Arc::new(StatementExecutor));
        let err = host
            .handler
            .send_request::<to_worker::Fetch>(MessageFetch {
                id: "unclaimed".to_string(),
                uri: MODEL_URI.to_string(),
                data: Some(MODEL.to_string()),
                error: None,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unclaimed"), "unexpected: {err}");

        let ticket = worker.expect_cells("file:///nb.malloynb");
        let id = ticket.id.clone();
        host.handler
            .send_request::<to_worker::FetchCellData>(MessageFetchCellData {
                id: id.clone(),
                uri: "file:///nb.malloynb".to_string(),
                data: Some(Vec::new()),
                error: None,
            })
            .await
            .unwrap();
        assert!(ticket.wait().await.unwrap().is_empty());

        // A ticket is consumed by its reply.
        let again = host
            .handler
            .send_request::<to_worker::FetchCellData>(MessageFetchCellData {
                id,
                uri: "file:///nb.malloynb".to_string(),
                data: Some(Vec::new()),
                error: None,
            })
            .await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn test_exit_ends_run() {
        let (host, worker) = start(Arc::new(StatementExecutor));
        let running = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run().await })
        };
        let cells = worker.expect_cells("file:///nb.malloynb");

        host.handler.send_request::<to_worker::Exit>(()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert!(cells.wait().await.is_err());

        // Handlers are gone after shutdown.
        let err = host
            .handler
            .send_request::<to_worker::Config>(MessageConfig::default())
            .await
            .unwrap_err();
        assert!(err.is_no_handler());
    }

    #[tokio::test]
    async fn test_host_disconnect_ends_run() {
        let (host, worker) = start(Arc::new(StatementExecutor));
        let running = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run().await })
        };
        drop(host);
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
    }
}
