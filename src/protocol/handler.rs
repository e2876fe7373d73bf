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

//! Typed, direction-enforcing views over a [`GenericConnection`].
//!
//! The worker can only handle [`ToWorker`] messages and only send [`ToHost`]
//! ones; the extension host is the mirror image. Getting a direction wrong is
//! a compile error:
//!
//! ```compile_fail
//! # use std::sync::Arc;
//! # use worker_link::protocol::{WorkerMessageHandler, to_host};
//! # fn check(worker: WorkerMessageHandler) {
//! // `malloy/queryPanel` is worker -> host; the worker cannot handle it.
//! let _ = worker.on_request::<to_host::QueryPanel, _, _>(|_| async { Ok(()) });
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::messages::WorkerLogMessage;
use super::registry::{MessageType, ToHost, ToWorker, to_host};
use crate::rpc::protocol::{INTERNAL_ERROR, INVALID_PARAMS, ResponseError};
use crate::rpc::{Disposable, GenericConnection, RequestHandler, RpcError, handler_fn};

/// Adapts a typed async handler to the untyped connection interface.
fn typed_handler<M, F, Fut>(handler: F) -> RequestHandler
where
    M: MessageType,
    F: Fn(M::Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<M::Result>> + Send + 'static,
{
    handler_fn(move |params: Value| {
        let call = serde_json::from_value::<M::Params>(params).map(&handler);
        async move {
            let pending = call.map_err(|e| ResponseError {
                code: INVALID_PARAMS,
                message: format!("Invalid params for '{}': {e}", M::METHOD),
                data: None,
            })?;

            let result = pending.await.map_err(|e| {
                warn!("Handler for {} failed: {:#}", M::METHOD, e);
                ResponseError {
                    code: INTERNAL_ERROR,
                    message: format!("{e:#}"),
                    data: None,
                }
            })?;

            serde_json::to_value(result).map_err(|e| ResponseError {
                code: INTERNAL_ERROR,
                message: format!("Failed to encode result of '{}': {e}", M::METHOD),
                data: None,
            })
        }
    })
}

async fn typed_request<M: MessageType>(
    connection: &dyn GenericConnection,
    params: M::Params,
    token: Option<CancellationToken>,
) -> Result<M::Result, RpcError> {
    let params = serde_json::to_value(params)?;
    let value = connection.send_request(M::METHOD, params, token).await?;
    Ok(serde_json::from_value(value)?)
}

/// Worker-side message handler.
#[derive(Clone)]
pub struct WorkerMessageHandler {
    connection: Arc<dyn GenericConnection>,
}

impl WorkerMessageHandler {
    /// Wraps an existing connection.
    pub fn new(connection: Arc<dyn GenericConnection>) -> Self {
        Self { connection }
    }

    /// Installs the handler for a host-originated message.
    pub fn on_request<M, F, Fut>(&self, handler: F) -> Disposable
    where
        M: ToWorker,
        F: Fn(M::Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<M::Result>> + Send + 'static,
    {
        self.connection
            .on_request(M::METHOD, typed_handler::<M, F, Fut>(handler))
    }

    /// Sends a worker-originated message to the host.
    ///
    /// # Errors
    ///
    /// See [`GenericConnection::send_request`].
    pub async fn send_request<M: ToHost>(&self, params: M::Params) -> Result<M::Result, RpcError> {
        typed_request::<M>(self.connection.as_ref(), params, None).await
    }

    /// Like [`Self::send_request`], abandoned when `token` is cancelled.
    ///
    /// # Errors
    ///
    /// See [`GenericConnection::send_request`].
    pub async fn send_request_with_token<M: ToHost>(
        &self,
        params: M::Params,
        token: CancellationToken,
    ) -> Result<M::Result, RpcError> {
        typed_request::<M>(self.connection.as_ref(), params, Some(token)).await
    }

    /// Forwards a log line to the host without waiting for it.
    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        debug!("worker log: {}", message);

        let connection = Arc::clone(&self.connection);
        tokio::spawn(async move {
            let params = WorkerLogMessage { message };
            if let Err(e) = typed_request::<to_host::Log>(connection.as_ref(), params, None).await {
                warn!("Failed to forward log line: {}", e);
            }
        });
    }

    /// True while the host is reachable.
    pub fn is_alive(&self) -> bool {
        self.connection.is_alive()
    }

    /// Resolves once the host has gone away.
    pub async fn closed(&self) {
        self.connection.closed().await;
    }
}

/// Extension-side message handler.
#[derive(Clone)]
pub struct ExtensionMessageHandler {
    connection: Arc<dyn GenericConnection>,
}

impl ExtensionMessageHandler {
    /// Wraps an existing connection.
    pub fn new(connection: Arc<dyn GenericConnection>) -> Self {
        Self { connection }
    }

    /// Installs the handler for a worker-originated message.
    pub fn on_request<M, F, Fut>(&self, handler: F) -> Disposable
    where
        M: ToHost,
        F: Fn(M::Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<M::Result>> + Send + 'static,
    {
        self.connection
            .on_request(M::METHOD, typed_handler::<M, F, Fut>(handler))
    }

    /// Sends a host-originated message to the worker.
    ///
    /// # Errors
    ///
    /// See [`GenericConnection::send_request`].
    pub async fn send_request<M: ToWorker>(&self, params: M::Params) -> Result<M::Result, RpcError> {
        typed_request::<M>(self.connection.as_ref(), params, None).await
    }

    /// Like [`Self::send_request`], abandoned when `token` is cancelled.
    ///
    /// # Errors
    ///
    /// See [`GenericConnection::send_request`].
    pub async fn send_request_with_token<M: ToWorker>(
        &self,
        params: M::Params,
        token: CancellationToken,
    ) -> Result<M::Result, RpcError> {
        typed_request::<M>(self.connection.as_ref(), params, Some(token)).await
    }

    /// True while the worker is reachable.
    pub fn is_alive(&self) -> bool {
        self.connection.is_alive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{
        MessageCancel, MessageConfig, MessageFetch, MessageFetchBinary, MessageFetchCellData,
        MessageRun, MessageRunMsql, MessageCancelMsql, MessageDownload, WorkerFetchBinaryMessage,
        WorkerFetchMessage, WorkerQueryPanelMessage,
    };
    use crate::protocol::query::WorkerQuerySpec;
    use crate::protocol::registry::to_worker;
    use crate::protocol::types::{
        AmountKeyword, Binary, DownloadAmount, DownloadFormat, PanelMessage, QueryDownloadOptions,
        QueryStatus,
    };
    use crate::rpc::LocalConnection;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn pair() -> (ExtensionMessageHandler, WorkerMessageHandler) {
        let (host, worker) = LocalConnection::pair(Some(Duration::from_secs(5)));
        (
            ExtensionMessageHandler::new(Arc::new(host)),
            WorkerMessageHandler::new(Arc::new(worker)),
        )
    }

    fn query() -> WorkerQuerySpec {
        WorkerQuerySpec::File {
            index: 0,
            uri: "file:///m.malloy".to_string(),
        }
    }

    /// Registers a handler that records the method name for every
    /// host-originated message and sends each one once.
    #[tokio::test]
    async fn test_every_host_message_reaches_its_handler() {
        let (host, worker) = pair();
        let seen = Arc::new(Mutex::new(Vec::<&'static str>::new()));

        macro_rules! record {
            ($m:ty) => {{
                let seen = Arc::clone(&seen);
                worker.on_request::<$m, _, _>(move |_| {
                    seen.lock().unwrap().push(<$m>::METHOD);
                    async { Ok(()) }
                })
            }};
        }

        let _handles = vec![
            record!(to_worker::Run),
            record!(to_worker::RunMsql),
            record!(to_worker::Cancel),
            record!(to_worker::CancelMsql),
            record!(to_worker::Config),
            record!(to_worker::Fetch),
            record!(to_worker::FetchBinary),
            record!(to_worker::FetchCellData),
            record!(to_worker::Download),
            record!(to_worker::Exit),
        ];

        host.send_request::<to_worker::Run>(MessageRun {
            query: query(),
            panel_id: "p".to_string(),
            name: "q".to_string(),
            show_sql_only: false,
        })
        .await
        .unwrap();
        host.send_request::<to_worker::RunMsql>(MessageRunMsql {
            panel_id: "p".to_string(),
            malloy_sql_query: "select 1".to_string(),
            statement_index: None,
            show_sql_only: None,
        })
        .await
        .unwrap();
        host.send_request::<to_worker::Cancel>(MessageCancel {
            panel_id: "p".to_string(),
        })
        .await
        .unwrap();
        host.send_request::<to_worker::CancelMsql>(MessageCancelMsql {
            panel_id: "p".to_string(),
        })
        .await
        .unwrap();
        host.send_request::<to_worker::Config>(MessageConfig::default())
            .await
            .unwrap();
        host.send_request::<to_worker::Fetch>(MessageFetch {
            id: "1".to_string(),
            uri: "u".to_string(),
            data: Some("text".to_string()),
            error: None,
        })
        .await
        .unwrap();
        host.send_request::<to_worker::FetchBinary>(MessageFetchBinary {
            id: "2".to_string(),
            uri: "u".to_string(),
            data: Some(vec![1, 2, 3].into()),
            error: None,
        })
        .await
        .unwrap();
        host.send_request::<to_worker::FetchCellData>(MessageFetchCellData {
            id: "3".to_string(),
            uri: "u".to_string(),
            data: Some(Vec::new()),
            error: None,
        })
        .await
        .unwrap();
        host.send_request::<to_worker::Download>(MessageDownload {
            query: query(),
            panel_id: "p".to_string(),
            name: "d".to_string(),
            uri: "file:///tmp/d.json".to_string(),
            download_options: QueryDownloadOptions {
                format: DownloadFormat::Json,
                amount: DownloadAmount::Keyword(AmountKeyword::Current),
            },
        })
        .await
        .unwrap();
        host.send_request::<to_worker::Exit>(()).await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), to_worker::METHODS.len());
        for method in to_worker::METHODS {
            assert!(seen.contains(method), "{method} never reached its handler");
        }
    }

    #[tokio::test]
    async fn test_typed_result_round_trip() {
        let (host, worker) = pair();
        let _handle = host.on_request::<to_host::Fetch, _, _>(|msg: WorkerFetchMessage| async move {
            Ok(format!("contents of {}", msg.uri))
        });

        let text = worker
            .send_request::<to_host::Fetch>(WorkerFetchMessage {
                uri: "file:///a.malloy".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(text, "contents of file:///a.malloy");
    }

    #[tokio::test]
    async fn test_binary_fetch_result() {
        let (host, worker) = pair();
        let _handle = host.on_request::<to_host::FetchBinary, _, _>(
            |_msg: WorkerFetchBinaryMessage| async { Ok(Binary(vec![0, 159, 255])) },
        );

        let bytes = worker
            .send_request::<to_host::FetchBinary>(WorkerFetchBinaryMessage {
                uri: "file:///a.parquet".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(bytes.0, vec![0, 159, 255]);
    }

    #[tokio::test]
    async fn test_wrong_direction_has_no_handler() {
        // The host registered nothing for `malloy/queryPanel`.
        let (_host, worker) = pair();
        let err = worker
            .send_request::<to_host::QueryPanel>(WorkerQueryPanelMessage {
                panel_id: "p".to_string(),
                message: PanelMessage::status(&QueryStatus::Running),
            })
            .await
            .unwrap_err();
        assert!(err.is_no_handler());
    }

    #[tokio::test]
    async fn test_invalid_params_rejected() {
        let (host, worker) = LocalConnection::pair(None);
        let worker = WorkerMessageHandler::new(Arc::new(worker));
        let _handle =
            worker.on_request::<to_worker::Cancel, _, _>(|_| async { Ok(()) });

        let err = host
            .send_request("malloy/cancel", serde_json::json!({"wrong": 1}), None)
            .await
            .unwrap_err();
        match err {
            RpcError::Remote { code, .. } => assert_eq!(code, INVALID_PARAMS),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handler_failure_reaches_caller() {
        let (host, worker) = pair();
        let _handle = host.on_request::<to_host::Fetch, _, _>(|msg: WorkerFetchMessage| async move {
            anyhow::bail!("{} is outside the workspace", msg.uri)
        });

        let err = worker
            .send_request::<to_host::Fetch>(WorkerFetchMessage {
                uri: "file:///etc/passwd".to_string(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outside the workspace"));
    }

    #[tokio::test]
    async fn test_log_is_forwarded() {
        let (host, worker) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = host.on_request::<to_host::Log, _, _>(move |msg: WorkerLogMessage| {
            let _ = tx.send(msg.message);
            async { Ok(()) }
        });

        worker.log("compiling flights.malloy");
        let line = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, "compiling flights.malloy");
    }
}
