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

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bytes::BytesMut;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::connection::{GenericConnection, RequestHandler};
use super::dispatch::{Disposable, Endpoint, Outbound};
use super::error::RpcError;
use super::protocol::{self, INVALID_REQUEST, Message, PARSE_ERROR, ResponseMessage};

/// JSON-RPC connection over a byte stream with `Content-Length` framing.
///
/// Used by the worker on its own stdin/stdout and by the host on a spawned
/// worker's pipes.
pub struct StreamConnection {
    endpoint: Endpoint,
    child: Option<Mutex<Child>>,
    _reader_handle: JoinHandle<()>,
    _writer_handle: JoinHandle<()>,
}

impl StreamConnection {
    /// Starts reader and writer tasks over the given halves.
    pub fn new<R, W>(reader: R, writer: W, timeout: Option<Duration>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        let reader_handle = tokio::spawn(Self::reader_task(reader, incoming_tx, outgoing_tx.clone()));
        let writer_handle = tokio::spawn(Self::writer_task(writer, outgoing_rx));
        let endpoint = Endpoint::start(incoming_rx, outgoing_tx, timeout);

        Self {
            endpoint,
            child: None,
            _reader_handle: reader_handle,
            _writer_handle: writer_handle,
        }
    }

    /// Connection over this process's stdin/stdout.
    pub fn stdio(timeout: Option<Duration>) -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), timeout)
    }

    /// Spawns a worker process and connects to its stdin/stdout.
    ///
    /// # Errors
    ///
    /// Fails if the process cannot be started.
    pub fn spawn(program: &str, args: &[&str], timeout: Option<Duration>) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn worker: {program}"))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Worker stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Worker stdout not captured"))?;

        let mut connection = Self::new(stdout, stdin, timeout);
        connection.child = Some(Mutex::new(child));
        Ok(connection)
    }

    /// Background task that parses frames and hands messages to the dispatcher.
    async fn reader_task<R>(
        reader: R,
        incoming: mpsc::UnboundedSender<Message>,
        outgoing: mpsc::UnboundedSender<Outbound>,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buffer = BytesMut::with_capacity(8192);

        loop {
            let mut temp = [0u8; 4096];
            match reader.read(&mut temp).await {
                Ok(0) => {
                    debug!("Peer closed the stream");
                    break;
                }
                Ok(n) => {
                    buffer.extend_from_slice(&temp[..n]);
                }
                Err(e) => {
                    error!("Error reading from stream: {}", e);
                    break;
                }
            }

            loop {
                let message_str = match protocol::try_parse_message(&mut buffer) {
                    Ok(Some(message_str)) => message_str,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Discarding malformed frame: {:#}", e);
                        let reply = ResponseMessage::failure(None, PARSE_ERROR, format!("{e:#}"));
                        let _ = outgoing.send(Outbound::Message(Message::Response(reply)));
                        continue;
                    }
                };
                trace!("Received message: {}", message_str);

                let value: Value = match serde_json::from_str(&message_str) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("Failed to parse JSON: {}", e);
                        let reply = ResponseMessage::failure(None, PARSE_ERROR, e.to_string());
                        let _ = outgoing.send(Outbound::Message(Message::Response(reply)));
                        continue;
                    }
                };

                let message = match Message::from_value(value) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("{:#}", e);
                        let reply = ResponseMessage::failure(None, INVALID_REQUEST, e.to_string());
                        let _ = outgoing.send(Outbound::Message(Message::Response(reply)));
                        continue;
                    }
                };

                if incoming.send(message).is_err() {
                    debug!("Dispatcher gone, stopping reader");
                    return;
                }
            }
        }
    }

    /// Background task that writes queued messages in order.
    async fn writer_task<W>(mut writer: W, mut outgoing: mpsc::UnboundedReceiver<Outbound>)
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(item) = outgoing.recv().await {
            let message = match item {
                Outbound::Message(message) => message,
                Outbound::Flush(ack) => {
                    let _ = ack.send(());
                    continue;
                }
            };

            let body = match message.to_json() {
                Ok(body) => body,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            trace!("Sending message: {}", body);

            let frame = protocol::encode_frame(&body);
            if let Err(e) = write_frame(&mut writer, frame.as_bytes()).await {
                warn!("Failed to write message: {}", e);
                break;
            }
        }
    }

    /// Lets in-flight handlers answer and flushes queued output.
    pub async fn shutdown(&self, grace: Duration) {
        self.endpoint.drain(grace).await;
    }

    /// Waits for a spawned worker to exit. Returns `None` for connections
    /// that do not own a process, or if the process outlives `timeout`.
    ///
    /// # Errors
    ///
    /// Fails if the exit status cannot be collected.
    pub async fn wait_for_exit(&self, timeout: Duration) -> Result<Option<ExitStatus>> {
        let Some(child) = &self.child else {
            return Ok(None);
        };
        let mut child = child.lock().await;
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => Ok(Some(status.context("Failed to wait for worker")?)),
            Err(_) => Ok(None),
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

#[async_trait]
impl GenericConnection for StreamConnection {
    fn on_request(&self, method: &str, handler: RequestHandler) -> Disposable {
        self.endpoint.on_request(method, handler)
    }

    async fn send_request(
        &self,
        method: &str,
        params: Value,
        token: Option<CancellationToken>,
    ) -> Result<Value, RpcError> {
        self.endpoint.send_request(method, params, token).await
    }

    fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        self.endpoint.notify(method, params)
    }

    fn is_alive(&self) -> bool {
        self.endpoint.is_alive()
    }

    async fn closed(&self) {
        self.endpoint.closed().await;
    }
}
