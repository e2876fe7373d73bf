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

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::connection::{GenericConnection, RequestHandler};
use super::dispatch::{Disposable, Endpoint, Outbound};
use super::error::RpcError;
use super::protocol::Message;

/// In-process connection that hands decoded messages straight to its peer.
///
/// Both ends run the same dispatch rules as [`super::StreamConnection`];
/// only the framing step is skipped. Dropping one end closes the other.
pub struct LocalConnection {
    endpoint: Endpoint,
}

impl LocalConnection {
    /// Creates two connected ends.
    pub fn pair(timeout: Option<Duration>) -> (Self, Self) {
        let (a_out_tx, a_out_rx) = mpsc::unbounded_channel();
        let (b_out_tx, b_out_rx) = mpsc::unbounded_channel();
        let (a_in_tx, a_in_rx) = mpsc::unbounded_channel();
        let (b_in_tx, b_in_rx) = mpsc::unbounded_channel();

        tokio::spawn(forward(a_out_rx, b_in_tx));
        tokio::spawn(forward(b_out_rx, a_in_tx));

        (
            Self {
                endpoint: Endpoint::start(a_in_rx, a_out_tx, timeout),
            },
            Self {
                endpoint: Endpoint::start(b_in_rx, b_out_tx, timeout),
            },
        )
    }

    /// Lets in-flight handlers answer before the connection is dropped.
    pub async fn shutdown(&self, grace: Duration) {
        self.endpoint.drain(grace).await;
    }
}

async fn forward(
    mut outgoing: mpsc::UnboundedReceiver<Outbound>,
    peer: mpsc::UnboundedSender<Message>,
) {
    while let Some(item) = outgoing.recv().await {
        match item {
            Outbound::Message(message) => {
                if peer.send(message).is_err() {
                    trace!("Local peer is gone");
                    break;
                }
            }
            Outbound::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

#[async_trait]
impl GenericConnection for LocalConnection {
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
