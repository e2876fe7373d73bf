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

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::dispatch::Disposable;
use super::error::RpcError;
use super::protocol::ResponseError;

/// Untyped request handler: params in, result or error object out.
pub type RequestHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ResponseError>> + Send + Sync>;

/// Wraps an async closure as a [`RequestHandler`].
pub fn handler_fn<F, Fut>(f: F) -> RequestHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ResponseError>> + Send + 'static,
{
    Arc::new(move |params| f(params).boxed())
}

/// A bidirectional request/response channel, independent of how bytes move.
///
/// Implemented by [`super::StreamConnection`] and [`super::LocalConnection`].
/// The protocol layer only ever holds an `Arc<dyn GenericConnection>`.
#[async_trait]
pub trait GenericConnection: Send + Sync {
    /// Installs the single handler for `method`. A later registration for the
    /// same method replaces this one.
    fn on_request(&self, method: &str, handler: RequestHandler) -> Disposable;

    /// Sends a request and resolves with the remote handler's return value.
    ///
    /// # Errors
    ///
    /// Rejects when the peer has no handler, the handler fails, the
    /// connection drops, the request times out, or `token` is cancelled.
    async fn send_request(
        &self,
        method: &str,
        params: Value,
        token: Option<CancellationToken>,
    ) -> Result<Value, RpcError>;

    /// Sends a one-way notification.
    ///
    /// # Errors
    ///
    /// Fails only when the connection is already closed.
    fn notify(&self, method: &str, params: Value) -> Result<(), RpcError>;

    /// Returns true while the peer is reachable.
    fn is_alive(&self) -> bool;

    /// Resolves once the peer has gone away.
    async fn closed(&self);
}
