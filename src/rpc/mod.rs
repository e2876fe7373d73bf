// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

/// Transport-agnostic connection trait and handler type.
pub mod connection;
/// Handler table, pending requests and inbound dispatch.
pub mod dispatch;
/// Transport error type.
pub mod error;
/// In-process connection pair.
pub mod local;
/// JSON-RPC envelopes and framing.
pub mod protocol;
/// Byte-stream connection (stdio, child pipes).
pub mod stream;

pub use connection::{GenericConnection, RequestHandler, handler_fn};
pub use dispatch::{DEFAULT_REQUEST_TIMEOUT, Disposable};
pub use error::RpcError;
pub use local::LocalConnection;
pub use stream::StreamConnection;
pub use tokio_util::sync::CancellationToken;
