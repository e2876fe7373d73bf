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

use super::protocol::{METHOD_NOT_FOUND, REQUEST_CANCELLED, ResponseError};

/// Transport-level failure of a request.
///
/// This is the "rejected future" channel. Payload-level failures such as a
/// fetch reply carrying `error` are reported separately by
/// [`crate::protocol::FetchError`].
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The peer has no handler registered for the method.
    #[error("no handler registered for '{method}'")]
    NoHandler {
        /// Method that was requested.
        method: String,
    },

    /// The remote handler failed.
    #[error("remote error {code}: {message}")]
    Remote {
        /// JSON-RPC error code.
        code: i64,
        /// Error text as marshaled by the peer.
        message: String,
    },

    /// The caller's cancellation token fired before the response arrived.
    #[error("request '{method}' was cancelled")]
    Cancelled {
        /// Method that was cancelled.
        method: String,
    },

    /// No response arrived in time.
    #[error("request '{method}' timed out after {after:?}")]
    Timeout {
        /// Method that timed out.
        method: String,
        /// Configured timeout.
        after: Duration,
    },

    /// The connection went away while the request was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// Params or result did not match the expected shape.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// Maps a response error object to the matching variant.
    pub(crate) fn from_response(method: &str, error: ResponseError) -> Self {
        match error.code {
            METHOD_NOT_FOUND => Self::NoHandler {
                method: method.to_string(),
            },
            REQUEST_CANCELLED => Self::Cancelled {
                method: method.to_string(),
            },
            code => Self::Remote {
                code,
                message: error.message,
            },
        }
    }

    /// True when the peer reported that nothing handles the method.
    pub const fn is_no_handler(&self) -> bool {
        matches!(self, Self::NoHandler { .. })
    }
}
