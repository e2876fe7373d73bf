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

//! Result-shaped fetch payloads and their correlation by id.
//!
//! A fetch reply can fail in two independent ways: the request itself can be
//! rejected by the transport, or it can resolve with a payload whose `error`
//! field is set. [`FetchReply::into_result`] folds the payload case into a
//! `Result` so callers cannot read `data` without checking `error` first.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use super::messages::{MessageFetch, MessageFetchBinary, MessageFetchCellData};
use super::types::CellData;
use crate::rpc::RpcError;

/// Why a fetch produced no usable data.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The resolving side reported an error in the payload.
    #[error("fetch of {uri} failed: {message}")]
    Remote {
        /// Requested uri.
        uri: String,
        /// Reported error.
        message: String,
    },

    /// The reply carried neither data nor an error.
    #[error("fetch of {uri} returned no data")]
    Missing {
        /// Requested uri.
        uri: String,
    },

    /// The reply was delivered for a different uri than requested.
    #[error("fetch reply for {got} does not match request for {expected}")]
    UriMismatch {
        /// Uri of the outstanding request.
        expected: String,
        /// Uri in the reply.
        got: String,
    },

    /// The waiting request was dropped before a reply arrived.
    #[error("fetch of {uri} was abandoned")]
    Abandoned {
        /// Requested uri.
        uri: String,
    },

    /// The transport rejected the request.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// A fetch payload carrying either `data` or `error`.
pub trait FetchReply {
    /// Content type on success.
    type Data: Send + 'static;

    /// Correlation id chosen by the requester.
    fn id(&self) -> &str;

    /// Resource the reply is for.
    fn uri(&self) -> &str;

    /// Converts the payload to a `Result`.
    ///
    /// # Errors
    ///
    /// [`FetchError::Remote`] whenever `error` is set, whether or not `data`
    /// is also present; [`FetchError::Missing`] when neither is.
    fn into_result(self) -> Result<Self::Data, FetchError>;
}

fn resolve<T>(uri: String, data: Option<T>, error: Option<String>) -> Result<T, FetchError> {
    match (data, error) {
        (_, Some(message)) => Err(FetchError::Remote { uri, message }),
        (Some(data), None) => Ok(data),
        (None, None) => Err(FetchError::Missing { uri }),
    }
}

macro_rules! fetch_reply {
    ($($ty:ty => $data:ty),* $(,)?) => {
        $(
            impl FetchReply for $ty {
                type Data = $data;

                fn id(&self) -> &str {
                    &self.id
                }

                fn uri(&self) -> &str {
                    &self.uri
                }

                fn into_result(self) -> Result<Self::Data, FetchError> {
                    resolve(self.uri, self.data.map(Into::into), self.error)
                }
            }
        )*
    };
}

fetch_reply! {
    MessageFetch => String,
    MessageFetchBinary => Vec<u8>,
    MessageFetchCellData => Vec<CellData>,
}

type Waiter<T> = (String, oneshot::Sender<Result<T, FetchError>>);

/// Outstanding fetches of one kind, keyed by id.
pub struct PendingFetches<R: FetchReply> {
    waiters: Mutex<HashMap<String, Waiter<R::Data>>>,
    _reply: PhantomData<fn(R)>,
}

/// Receiving half of one outstanding fetch.
#[derive(Debug)]
pub struct FetchTicket<T> {
    /// Id the reply must carry.
    pub id: String,
    uri: String,
    rx: oneshot::Receiver<Result<T, FetchError>>,
}

impl<T> FetchTicket<T> {
    /// Waits for the matching reply.
    ///
    /// # Errors
    ///
    /// Returns the reply's error, or [`FetchError::Abandoned`] if the
    /// pending entry was dropped.
    pub async fn wait(self) -> Result<T, FetchError> {
        self.rx
            .await
            .unwrap_or(Err(FetchError::Abandoned { uri: self.uri }))
    }
}

impl<R: FetchReply> Default for PendingFetches<R> {
    fn default() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            _reply: PhantomData,
        }
    }
}

impl<R: FetchReply> PendingFetches<R> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<String, Waiter<R::Data>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a fetch of `uri` under a fresh id.
    pub fn expect(&self, uri: &str) -> FetchTicket<R::Data> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.waiters().insert(id.clone(), (uri.to_string(), tx));
        FetchTicket {
            id,
            uri: uri.to_string(),
            rx,
        }
    }

    /// Routes a reply to its waiter. Returns `false` when no fetch with the
    /// reply's id is outstanding.
    pub fn deliver(&self, reply: R) -> bool {
        let Some((expected, tx)) = self.waiters().remove(reply.id()) else {
            warn!("Fetch reply for unknown id {}", reply.id());
            return false;
        };

        let outcome = if reply.uri() == expected {
            reply.into_result()
        } else {
            Err(FetchError::UriMismatch {
                expected,
                got: reply.uri().to_string(),
            })
        };

        if tx.send(outcome).is_err() {
            debug!("Fetch waiter went away before its reply");
        }
        true
    }

    /// Routes a host-pushed reply, failing when nothing waits for its id.
    ///
    /// # Errors
    ///
    /// Returns an error naming the id when no fetch with it is outstanding.
    pub fn accept(&self, reply: R) -> anyhow::Result<()> {
        let id = reply.id().to_string();
        if self.deliver(reply) {
            Ok(())
        } else {
            anyhow::bail!("No fetch is waiting for id {id}")
        }
    }

    /// Abandons every outstanding fetch.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.waiters().drain().collect();
        for (_, (uri, tx)) in drained {
            let _ = tx.send(Err(FetchError::Abandoned { uri }));
        }
    }

    /// Number of outstanding fetches.
    pub fn len(&self) -> usize {
        self.waiters().len()
    }

    /// True when nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_reply(id: &str, uri: &str, data: Option<&str>, error: Option<&str>) -> MessageFetch {
        MessageFetch {
            id: id.to_string(),
            uri: uri.to_string(),
            data: data.map(str::to_string),
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn test_error_wins_over_data() {
        let reply = text_reply("1", "file:///a", Some("stale"), Some("permission denied"));
        let err = reply.into_result().unwrap_err();
        assert!(matches!(err, FetchError::Remote { ref message, .. } if message == "permission denied"));
    }

    #[test]
    fn test_error_without_data_fails() {
        let reply = MessageFetchBinary {
            id: "1".to_string(),
            uri: "file:///a.parquet".to_string(),
            data: None,
            error: Some("ENOENT".to_string()),
        };
        assert!(reply.into_result().is_err());
    }

    #[test]
    fn test_empty_reply_is_missing() {
        let reply = text_reply("1", "file:///a", None, None);
        assert!(matches!(reply.into_result(), Err(FetchError::Missing { .. })));
    }

    #[test]
    fn test_data_only_succeeds() {
        let reply = MessageFetchCellData {
            id: "1".to_string(),
            uri: "file:///nb".to_string(),
            data: Some(vec![CellData {
                uri: "file:///nb#cell1".to_string(),
                text: "source: a is duckdb.table('a.csv')".to_string(),
            }]),
            error: None,
        };
        assert_eq!(reply.into_result().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_delivery_by_id() {
        let pending = PendingFetches::<MessageFetch>::new();
        let first = pending.expect("file:///a");
        let second = pending.expect("file:///b");
        assert_ne!(first.id, second.id);
        assert_eq!(pending.len(), 2);

        assert!(pending.deliver(text_reply(&second.id, "file:///b", Some("B"), None)));
        assert!(pending.deliver(text_reply(&first.id, "file:///a", Some("A"), None)));
        assert!(pending.is_empty());

        assert_eq!(first.wait().await.unwrap(), "A");
        assert_eq!(second.wait().await.unwrap(), "B");
    }

    #[tokio::test]
    async fn test_unknown_id_and_mismatch() {
        let pending = PendingFetches::<MessageFetch>::new();
        assert!(!pending.deliver(text_reply("nope", "file:///a", Some("A"), None)));

        let ticket = pending.expect("file:///a");
        assert!(pending.deliver(text_reply(&ticket.id, "file:///other", Some("A"), None)));
        assert!(matches!(
            ticket.wait().await,
            Err(FetchError::UriMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_accept_rejects_unknown_id() {
        let pending = PendingFetches::<MessageFetch>::new();
        let err = pending
            .accept(text_reply("stray", "file:///a", Some("A"), None))
            .unwrap_err();
        assert!(err.to_string().contains("stray"));

        let ticket = pending.expect("file:///a");
        pending
            .accept(text_reply(&ticket.id, "file:///a", Some("A"), None))
            .unwrap();
        assert_eq!(ticket.wait().await.unwrap(), "A");
    }

    #[tokio::test]
    async fn test_cancel_all_abandons() {
        let pending = PendingFetches::<MessageFetchBinary>::new();
        let ticket = pending.expect("file:///blob");
        pending.cancel_all();
        assert!(matches!(
            ticket.wait().await,
            Err(FetchError::Abandoned { .. })
        ));
    }
}
