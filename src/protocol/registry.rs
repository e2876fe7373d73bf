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

//! Closed, per-direction mapping from message name to payload shape.
//!
//! Each message is a zero-variant marker type implementing [`MessageType`]
//! plus exactly one of [`ToWorker`] or [`ToHost`]. Both sets are sealed, so
//! the registries cannot be extended outside this module.

use serde::Serialize;
use serde::de::DeserializeOwned;

mod sealed {
    pub trait Sealed {}
}

/// A named message with a fixed payload and result shape.
pub trait MessageType: sealed::Sealed + Send + Sync + 'static {
    /// Stable wire name.
    const METHOD: &'static str;
    /// Payload sent with the request.
    type Params: Serialize + DeserializeOwned + Send + 'static;
    /// Value the handler resolves the request with.
    type Result: Serialize + DeserializeOwned + Send + 'static;
}

/// Messages the host sends and the worker handles.
pub trait ToWorker: MessageType {}

/// Messages the worker sends and the host handles.
pub trait ToHost: MessageType {}

macro_rules! messages {
    ($direction:ident { $( $(#[$doc:meta])* $name:ident = $method:literal, $params:ty => $result:ty; )* }) => {
        $(
            $(#[$doc])*
            #[derive(Debug, Clone, Copy)]
            pub enum $name {}

            impl super::sealed::Sealed for $name {}

            impl super::MessageType for $name {
                const METHOD: &'static str = $method;
                type Params = $params;
                type Result = $result;
            }

            impl super::$direction for $name {}
        )*

        /// Every method name of this direction.
        pub const METHODS: &[&str] = &[$($method),*];
    };
}

/// Host-originated messages.
pub mod to_worker {
    use crate::protocol::messages::{
        MessageCancel, MessageCancelMsql, MessageConfig, MessageDownload, MessageFetch,
        MessageFetchBinary, MessageFetchCellData, MessageRun, MessageRunMsql,
    };

    messages!(ToWorker {
        /// Cancel the query running in a panel.
        Cancel = "malloy/cancel", MessageCancel => ();
        /// Replace the worker's configuration.
        Config = "malloy/config", MessageConfig => ();
        /// Shut the worker down.
        Exit = "malloy/exit", () => ();
        /// Deliver text content requested earlier.
        Fetch = "malloy/fetch", MessageFetch => ();
        /// Deliver binary content requested earlier.
        FetchBinary = "malloy/fetchBinary", MessageFetchBinary => ();
        /// Deliver notebook cells requested earlier.
        FetchCellData = "malloy/fetchCellData", MessageFetchCellData => ();
        /// Cancel the SQL notebook statement running in a panel.
        CancelMsql = "malloy/cancelMSQL", MessageCancelMsql => ();
        /// Run a query.
        Run = "malloy/run", MessageRun => ();
        /// Run a query and write its results to a file.
        Download = "malloy/download", MessageDownload => ();
        /// Run a SQL notebook statement.
        RunMsql = "malloy/run-msql", MessageRunMsql => ();
    });
}

/// Worker-originated messages.
pub mod to_host {
    use crate::protocol::messages::{
        WorkerDownloadMessage, WorkerFetchBinaryMessage, WorkerFetchCellDataMessage,
        WorkerFetchMessage, WorkerLogMessage, WorkerQueryPanelMessage,
        WorkerSqlQueryPanelMessage,
    };
    use crate::protocol::types::{Binary, CellData};

    messages!(ToHost {
        /// A download finished.
        Download = "malloy/download", WorkerDownloadMessage => ();
        /// A log line for the host's output channel.
        Log = "malloy/log", WorkerLogMessage => ();
        /// Update for a query panel.
        QueryPanel = "malloy/queryPanel", WorkerQueryPanelMessage => ();
        /// Resolve a uri to bytes.
        FetchBinary = "malloy/fetchBinary", WorkerFetchBinaryMessage => Binary;
        /// Resolve a uri to text.
        Fetch = "malloy/fetch", WorkerFetchMessage => String;
        /// Resolve a notebook uri to its cells.
        FetchCellData = "malloy/fetchCellData", WorkerFetchCellDataMessage => Vec<CellData>;
        /// Update for a SQL notebook panel.
        MsqlQueryPanel = "malloy/MSQLQueryPanel", WorkerSqlQueryPanelMessage => ();
    });
}
