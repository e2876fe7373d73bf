// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

/// Fetch payload results and id correlation.
pub mod fetch;
/// Direction-enforcing typed handlers.
pub mod handler;
/// Payload structs.
pub mod messages;
/// Query specification.
pub mod query;
/// Per-direction message registries.
pub mod registry;
/// Supporting payload types.
pub mod types;

pub use fetch::{FetchError, FetchReply, FetchTicket, PendingFetches};
pub use handler::{ExtensionMessageHandler, WorkerMessageHandler};
pub use query::WorkerQuerySpec;
pub use registry::{MessageType, ToHost, ToWorker, to_host, to_worker};
pub use types::{
    AmountKeyword, Binary, CellData, DownloadAmount, DownloadFormat, PanelMessage, QueryDownloadOptions,
    QueryStatus, WorkerConfig,
};
