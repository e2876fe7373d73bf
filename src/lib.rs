// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Worker-link is the message protocol between an editor extension host and
//! the background worker that runs its queries.
//!
//! Messages travel as JSON-RPC 2.0 over any [`rpc::GenericConnection`]. The
//! [`protocol`] module closes the set of messages per direction so that the
//! worker can only handle what the host sends and vice versa, and [`worker`]
//! is a runnable worker built on top of it.

/// Configuration loading for the worker binary.
pub mod config;
/// Database connection entries and their labels.
pub mod connections;
/// Message registry, payloads and direction-checked handlers.
pub mod protocol;
/// JSON-RPC transport: framing, dispatch and connection types.
pub mod rpc;
/// Reference worker runtime.
pub mod worker;
