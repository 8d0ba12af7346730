// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket ingest: thread-per-connection handlers supervised by a server.

mod client;
mod ledger;
mod server;

pub use client::{ClientHandler, ClientId, ClientSettings, ClientStats, CloseReason, Closer};
pub use ledger::{read_spilled, ClosedClientSummary, ClosedLedger};
pub use server::{ServerSettings, ServerStats, SocketServer};
