//! # herdstore
//!
//! Key-value backend adapter for HerdGuard.
//!
//! ## Architecture
//! - **Backend**: get/set/delete/persist/expire, set-if-absent and atomic
//!   scripts against a shared store
//! - **MemoryBackend**: in-process store, scripts run natively under one lock
//! - **RespBackend**: RESP2 client for Redis-compatible servers
//! - **Ledger**: all-or-nothing stock transfer scripts

#![warn(missing_docs)]

mod backend;
mod client;
mod error;
mod ledger;
mod memory;
pub mod resp;
pub mod script;

pub use backend::{Backend, Reply};
pub use client::{RespBackend, RespConfig};
pub use error::{Result, StoreError};
pub use ledger::{Ledger, LedgerOutcome, StockPair, UNLIMITED};
pub use memory::MemoryBackend;
pub use script::Script;
