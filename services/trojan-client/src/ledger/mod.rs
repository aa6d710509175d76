//! Durable account ledger.
//!
//! This module provides SQLite-based storage for:
//! - Accounts (id, password hash)
//! - Flow records (per-tick traffic observations)
//!
//! The ledger is the source of truth for which accounts should exist.

mod store;

pub use store::{Account, AccountFlow, FlowRange, FlowRecord, Ledger, LedgerError};
