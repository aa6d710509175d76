//! Account gateway interface.
//!
//! The gateway abstracts the proxy's live account table:
//! - Listing registered accounts with their traffic counters
//! - Adding, removing and modifying accounts
//!
//! The reconciliation engine depends only on [`AccountGateway`]. The gRPC
//! adapter talks to a running trojan-go instance; the in-memory gateway is
//! used in tests and when no proxy is attached.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

mod grpc;
mod memory;

pub use grpc::GrpcGateway;
pub use memory::MemoryGateway;
pub use ssmgr_reconcile::{DesiredAccount, ObservedAccount as LiveAccount};

/// Errors from gateway calls.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid endpoint: {0}")]
    Endpoint(String),

    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("proxy rejected {operation} for {password_hash}: {info}")]
    Rejected {
        operation: SetOperation,
        password_hash: String,
        info: String,
    },

    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

/// Mutation applied to one live account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOperation {
    Add,
    Remove,
    Modify,
}

impl std::fmt::Display for SetOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Modify => "modify",
        };
        write!(f, "{}", s)
    }
}

/// A single change request sent to the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountChange {
    pub operation: SetOperation,
    pub password_hash: String,
    /// New traffic total, only meaningful for `Modify`.
    pub traffic_total: Option<u64>,
    /// Ledger id, recorded by the adapter when known.
    pub account_id: Option<i64>,
}

impl AccountChange {
    /// Register a ledger account.
    pub fn add(account: &DesiredAccount) -> Self {
        Self {
            operation: SetOperation::Add,
            password_hash: account.password_hash.clone(),
            traffic_total: None,
            account_id: Some(account.id),
        }
    }

    /// Unregister a hash.
    pub fn remove(password_hash: &str) -> Self {
        Self {
            operation: SetOperation::Remove,
            password_hash: password_hash.to_string(),
            traffic_total: None,
            account_id: None,
        }
    }

    /// Reset a hash's traffic counters to zero.
    pub fn clear_traffic(password_hash: &str) -> Self {
        Self {
            operation: SetOperation::Modify,
            password_hash: password_hash.to_string(),
            traffic_total: Some(0),
            account_id: None,
        }
    }
}

/// Capability set over the proxy's live account table.
#[async_trait]
pub trait AccountGateway: Send + Sync {
    /// List every registered account. Streaming responses are fully drained.
    async fn list_accounts(&self) -> Result<Vec<LiveAccount>, GatewayError>;

    /// Apply changes in order. Fails on the first rejected change.
    async fn set_accounts(&self, changes: Vec<AccountChange>) -> Result<(), GatewayError>;

    /// Register ledger accounts.
    async fn add_accounts(&self, accounts: &[DesiredAccount]) -> Result<(), GatewayError> {
        if accounts.is_empty() {
            return Ok(());
        }
        self.set_accounts(accounts.iter().map(AccountChange::add).collect())
            .await
    }

    /// Unregister hashes.
    async fn remove_accounts(&self, hashes: &[String]) -> Result<(), GatewayError> {
        if hashes.is_empty() {
            return Ok(());
        }
        self.set_accounts(hashes.iter().map(|h| AccountChange::remove(h)).collect())
            .await
    }

    /// Reset one hash's traffic counters.
    async fn clear_traffic(&self, password_hash: &str) -> Result<(), GatewayError> {
        self.set_accounts(vec![AccountChange::clear_traffic(password_hash)])
            .await
    }
}

/// Correlation between password hashes and ledger ids.
///
/// Owned by a gateway instance; the proxy itself only knows hashes.
#[derive(Debug, Default)]
pub struct AccountIndex {
    by_hash: HashMap<String, i64>,
    by_id: HashMap<i64, String>,
}

impl AccountIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `password_hash` belongs to `account_id`, replacing any
    /// earlier mapping of either side.
    pub fn bind(&mut self, account_id: i64, password_hash: &str) {
        if let Some(old_hash) = self.by_id.remove(&account_id) {
            self.by_hash.remove(&old_hash);
        }
        if let Some(old_id) = self.by_hash.remove(password_hash) {
            self.by_id.remove(&old_id);
        }
        self.by_hash.insert(password_hash.to_string(), account_id);
        self.by_id.insert(account_id, password_hash.to_string());
    }

    /// Forget a hash. Returns the id it was bound to.
    pub fn unbind_hash(&mut self, password_hash: &str) -> Option<i64> {
        let id = self.by_hash.remove(password_hash)?;
        self.by_id.remove(&id);
        Some(id)
    }

    /// Ledger id for a hash.
    pub fn account_id(&self, password_hash: &str) -> Option<i64> {
        self.by_hash.get(password_hash).copied()
    }

    /// Hash for a ledger id.
    pub fn password_hash(&self, account_id: i64) -> Option<&str> {
        self.by_id.get(&account_id).map(String::as_str)
    }

    /// Number of bound accounts.
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    /// True when nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// Update the index after a change was accepted by the proxy.
    pub fn apply(&mut self, change: &AccountChange) {
        match (change.operation, change.account_id) {
            (SetOperation::Add, Some(id)) => self.bind(id, &change.password_hash),
            (SetOperation::Remove, _) => {
                self.unbind_hash(&change.password_hash);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_bind_and_lookup() {
        let mut index = AccountIndex::new();
        index.bind(1, "h1");

        assert_eq!(index.account_id("h1"), Some(1));
        assert_eq!(index.password_hash(1), Some("h1"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_index_rebind_replaces_both_sides() {
        let mut index = AccountIndex::new();
        index.bind(1, "old");
        index.bind(1, "new");

        assert_eq!(index.account_id("old"), None);
        assert_eq!(index.password_hash(1), Some("new"));

        index.bind(2, "new");
        assert_eq!(index.password_hash(1), None);
        assert_eq!(index.account_id("new"), Some(2));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_index_apply_changes() {
        let mut index = AccountIndex::new();
        let account = DesiredAccount {
            id: 9,
            password_hash: "h9".to_string(),
        };

        index.apply(&AccountChange::add(&account));
        assert_eq!(index.account_id("h9"), Some(9));

        index.apply(&AccountChange::clear_traffic("h9"));
        assert_eq!(index.account_id("h9"), Some(9));

        index.apply(&AccountChange::remove("h9"));
        assert!(index.is_empty());
    }

    #[test]
    fn test_instances_do_not_share_state() {
        let mut a = AccountIndex::new();
        let b = AccountIndex::new();
        a.bind(1, "h1");
        assert!(b.is_empty());
    }
}
