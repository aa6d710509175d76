//! In-process account gateway for tests.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{AccountChange, AccountGateway, AccountIndex, GatewayError, LiveAccount, SetOperation};

#[derive(Default)]
struct State {
    accounts: Vec<LiveAccount>,
    changes: Vec<AccountChange>,
    index: AccountIndex,
}

/// Fake proxy account table.
///
/// Adds of a known hash and removes of an unknown hash are accepted
/// silently, the way trojan-go treats them.
#[derive(Default)]
pub struct MemoryGateway {
    state: Mutex<State>,
    fail_list: AtomicBool,
    fail_set: AtomicBool,
}

impl MemoryGateway {
    /// Create an empty gateway.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a gateway that already holds the given live entries.
    pub fn with_accounts<I, S>(accounts: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        let state = State {
            accounts: accounts
                .into_iter()
                .map(|(hash, traffic_total)| LiveAccount {
                    password_hash: hash.into(),
                    traffic_total,
                })
                .collect(),
            ..State::default()
        };
        Self {
            state: Mutex::new(state),
            ..Self::default()
        }
    }

    /// Add traffic to every live entry carrying `password_hash`.
    pub async fn record_traffic(&self, password_hash: &str, bytes: u64) {
        let mut state = self.state.lock().await;
        for entry in state
            .accounts
            .iter_mut()
            .filter(|e| e.password_hash == password_hash)
        {
            entry.traffic_total = entry.traffic_total.saturating_add(bytes);
        }
    }

    /// Snapshot of the live table.
    pub async fn accounts(&self) -> Vec<LiveAccount> {
        self.state.lock().await.accounts.clone()
    }

    /// Every change accepted so far, in order.
    pub async fn changes(&self) -> Vec<AccountChange> {
        self.state.lock().await.changes.clone()
    }

    /// Ledger id bound to a hash by an earlier add.
    pub async fn account_id(&self, password_hash: &str) -> Option<i64> {
        self.state.lock().await.index.account_id(password_hash)
    }

    /// Make `list_accounts` fail until reset.
    pub fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    /// Make `set_accounts` fail until reset.
    pub fn fail_set(&self, fail: bool) {
        self.fail_set.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AccountGateway for MemoryGateway {
    async fn list_accounts(&self) -> Result<Vec<LiveAccount>, GatewayError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("list failure injected".to_string()));
        }
        Ok(self.accounts().await)
    }

    async fn set_accounts(&self, changes: Vec<AccountChange>) -> Result<(), GatewayError> {
        if self.fail_set.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("set failure injected".to_string()));
        }

        let mut state = self.state.lock().await;
        for change in changes {
            let hash = change.password_hash.as_str();
            match change.operation {
                SetOperation::Add => {
                    if !state.accounts.iter().any(|e| e.password_hash == hash) {
                        state.accounts.push(LiveAccount {
                            password_hash: hash.to_string(),
                            traffic_total: 0,
                        });
                    }
                }
                SetOperation::Remove => state.accounts.retain(|e| e.password_hash != hash),
                SetOperation::Modify => {
                    let total = change.traffic_total.unwrap_or(0);
                    for entry in state.accounts.iter_mut().filter(|e| e.password_hash == hash) {
                        entry.traffic_total = total;
                    }
                }
            }
            debug!(operation = %change.operation, password_hash = hash, "[MOCK] Applied change");
            state.index.apply(&change);
            state.changes.push(change);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::DesiredAccount;

    #[tokio::test]
    async fn test_add_then_remove() {
        let gateway = MemoryGateway::new();
        let account = DesiredAccount {
            id: 4,
            password_hash: "h4".to_string(),
        };

        gateway.add_accounts(&[account.clone()]).await.unwrap();
        gateway.add_accounts(&[account]).await.unwrap();
        assert_eq!(gateway.accounts().await.len(), 1);
        assert_eq!(gateway.account_id("h4").await, Some(4));

        gateway.remove_accounts(&["h4".to_string()]).await.unwrap();
        assert!(gateway.accounts().await.is_empty());
        assert_eq!(gateway.account_id("h4").await, None);
    }

    #[tokio::test]
    async fn test_clear_traffic_resets_counter() {
        let gateway = MemoryGateway::with_accounts([("h1", 0)]);
        gateway.record_traffic("h1", 512).await;
        assert_eq!(gateway.accounts().await[0].traffic_total, 512);

        gateway.clear_traffic("h1").await.unwrap();
        assert_eq!(gateway.accounts().await[0].traffic_total, 0);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let gateway = MemoryGateway::new();

        gateway.fail_list(true);
        assert!(gateway.list_accounts().await.is_err());
        gateway.fail_list(false);
        assert!(gateway.list_accounts().await.is_ok());

        gateway.fail_set(true);
        assert!(gateway.clear_traffic("x").await.is_err());
        assert!(gateway.changes().await.is_empty());
    }
}
