//! Account reconciliation primitives.
//!
//! The ledger is the source of truth for which accounts should exist; the
//! proxy's live table is the source of truth for which accounts are
//! registered right now and how much traffic they moved. A tick compares the
//! two and produces an [`AccountPlan`]:
//!
//! - **Flows**: traffic observed for ledger accounts, to be archived.
//! - **Additions**: ledger accounts the proxy has lost (e.g. after a restart).
//! - **Removals**: live entries with no ledger account behind them.
//! - **Clears**: every live entry seen this tick, so counters are not
//!   archived twice.
//!
//! Accounts are correlated by password hash. The account id is ledger-only
//! metadata the proxy never sees.
//!
//! # Invariants
//!
//! - Planning is deterministic given the same inputs
//! - A live entry is either accounted for by a ledger account or removed
//! - Applying a plan and re-planning with zeroed counters yields no flows

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Timeout waiting for convergence.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout {
        resource: String,
        elapsed: Duration,
    },
}

/// Convergence status after planning a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Ledger and live table already agree.
    Converged,

    /// Additions or removals are pending.
    Converging,
}

impl ConvergenceStatus {
    /// Returns true if nothing needs to be added or removed.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

/// An account as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredAccount {
    /// Ledger account id.
    pub id: i64,

    /// Credential hash presented to the proxy.
    pub password_hash: String,
}

/// An account as registered in the proxy's live table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedAccount {
    /// Credential hash.
    pub password_hash: String,

    /// Upload plus download bytes since the last clear.
    pub traffic_total: u64,
}

/// Traffic to archive for one ledger account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowDelta {
    pub account_id: i64,
    pub flow: u64,
}

/// Actions computed for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountPlan {
    /// Traffic to append to the ledger.
    pub flows: Vec<FlowDelta>,

    /// Ledger accounts to register with the proxy.
    pub to_add: Vec<DesiredAccount>,

    /// Hashes to unregister from the proxy.
    pub to_remove: Vec<String>,

    /// Hashes whose counters must be reset, taken from the pre-tick live set.
    pub to_clear: Vec<String>,
}

impl AccountPlan {
    /// Whether the tick leaves registrations unchanged.
    pub fn status(&self) -> ConvergenceStatus {
        if self.to_add.is_empty() && self.to_remove.is_empty() {
            ConvergenceStatus::Converged
        } else {
            ConvergenceStatus::Converging
        }
    }
}

/// Compare the ledger against the live table.
///
/// Every live entry matching a ledger account's hash is accounted for and
/// contributes a flow record when it carried traffic. Ledger accounts with no
/// live entry are queued for addition; unmatched live entries are queued for
/// removal. Counters are cleared for the whole pre-tick live set.
pub fn plan_accounts(ledger: &[DesiredAccount], live: &[ObservedAccount]) -> AccountPlan {
    let mut by_hash: HashMap<&str, Vec<&ObservedAccount>> = HashMap::new();
    for entry in live {
        by_hash
            .entry(entry.password_hash.as_str())
            .or_default()
            .push(entry);
    }

    let mut plan = AccountPlan::default();
    let mut accounted: HashSet<&str> = HashSet::new();

    for account in ledger {
        match by_hash.get(account.password_hash.as_str()) {
            Some(entries) => {
                accounted.insert(account.password_hash.as_str());
                plan.flows.extend(
                    entries
                        .iter()
                        .filter(|entry| entry.traffic_total > 0)
                        .map(|entry| FlowDelta {
                            account_id: account.id,
                            flow: entry.traffic_total,
                        }),
                );
            }
            None => plan.to_add.push(account.clone()),
        }
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for entry in live {
        let hash = entry.password_hash.as_str();
        if !seen.insert(hash) {
            continue;
        }
        plan.to_clear.push(hash.to_string());
        if !accounted.contains(hash) {
            plan.to_remove.push(hash.to_string());
        }
    }

    plan
}

/// Polling schedule for waiting on an external condition.
///
/// Delays grow by `factor` from `initial` up to `max_delay`; the whole wait is
/// bounded by `timeout`. A factor of 1 gives fixed-interval polling.
#[derive(Debug, Clone)]
pub struct PollSchedule {
    pub initial: Duration,
    pub max_delay: Duration,
    pub factor: u32,
    pub timeout: Duration,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
            factor: 1,
            timeout: Duration::from_secs(10),
        }
    }
}

impl PollSchedule {
    /// Delays to sleep between attempts, ending once `timeout` is spent.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let mut next = self.initial;
        let mut spent = Duration::ZERO;
        std::iter::from_fn(move || {
            if spent >= self.timeout {
                return None;
            }
            let delay = next.min(self.timeout - spent);
            spent += delay;
            next = (next * self.factor.max(1)).min(self.max_delay);
            Some(delay)
        })
    }
}

/// Default interval between reconciliation ticks.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

#[cfg(test)]
mod tests {
    use super::*;

    fn desired(id: i64, hash: &str) -> DesiredAccount {
        DesiredAccount {
            id,
            password_hash: hash.to_string(),
        }
    }

    fn observed(hash: &str, traffic: u64) -> ObservedAccount {
        ObservedAccount {
            password_hash: hash.to_string(),
            traffic_total: traffic,
        }
    }

    #[test]
    fn test_plan_converges_mismatched_sets() {
        let ledger = vec![desired(1, "a"), desired(2, "b")];
        let live = vec![observed("b", 300), observed("c", 50)];

        let plan = plan_accounts(&ledger, &live);

        assert_eq!(plan.to_add, vec![desired(1, "a")]);
        assert_eq!(plan.to_remove, vec!["c".to_string()]);
        assert_eq!(
            plan.flows,
            vec![FlowDelta {
                account_id: 2,
                flow: 300
            }]
        );
        assert_eq!(plan.to_clear, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(plan.status(), ConvergenceStatus::Converging);
    }

    #[test]
    fn test_plan_skips_idle_accounts() {
        let ledger = vec![desired(1, "a")];
        let live = vec![observed("a", 0)];

        let plan = plan_accounts(&ledger, &live);

        assert!(plan.flows.is_empty());
        assert!(plan.status().is_converged());
        assert_eq!(plan.to_clear, vec!["a".to_string()]);
    }

    #[test]
    fn test_plan_empty_inputs() {
        let plan = plan_accounts(&[], &[]);
        assert_eq!(plan, AccountPlan::default());
    }

    #[test]
    fn test_plan_duplicate_live_entries_are_all_accounted() {
        let ledger = vec![desired(7, "a")];
        let live = vec![observed("a", 10), observed("a", 5)];

        let plan = plan_accounts(&ledger, &live);

        assert!(plan.to_remove.is_empty());
        assert_eq!(plan.flows.len(), 2);
        assert_eq!(plan.to_clear, vec!["a".to_string()]);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let ledger = vec![desired(1, "a"), desired(2, "b"), desired(3, "c")];
        let live = vec![observed("d", 1), observed("b", 2), observed("e", 3)];

        assert_eq!(plan_accounts(&ledger, &live), plan_accounts(&ledger, &live));
    }

    #[test]
    fn test_fixed_poll_schedule() {
        let schedule = PollSchedule::default();
        let delays: Vec<_> = schedule.delays().collect();
        assert_eq!(delays.len(), 10);
        assert!(delays.iter().all(|d| *d == Duration::from_secs(1)));
    }

    #[test]
    fn test_exponential_poll_schedule_is_bounded() {
        let schedule = PollSchedule {
            initial: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
            factor: 2,
            timeout: Duration::from_secs(2),
        };
        let delays: Vec<_> = schedule.delays().collect();

        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[3], Duration::from_millis(800));
        assert_eq!(delays.iter().sum::<Duration>(), Duration::from_secs(2));
    }
}
