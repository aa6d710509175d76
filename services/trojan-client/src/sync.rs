//! Reconciliation engine.
//!
//! Keeps the proxy's live account table in line with the ledger and
//! archives the traffic the proxy has counted since the last tick.
//!
//! A tick:
//! 1. Fetches ledger accounts and live entries concurrently
//! 2. Plans flows, additions and removals (see [`ssmgr_reconcile::plan_accounts`])
//! 3. Appends flow records in one write
//! 4. Clears counters for every pre-tick live entry, one call per entry
//! 5. Adds missing accounts, then removes stale ones
//!
//! Ticks run back to back inside one task, so they never overlap. A failed
//! tick is reported and the next one starts from whatever state it left.

use std::sync::Arc;
use std::time::Duration;

use ssmgr_reconcile::{plan_accounts, DesiredAccount, DEFAULT_RECONCILE_INTERVAL};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::gateway::{AccountGateway, GatewayError};
use crate::ledger::{FlowRecord, Ledger, LedgerError};

/// Errors from a reconciliation tick.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

/// Summary of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub flows_recorded: usize,
    pub added: usize,
    pub removed: usize,
    pub cleared: usize,
}

/// Reconciles the ledger against an [`AccountGateway`].
pub struct SyncEngine<G> {
    ledger: Ledger,
    gateway: Arc<G>,
    interval: Duration,
}

impl<G: AccountGateway + 'static> SyncEngine<G> {
    /// Create an engine ticking at the default interval.
    pub fn new(ledger: Ledger, gateway: Arc<G>) -> Self {
        Self {
            ledger,
            gateway,
            interval: DEFAULT_RECONCILE_INTERVAL,
        }
    }

    /// Override the tick interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run one reconciliation pass.
    pub async fn tick(&self) -> Result<TickStats, SyncError> {
        let (accounts, live) = tokio::try_join!(
            async { self.ledger.list_accounts().await.map_err(SyncError::from) },
            async { self.gateway.list_accounts().await.map_err(SyncError::from) },
        )?;

        let desired: Vec<DesiredAccount> = accounts
            .into_iter()
            .map(|a| DesiredAccount {
                id: a.id,
                password_hash: a.password,
            })
            .collect();
        let plan = plan_accounts(&desired, &live);

        let now = chrono::Utc::now().timestamp_millis();
        let records: Vec<FlowRecord> = plan
            .flows
            .iter()
            .map(|delta| FlowRecord {
                account_id: delta.account_id,
                flow: i64::try_from(delta.flow).unwrap_or(i64::MAX),
                created_at: now,
            })
            .collect();
        let flows_recorded = self.ledger.insert_flows(records).await?;

        for hash in &plan.to_clear {
            self.gateway.clear_traffic(hash).await?;
        }

        self.gateway.add_accounts(&plan.to_add).await?;
        self.gateway.remove_accounts(&plan.to_remove).await?;

        let stats = TickStats {
            flows_recorded,
            added: plan.to_add.len(),
            removed: plan.to_remove.len(),
            cleared: plan.to_clear.len(),
        };
        info!(
            flows_recorded = stats.flows_recorded,
            added = stats.added,
            removed = stats.removed,
            cleared = stats.cleared,
            converged = plan.status().is_converged(),
            "Reconciliation tick complete"
        );
        Ok(stats)
    }

    /// Run the first tick, then keep ticking in the background.
    ///
    /// A failing first tick is returned to the caller. Later failures are
    /// passed to `on_tick_error` and the timer keeps running until
    /// `shutdown` flips to true.
    pub async fn init<F>(
        self,
        shutdown: watch::Receiver<bool>,
        on_tick_error: F,
    ) -> Result<JoinHandle<()>, SyncError>
    where
        F: Fn(&SyncError) + Send + Sync + 'static,
    {
        self.tick().await?;
        Ok(tokio::spawn(async move {
            self.run(shutdown, on_tick_error).await;
        }))
    }

    /// Tick on the configured interval until shutdown.
    pub async fn run<F>(&self, mut shutdown: watch::Receiver<bool>, on_tick_error: F)
    where
        F: Fn(&SyncError) + Send + Sync,
    {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting reconciliation loop"
        );

        let mut interval = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        on_tick_error(&e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Reconciliation loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::gateway::MemoryGateway;

    async fn setup(
        ledger_accounts: &[(i64, &str)],
        live: &[(&str, u64)],
    ) -> (SyncEngine<MemoryGateway>, Ledger, Arc<MemoryGateway>) {
        let ledger = Ledger::open_in_memory().unwrap();
        for (id, hash) in ledger_accounts {
            ledger.find_or_create(*id, hash).await.unwrap();
        }
        let gateway = Arc::new(MemoryGateway::with_accounts(live.iter().copied()));
        let engine = SyncEngine::new(ledger.clone(), Arc::clone(&gateway));
        (engine, ledger, gateway)
    }

    #[tokio::test]
    async fn test_tick_converges() {
        let (engine, ledger, gateway) = setup(&[(1, "a"), (2, "b")], &[("b", 300), ("c", 7)]).await;

        let stats = engine.tick().await.unwrap();
        assert_eq!(
            stats,
            TickStats {
                flows_recorded: 1,
                added: 1,
                removed: 1,
                cleared: 2,
            }
        );

        let flows = ledger.list_flows().await.unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!((flows[0].account_id, flows[0].flow), (2, 300));

        let mut hashes: Vec<_> = gateway
            .accounts()
            .await
            .into_iter()
            .map(|a| a.password_hash)
            .collect();
        hashes.sort();
        assert_eq!(hashes, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(gateway.account_id("a").await, Some(1));
    }

    #[tokio::test]
    async fn test_second_tick_records_nothing() {
        let (engine, ledger, _) = setup(&[(1, "a")], &[("a", 10)]).await;

        engine.tick().await.unwrap();
        let stats = engine.tick().await.unwrap();

        assert_eq!(stats.flows_recorded, 0);
        assert_eq!(ledger.list_flows().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_traffic_between_ticks_is_archived() {
        let (engine, ledger, gateway) = setup(&[(1, "a")], &[]).await;

        engine.tick().await.unwrap();
        gateway.record_traffic("a", 64).await;
        engine.tick().await.unwrap();

        let flows = ledger.list_flows().await.unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].flow, 64);
    }

    #[tokio::test]
    async fn test_gateway_failure_fails_tick() {
        let (engine, ledger, gateway) = setup(&[(1, "a")], &[("a", 5)]).await;
        gateway.fail_list(true);

        assert!(matches!(engine.tick().await, Err(SyncError::Gateway(_))));
        assert!(ledger.list_flows().await.unwrap().is_empty());

        gateway.fail_list(false);
        assert_eq!(engine.tick().await.unwrap().flows_recorded, 1);
    }

    #[tokio::test]
    async fn test_init_propagates_first_failure() {
        let (engine, _, gateway) = setup(&[], &[]).await;
        gateway.fail_list(true);
        let (_tx, rx) = watch::channel(false);

        let result = engine.init(rx, |_| {}).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_reports_errors_and_stops() {
        let (engine, _, gateway) = setup(&[], &[]).await;
        let engine = engine.with_interval(Duration::from_secs(60));
        let (tx, rx) = watch::channel(false);

        let errors = Arc::new(AtomicUsize::new(0));
        let handle = engine
            .init(rx, {
                let errors = Arc::clone(&errors);
                move |_| {
                    errors.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();

        gateway.fail_list(true);
        tokio::time::sleep(Duration::from_secs(121)).await;
        assert_eq!(errors.load(Ordering::SeqCst), 2);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
