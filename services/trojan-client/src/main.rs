//! ssmgr-trojan-client
//!
//! Runs on a proxy host next to trojan-go and answers a shadowsocks-manager.
//!
//! ## Architecture
//!
//! - **Supervisor**: Launches trojan-go and waits for its API (optional)
//! - **Sync Engine**: Reconciles the ledger with trojan-go every tick
//! - **Control Server**: Accepts signed manager commands

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ssmgr_frame::FrameCodec;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ssmgr_trojan_client::config::Config;
use ssmgr_trojan_client::dispatch::VERSION;
use ssmgr_trojan_client::report::{self, Phase};
use ssmgr_trojan_client::supervisor::SupervisorError;
use ssmgr_trojan_client::{
    ControlServer, Dispatcher, GrpcGateway, Ledger, ProxyProcess, SyncEngine,
};

#[tokio::main]
async fn main() {
    let config = Config::parse();
    init_tracing(&config);

    info!(version = VERSION, "Running ssmgr-trojan-client");

    if let Err(e) = run(config).await {
        error!("[startServer] {:#}", e);
        report::capture(Phase::StartServer, &*e);
        error!("FATAL ERROR. TERMINATED.");
        std::process::exit(1);
    }

    info!("ssmgr-trojan-client shutdown complete");
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level().into());
    let registry = tracing_subscriber::registry().with(filter);

    if config.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().compact())
            .init();
    }
}

async fn run(config: Config) -> Result<()> {
    info!(
        listen_addr = %config.listen_addr(),
        api_addr = %config.api_addr(),
        db_path = %config.db_path.display(),
        trojan_config = ?config.trojan_config,
        "Configuration loaded"
    );

    if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let ledger = Ledger::open(&config.db_path).context("failed to open ledger")?;
    let gateway = Arc::new(GrpcGateway::new(&config.api_host, config.api_port)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigterm = signal(SignalKind::terminate())?;

    // Launch trojan-go first; the engine needs its API.
    let mut proxy_handle = match config.supervisor() {
        Some(supervisor) => {
            let mut proxy = ProxyProcess::spawn(supervisor)?;
            if let Err(e) = proxy.wait_ready().await {
                report::capture(Phase::TrojanError, &e);
                return Err(e.into());
            }
            Some(tokio::spawn(proxy.supervise(shutdown_rx.clone())))
        }
        None => {
            info!("No trojan-go config given, using the running API service");
            None
        }
    };

    let engine = SyncEngine::new(ledger.clone(), gateway).with_interval(config.sync_interval());
    let sync_handle = match engine
        .init(shutdown_rx.clone(), |e| {
            error!(error = %e, "[trojanClient:onTickError] Reconciliation tick failed");
            report::capture(Phase::OnTickError, e);
        })
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "[trojanClient:init] Initial reconciliation failed");
            report::capture(Phase::ClientInit, &e);
            stop_proxy(&shutdown_tx, proxy_handle).await;
            return Err(e.into());
        }
    };

    let server = match ControlServer::bind(
        config.listen_addr(),
        FrameCodec::new(config.key.clone()),
        Dispatcher::new(ledger),
    )
    .await
    {
        Ok(server) => server,
        Err(e) => {
            stop_proxy(&shutdown_tx, proxy_handle).await;
            return Err(anyhow::Error::new(e)
                .context(format!("failed to bind {}", config.listen_addr())));
        }
    };
    let mut server_handle = tokio::spawn(server.run(shutdown_rx.clone()));

    let outcome: Result<()> = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT. Terminating the service...");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM. Terminating the service...");
            Ok(())
        }
        result = wait_proxy(&mut proxy_handle) => match result {
            Ok(()) => Ok(()),
            Err(e) => {
                report::capture(Phase::TrojanError, &e);
                Err(e.into())
            }
        },
        result = &mut server_handle => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                report::capture(Phase::ServerError, &e);
                Err(anyhow::Error::new(e).context("TCP server error"))
            }
            Err(e) => Err(anyhow::Error::new(e).context("control server task failed")),
        },
    };

    let _ = shutdown_tx.send(true);

    if let Err(e) = sync_handle.await {
        error!(error = %e, "Reconciliation task panicked");
    }
    stop_proxy(&shutdown_tx, proxy_handle).await;
    if !server_handle.is_finished() {
        let _ = server_handle.await;
    }

    outcome
}

/// Signal shutdown and wait for the supervisor to stop trojan-go.
async fn stop_proxy(
    shutdown_tx: &watch::Sender<bool>,
    handle: Option<JoinHandle<Result<(), SupervisorError>>>,
) {
    let _ = shutdown_tx.send(true);
    let Some(handle) = handle else {
        return;
    };
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Failed to stop trojan-go"),
        Err(e) => error!(error = %e, "Supervisor task panicked"),
    }
}

/// Resolve when the supervised proxy stops; never resolves without one.
async fn wait_proxy(
    handle: &mut Option<JoinHandle<Result<(), SupervisorError>>>,
) -> Result<(), SupervisorError> {
    let Some(join) = handle.as_mut() else {
        return std::future::pending().await;
    };

    let result = match join.await {
        Ok(result) => result,
        Err(e) => Err(SupervisorError::Wait(std::io::Error::other(e))),
    };
    *handle = None;
    result
}
