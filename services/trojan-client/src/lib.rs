//! ssmgr trojan-go client library
//!
//! Bridges a shadowsocks-manager to a trojan-go instance. The manager sends
//! signed commands over a TCP control socket; accounts are kept in a local
//! SQLite ledger and pushed to trojan-go's API by a periodic reconciliation
//! loop that also archives per-account traffic.
//!
//! ## Modules
//!
//! - `server`: Control socket, one framed request per connection
//! - `dispatch`: Routes commands to the ledger
//! - `ledger`: SQLite account and flow store
//! - `gateway`: trojan-go API adapter and an in-memory fake
//! - `sync`: Reconciliation loop
//! - `supervisor`: trojan-go process launch and readiness

pub mod command;
pub mod config;
pub mod dispatch;
pub mod gateway;
pub mod ledger;
pub mod report;
pub mod server;
pub mod supervisor;
pub mod sync;

pub use command::{Command, CommandResult, Response, StatusCode};
pub use dispatch::{DispatchError, Dispatcher};
pub use gateway::{AccountGateway, GatewayError, GrpcGateway, MemoryGateway};
pub use ledger::{Ledger, LedgerError};
pub use server::ControlServer;
pub use supervisor::{ProxyProcess, SupervisorError};
pub use sync::{SyncEngine, SyncError, TickStats};
