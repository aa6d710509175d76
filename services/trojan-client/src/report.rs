//! Crash reporting side channel.
//!
//! Unexpected errors are emitted as error events on the `crash_report`
//! target, tagged with the phase that raised them, so a log shipper can
//! route them to an external collector. Reporting never changes control flow.

use std::error::Error;
use std::sync::OnceLock;

use tracing::error;

/// Component phase that raised an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ReceiveCommand,
    CheckData,
    SocketError,
    ServerError,
    TrojanError,
    OnTickError,
    ClientInit,
    StartServer,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReceiveCommand => "receiveCommand",
            Self::CheckData => "checkData",
            Self::SocketError => "socket:error",
            Self::ServerError => "server:error",
            Self::TrojanError => "trojan:error",
            Self::OnTickError => "trojanClient:onTickError",
            Self::ClientInit => "trojanClient:init",
            Self::StartServer => "startServer",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Report an error under a phase tag.
pub fn capture(phase: Phase, err: &(dyn Error + 'static)) {
    error!(
        target: "crash_report",
        phase = %phase,
        hostname = hostname(),
        error = %err,
        cause = ?source_chain(err),
        "Captured error"
    );
}

fn source_chain(err: &(dyn Error + 'static)) -> Vec<String> {
    std::iter::successors(err.source(), |e| (*e).source())
        .map(|e| e.to_string())
        .collect()
}

fn hostname() -> &'static str {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME.get_or_init(|| {
        nix::unistd::gethostname()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string())
    })
}
