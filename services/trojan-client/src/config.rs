//! Command-line and environment configuration.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::supervisor::{Readiness, SupervisorConfig, DEFAULT_BINARY, INITIALIZING_MARKER};

/// Bridge between a shadowsocks-manager and a trojan-go instance.
#[derive(Debug, Clone, Parser)]
#[command(name = "ssmgr-trojan-client")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Address the control socket binds to.
    #[arg(long, env = "SSMGR_ADDR", default_value = "0.0.0.0")]
    pub addr: IpAddr,

    /// Port the control socket binds to.
    #[arg(long, env = "SSMGR_PORT", default_value_t = 4001)]
    pub port: u16,

    /// Shared key used to verify manager requests.
    #[arg(long, env = "SSMGR_KEY", hide_env_values = true)]
    pub key: String,

    /// Host of the trojan-go API service.
    #[arg(long, env = "SSMGR_API_HOST", default_value = "127.0.0.1")]
    pub api_host: String,

    /// Port of the trojan-go API service.
    #[arg(long, env = "SSMGR_API_PORT", default_value_t = 10000)]
    pub api_port: u16,

    /// trojan-go config file. When set, trojan-go is launched and supervised.
    #[arg(long, env = "SSMGR_TROJAN_CONFIG")]
    pub trojan_config: Option<PathBuf>,

    /// trojan-go binary.
    #[arg(long, env = "SSMGR_TROJAN_BIN", default_value = DEFAULT_BINARY)]
    pub trojan_bin: PathBuf,

    /// Detect readiness from trojan-go's log output instead of polling the API port.
    #[arg(long, env = "SSMGR_LOG_READINESS")]
    pub log_readiness: bool,

    /// Ledger database file.
    #[arg(long, env = "SSMGR_DB_PATH", default_value = "data/ssmgr.sqlite")]
    pub db_path: PathBuf,

    /// Seconds between reconciliation ticks.
    #[arg(long, env = "SSMGR_SYNC_INTERVAL", default_value_t = 60)]
    pub sync_interval_secs: u64,

    /// Enable debug logging.
    #[arg(long, env = "SSMGR_DEBUG")]
    pub debug: bool,

    /// Emit logs as JSON.
    #[arg(long, env = "SSMGR_LOG_JSON")]
    pub log_json: bool,
}

impl Config {
    /// Control socket address.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// `host:port` of the trojan-go API.
    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    /// Default log filter when `RUST_LOG` is unset.
    pub fn log_level(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }

    /// Supervisor settings, if trojan-go should be launched.
    pub fn supervisor(&self) -> Option<SupervisorConfig> {
        let config_path = self.trojan_config.clone()?;
        let readiness = if self.log_readiness {
            Readiness::LogMarker {
                marker: INITIALIZING_MARKER.to_string(),
                delay: Duration::from_millis(500),
            }
        } else {
            Readiness::default()
        };

        Some(SupervisorConfig {
            binary: self.trojan_bin.clone(),
            config_path,
            api_addr: self.api_addr(),
            readiness,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["ssmgr-trojan-client", "--key", "secret"]).unwrap();

        assert_eq!(config.listen_addr(), "0.0.0.0:4001".parse().unwrap());
        assert_eq!(config.api_addr(), "127.0.0.1:10000");
        assert_eq!(config.db_path, PathBuf::from("data/ssmgr.sqlite"));
        assert_eq!(config.sync_interval(), Duration::from_secs(60));
        assert_eq!(config.log_level(), "info");
        assert!(config.supervisor().is_none());
    }

    #[test]
    fn test_key_is_required() {
        assert!(Config::try_parse_from(["ssmgr-trojan-client"]).is_err());
    }

    #[test]
    fn test_supervisor_settings() {
        let config = Config::try_parse_from([
            "ssmgr-trojan-client",
            "--key",
            "k",
            "--trojan-config",
            "/etc/trojan/config.json",
            "--api-port",
            "10001",
            "--log-readiness",
            "--debug",
        ])
        .unwrap();

        let supervisor = config.supervisor().unwrap();
        assert_eq!(supervisor.binary, PathBuf::from(DEFAULT_BINARY));
        assert_eq!(supervisor.api_addr, "127.0.0.1:10001");
        assert!(matches!(supervisor.readiness, Readiness::LogMarker { .. }));
        assert_eq!(config.log_level(), "debug");
    }
}
