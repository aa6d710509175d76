//! trojan-go process supervision.
//!
//! Launches the proxy with `--config <path>`, forwards its output to the
//! `trojan` log target, waits until its API accepts connections and reports
//! how it exited.

use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use ssmgr_reconcile::{PollSchedule, ReconcileError};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Default proxy binary, relative to the working directory.
pub const DEFAULT_BINARY: &str = "bin/trojan-go";

/// Output marker used by [`Readiness::LogMarker`].
pub const INITIALIZING_MARKER: &str = "initializing";

/// Time allowed for a graceful stop before the child is killed.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Supervisor errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unsupported platform: {os}/{arch}")]
    UnsupportedPlatform { os: &'static str, arch: &'static str },

    #[error("failed to start {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("trojan-go API never became ready: {0}")]
    NotReady(#[from] ReconcileError),

    #[error("trojan-go exited before it was ready: {0}")]
    ExitedBeforeReady(ProxyExit),

    #[error("trojan-go process exited unexpectedly with {0}")]
    Exited(ProxyExit),

    #[error("failed to wait for trojan-go: {0}")]
    Wait(#[source] io::Error),
}

/// How readiness is detected.
#[derive(Debug, Clone)]
pub enum Readiness {
    /// Poll the API port until it accepts a connection.
    PortPoll(PollSchedule),

    /// Wait for a log line containing `marker`, then `delay`.
    LogMarker { marker: String, delay: Duration },
}

impl Default for Readiness {
    fn default() -> Self {
        Self::PortPoll(PollSchedule::default())
    }
}

/// Proxy launch settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub binary: PathBuf,
    pub config_path: PathBuf,
    /// `host:port` of the proxy API.
    pub api_addr: String,
    pub readiness: Readiness,
}

/// Exit status of the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ProxyExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ProxyExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "code null"),
        }
    }
}

/// Fail on targets the proxy is not shipped for.
pub fn check_platform() -> Result<(), SupervisorError> {
    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;
    let supported_os = matches!(os, "linux" | "macos");
    let supported_arch = matches!(arch, "x86_64" | "aarch64");
    if supported_os && supported_arch {
        Ok(())
    } else {
        Err(SupervisorError::UnsupportedPlatform { os, arch })
    }
}

/// A running proxy process.
pub struct ProxyProcess {
    child: Child,
    config: SupervisorConfig,
    marker_seen: Arc<Notify>,
}

impl ProxyProcess {
    /// Start the proxy and begin forwarding its output.
    pub fn spawn(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        check_platform()?;

        info!(
            binary = %config.binary.display(),
            config_path = %config.config_path.display(),
            "Starting trojan-go"
        );

        let mut child = Command::new(&config.binary)
            .arg("--config")
            .arg(&config.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                binary: config.binary.display().to_string(),
                source,
            })?;

        let marker = match &config.readiness {
            Readiness::LogMarker { marker, .. } => Some(marker.clone()),
            Readiness::PortPoll(_) => None,
        };
        let marker_seen = Arc::new(Notify::new());

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, marker.clone(), Arc::clone(&marker_seen)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, marker, Arc::clone(&marker_seen)));
        }

        debug!(pid = ?child.id(), "trojan-go started");
        Ok(Self {
            child,
            config,
            marker_seen,
        })
    }

    /// Wait until the proxy API is usable.
    ///
    /// Fails if the process exits first or the readiness check times out.
    pub async fn wait_ready(&mut self) -> Result<(), SupervisorError> {
        let readiness = self.config.readiness.clone();
        let api_addr = self.config.api_addr.clone();
        let marker_seen = Arc::clone(&self.marker_seen);

        let ready = async move {
            match readiness {
                Readiness::PortPoll(schedule) => poll_port(&api_addr, &schedule).await,
                Readiness::LogMarker { delay, .. } => {
                    marker_seen.notified().await;
                    tokio::time::sleep(delay).await;
                    Ok(())
                }
            }
        };

        tokio::select! {
            result = ready => {
                result?;
                info!("trojan-go API service is ready");
                Ok(())
            }
            status = self.child.wait() => {
                let exit = ProxyExit::from(status.map_err(SupervisorError::Wait)?);
                Err(SupervisorError::ExitedBeforeReady(exit))
            }
        }
    }

    /// Stop the proxy: SIGTERM first, then kill after a grace period.
    pub async fn shutdown(mut self) -> Result<ProxyExit, SupervisorError> {
        if let Some(pid) = self.child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM failed");
            }
        }

        match tokio::time::timeout(STOP_GRACE, self.child.wait()).await {
            Ok(status) => Ok(status.map_err(SupervisorError::Wait)?.into()),
            Err(_) => {
                warn!("trojan-go ignored SIGTERM, killing");
                self.child.kill().await.map_err(SupervisorError::Wait)?;
                let status = self.child.wait().await.map_err(SupervisorError::Wait)?;
                Ok(status.into())
            }
        }
    }

    /// Watch the process until `shutdown` flips to true, then stop it.
    ///
    /// Any exit that happens outside shutdown is an error, whatever its
    /// status.
    pub async fn supervise(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SupervisorError> {
        let exited = loop {
            tokio::select! {
                status = self.child.wait() => {
                    break Some(status.map_err(SupervisorError::Wait)?);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break None;
                    }
                }
            }
        };

        match exited {
            Some(status) if !*shutdown.borrow() => {
                let exit = ProxyExit::from(status);
                error!(target: "trojan", %exit, "trojan-go exited");
                Err(SupervisorError::Exited(exit))
            }
            Some(_) => Ok(()),
            None => {
                let exit = self.shutdown().await?;
                info!(%exit, "trojan-go stopped");
                Ok(())
            }
        }
    }
}

/// Try to connect to `addr` until it succeeds or the schedule runs out.
pub async fn poll_port(addr: &str, schedule: &PollSchedule) -> Result<(), ReconcileError> {
    let started = Instant::now();
    let mut delays = schedule.delays();

    loop {
        match TcpStream::connect(addr).await {
            Ok(_) => {
                debug!(addr, elapsed_ms = started.elapsed().as_millis() as u64, "Port is open");
                return Ok(());
            }
            Err(e) => debug!(addr, error = %e, "Port not open yet"),
        }

        match delays.next() {
            Some(delay) => tokio::time::sleep(delay).await,
            None => {
                return Err(ReconcileError::Timeout {
                    resource: addr.to_string(),
                    elapsed: started.elapsed(),
                })
            }
        }
    }
}

/// Severity carried by a proxy log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// Classify a proxy log line by its bracketed tag and strip the tag.
///
/// Returns `None` for blank lines.
pub fn classify_line(line: &str) -> Option<(LineLevel, String)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let classified = if line.contains("[FATAL]") || line.contains("[ERROR]") {
        (
            LineLevel::Error,
            line.replace("[FATAL]", "").replace("[ERROR]", ""),
        )
    } else if line.contains("[WARN]") {
        (LineLevel::Warn, line.replacen("[WARN]", "", 1))
    } else if line.contains("[INFO]") {
        (LineLevel::Info, line.replacen("[INFO]", "", 1))
    } else if line.contains("[DEBUG]") {
        (LineLevel::Debug, line.replacen("[DEBUG]", "", 1))
    } else {
        (LineLevel::Debug, line.to_string())
    };

    Some((classified.0, classified.1.trim().to_string()))
}

/// Forward proxy output line by line until EOF.
///
/// Lines are decoded lossily. The pipe must stay open until EOF or the
/// proxy gets SIGPIPE on its next write.
async fn forward_lines<R>(stream: R, marker: Option<String>, marker_seen: Arc<Notify>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Failed to read trojan-go output");
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        let Some((level, message)) = classify_line(&line) else {
            continue;
        };
        match level {
            LineLevel::Error => error!(target: "trojan", "{}", message),
            LineLevel::Warn => warn!(target: "trojan", "{}", message),
            LineLevel::Info => info!(target: "trojan", "{}", message),
            LineLevel::Debug => debug!(target: "trojan", "{}", message),
        }

        if marker.as_deref().is_some_and(|m| line.contains(m)) {
            marker_seen.notify_one();
        }
    }
}
