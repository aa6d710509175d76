//! Control socket server.
//!
//! One request per connection: the server buffers reads until a complete
//! frame is present, answers it with a single response frame and closes
//! its write half.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ssmgr_frame::{encode_response, FrameBuffer, FrameCodec, FrameError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

use crate::command::{Response, StatusCode};
use crate::dispatch::Dispatcher;
use crate::report::{self, Phase};

/// Default time a connection may stay idle before it is dropped.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

const READ_CHUNK: usize = 4096;

/// TCP server for manager commands.
pub struct ControlServer {
    listener: TcpListener,
    codec: FrameCodec,
    dispatcher: Dispatcher,
    read_timeout: Option<Duration>,
}

impl ControlServer {
    /// Bind the control socket.
    pub async fn bind(
        addr: SocketAddr,
        codec: FrameCodec,
        dispatcher: Dispatcher,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(bind_addr = %listener.local_addr()?, "Control server bound");

        Ok(Self {
            listener,
            codec,
            dispatcher,
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
        })
    }

    /// Override the idle read timeout. `None` waits forever.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Client is listening");

        let server = Arc::new(self);
        loop {
            tokio::select! {
                accepted = server.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let server = Arc::clone(&server);
                        tokio::spawn(
                            async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    log_socket_error(&e);
                                }
                            }
                            .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        report::capture(Phase::ServerError, &e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Control server shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> io::Result<()> {
        let Some(body) = self.read_frame(&mut stream).await? else {
            return Ok(());
        };

        let response = match body {
            Ok(body) => {
                let now = chrono::Utc::now().timestamp_millis();
                match self.codec.open(&body, now) {
                    Ok(payload) => self.dispatcher.respond(payload).await,
                    Err(e) => reject(&e),
                }
            }
            Err(e) => reject(&e),
        };

        let frame = match encode_response(&response) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "Failed to encode response");
                report::capture(Phase::CheckData, &e);
                encode_response(&Response::failure(StatusCode::Error, Some(e.to_string())))
                    .map_err(io::Error::other)?
            }
        };

        stream.write_all(&frame).await?;
        stream.shutdown().await
    }

    /// Read until one frame is buffered.
    ///
    /// Returns `None` if the peer goes away or stays idle first.
    async fn read_frame(
        &self,
        stream: &mut TcpStream,
    ) -> io::Result<Option<Result<Bytes, FrameError>>> {
        let mut buffer = FrameBuffer::new();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let read = stream.read(&mut chunk);
            let n = match self.read_timeout {
                Some(limit) => match tokio::time::timeout(limit, read).await {
                    Ok(n) => n?,
                    Err(_) => {
                        debug!(buffered = buffer.len(), "Connection idle, dropping");
                        return Ok(None);
                    }
                },
                None => read.await?,
            };

            if n == 0 {
                debug!(buffered = buffer.len(), "Connection closed before a full frame");
                return Ok(None);
            }

            buffer.extend(&chunk[..n]);
            match buffer.next_frame() {
                Ok(Some(body)) => return Ok(Some(Ok(body))),
                Ok(None) => continue,
                Err(e) => return Ok(Some(Err(e))),
            }
        }
    }
}

fn reject(err: &FrameError) -> Response {
    if err.is_auth_failure() {
        warn!(error = %err, "Rejected unauthenticated frame");
        Response::failure(StatusCode::AuthFailure, None)
    } else {
        warn!(error = %err, "Malformed frame");
        Response::failure(StatusCode::Error, Some(err.to_string()))
    }
}

fn log_socket_error(err: &io::Error) {
    match err.kind() {
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
            debug!(error = %err, "Socket error");
        }
        _ => {
            error!(error = %err, "Socket error");
            report::capture(Phase::SocketError, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;

    async fn start(key: &str) -> (SocketAddr, watch::Sender<bool>) {
        let dispatcher = Dispatcher::new(Ledger::open_in_memory().unwrap());
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = ControlServer::bind(addr, FrameCodec::new(key), dispatcher)
            .await
            .unwrap()
            .with_read_timeout(Some(Duration::from_secs(1)));
        let addr = server.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(server.run(rx));
        (addr, tx)
    }

    async fn send(addr: SocketAddr, frame: &[u8]) -> serde_json::Value {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(frame).await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        let body = ssmgr_frame::decode_response(&reply).unwrap();
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn test_version_round_trip() {
        let (addr, _tx) = start("secret").await;
        let now = chrono::Utc::now().timestamp_millis();
        let frame = FrameCodec::new("secret")
            .seal(br#"{"command":"version"}"#, now)
            .unwrap();

        let reply = send(addr, &frame).await;
        assert_eq!(reply["code"], 0);
        assert_eq!(reply["data"]["version"], crate::dispatch::VERSION);
    }

    #[tokio::test]
    async fn test_frame_split_across_writes() {
        let (addr, _tx) = start("secret").await;
        let now = chrono::Utc::now().timestamp_millis();
        let frame = FrameCodec::new("secret")
            .seal(br#"{"command":"list"}"#, now)
            .unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let (head, tail) = frame.split_at(5);
        stream.write_all(head).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.write_all(tail).await.unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        let body: serde_json::Value =
            serde_json::from_slice(ssmgr_frame::decode_response(&reply).unwrap()).unwrap();
        assert_eq!(body, serde_json::json!({"code": 0, "data": []}));
    }

    #[tokio::test]
    async fn test_too_short_frame_is_error() {
        let (addr, _tx) = start("secret").await;
        let reply = send(addr, &[0x00, 0x03, 1, 2, 3]).await;
        assert_eq!(reply["code"], -1);
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let (addr, _tx) = start("secret").await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0x00]).await.unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());
    }
}
