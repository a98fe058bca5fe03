//! LAN speed test responder.
//!
//! `LanSpeedServer` owns the TCP listener and handles every accepted
//! connection in its own task. Connections share nothing but the read-only
//! server identity and limits.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rand::RngCore;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::rpc::{LanMessage, ERR_UNEXPECTED_MESSAGE, ERR_VERSION_MISMATCH};
use super::wire::{Frame, LanCodec, WireError, MAX_DATA_CHUNK};
use super::PROTOCOL_VERSION;
use crate::config::LanServerConfig;

/// Identity and limits shared read-only by all connection tasks.
#[derive(Debug)]
struct ServerShared {
    server_name: String,
    host_id: String,
    max_phase_duration: Duration,
    max_phase_bytes: u64,
    idle_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
enum ConnError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("peer idle for {0:?}")]
    Idle(Duration),
    #[error("peer closed the connection")]
    Closed,
    #[error("{0}")]
    Protocol(String),
}

pub struct LanSpeedServer {
    listener: TcpListener,
    shared: Arc<ServerShared>,
}

impl LanSpeedServer {
    /// Bind the listener described by `config`.
    pub async fn bind(config: &LanServerConfig, host_id: impl Into<String>) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_address)
            .await
            .with_context(|| format!("failed to bind LAN listener on {}", config.listen_address))?;

        let shared = Arc::new(ServerShared {
            server_name: config.resolved_name(),
            host_id: host_id.into(),
            max_phase_duration: Duration::from_millis(config.max_phase_duration_ms),
            max_phase_bytes: config.max_phase_bytes,
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
        });

        Ok(Self { listener, shared })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("listener has no local address")
    }

    pub fn server_name(&self) -> &str {
        &self.shared.server_name
    }

    /// Accept connections until `cancel` fires. In-flight sessions are
    /// cancelled with it.
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        info!(
            addr = %self.local_addr()?,
            server_name = %self.shared.server_name,
            "LAN speed server listening"
        );

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "failed to accept LAN connection");
                        continue;
                    }
                },
            };

            debug!(peer_addr = %peer_addr, "accepted LAN connection");
            let shared = Arc::clone(&self.shared);
            let conn_cancel = cancel.child_token();

            tokio::spawn(async move {
                let outcome = tokio::select! {
                    _ = conn_cancel.cancelled() => Ok(()),
                    r = handle_connection(stream, &shared) => r,
                };
                match outcome {
                    Ok(()) => debug!(peer_addr = %peer_addr, "LAN session finished"),
                    Err(ConnError::Closed) => debug!(peer_addr = %peer_addr, "peer disconnected"),
                    Err(e) => warn!(peer_addr = %peer_addr, error = %e, "LAN session aborted"),
                }
            });
        }

        info!("LAN speed server stopped");
        Ok(())
    }
}

type Conn = Framed<TcpStream, LanCodec>;

async fn recv(conn: &mut Conn, idle: Duration) -> Result<Frame, ConnError> {
    match tokio::time::timeout(idle, conn.next()).await {
        Err(_) => Err(ConnError::Idle(idle)),
        Ok(None) => Err(ConnError::Closed),
        Ok(Some(frame)) => Ok(frame?),
    }
}

async fn send(conn: &mut Conn, msg: LanMessage) -> Result<(), ConnError> {
    conn.send(Frame::Control(msg)).await?;
    Ok(())
}

async fn handle_connection(stream: TcpStream, shared: &ServerShared) -> Result<(), ConnError> {
    let _ = stream.set_nodelay(true);
    let mut conn = Framed::new(stream, LanCodec::new());

    // Handshake.
    match recv(&mut conn, shared.idle_timeout).await? {
        Frame::Control(LanMessage::Hello { version, client_name }) => {
            if version != PROTOCOL_VERSION {
                send(
                    &mut conn,
                    LanMessage::Error {
                        code: ERR_VERSION_MISMATCH,
                        message: format!(
                            "unsupported protocol version {} (server speaks {})",
                            version, PROTOCOL_VERSION
                        ),
                    },
                )
                .await?;
                return Err(ConnError::Protocol(format!("client version {}", version)));
            }
            info!(client = %client_name, "LAN client connected");
            send(
                &mut conn,
                LanMessage::Ready {
                    version: PROTOCOL_VERSION,
                    server_name: shared.server_name.clone(),
                    host_id: shared.host_id.clone(),
                },
            )
            .await?;
        }
        _ => {
            reject(&mut conn, "expected hello").await;
            return Err(ConnError::Protocol("expected hello".into()));
        }
    }

    loop {
        let msg = match recv(&mut conn, shared.idle_timeout).await? {
            Frame::Control(msg) => msg,
            Frame::Data(_) => {
                reject(&mut conn, "data outside upload").await;
                return Err(ConnError::Protocol("data frame outside upload".into()));
            }
        };

        match msg {
            LanMessage::Ping { seq, send_time_us } => {
                send(&mut conn, LanMessage::Pong { seq, send_time_us }).await?;
            }
            LanMessage::StartDownload {
                duration_ms,
                max_bytes,
                chunk_size,
            } => {
                let duration = Duration::from_millis(duration_ms).min(shared.max_phase_duration);
                let cap = max_bytes.min(shared.max_phase_bytes);
                let chunk = (chunk_size as usize).clamp(1, MAX_DATA_CHUNK);
                let sent = stream_download(&mut conn, duration, cap, chunk).await?;
                debug!(bytes_sent = sent, "download phase served");
                send(&mut conn, LanMessage::DownloadDone { bytes_sent: sent }).await?;
            }
            LanMessage::StartUpload { .. } => {
                let received = absorb_upload(&mut conn, shared.idle_timeout).await?;
                debug!(bytes_received = received, "upload phase absorbed");
                send(
                    &mut conn,
                    LanMessage::UploadAck {
                        bytes_received: received,
                    },
                )
                .await?;
            }
            LanMessage::Bye => return Ok(()),
            LanMessage::Error { code, message } => {
                return Err(ConnError::Protocol(format!("client error {}: {}", code, message)));
            }
            other => {
                reject(&mut conn, other.name()).await;
                return Err(ConnError::Protocol(format!("unexpected {}", other.name())));
            }
        }
    }
}

/// Send filler frames until `duration` elapses or `cap` bytes are out.
async fn stream_download(
    conn: &mut Conn,
    duration: Duration,
    cap: u64,
    chunk_size: usize,
) -> Result<u64, ConnError> {
    let mut filler = vec![0u8; chunk_size];
    rand::thread_rng().fill_bytes(&mut filler);
    let filler = Bytes::from(filler);

    let deadline = Instant::now() + duration;
    let mut sent = 0u64;
    while sent < cap && Instant::now() < deadline {
        let len = (cap - sent).min(chunk_size as u64) as usize;
        conn.send(Frame::Data(filler.slice(..len))).await?;
        sent += len as u64;
    }
    Ok(sent)
}

/// Count data frames until the client's `upload_done`.
async fn absorb_upload(conn: &mut Conn, idle: Duration) -> Result<u64, ConnError> {
    let mut received = 0u64;
    loop {
        match recv(conn, idle).await? {
            Frame::Data(bytes) => received += bytes.len() as u64,
            Frame::Control(LanMessage::UploadDone { bytes_sent }) => {
                if bytes_sent != received {
                    debug!(bytes_sent, received, "upload byte count differs from client");
                }
                return Ok(received);
            }
            Frame::Control(LanMessage::Ping { seq, send_time_us }) => {
                send(conn, LanMessage::Pong { seq, send_time_us }).await?;
            }
            Frame::Control(other) => {
                return Err(ConnError::Protocol(format!(
                    "unexpected {} during upload",
                    other.name()
                )));
            }
        }
    }
}

async fn reject(conn: &mut Conn, message: &str) {
    let _ = send(
        conn,
        LanMessage::Error {
            code: ERR_UNEXPECTED_MESSAGE,
            message: message.to_string(),
        },
    )
    .await;
}
