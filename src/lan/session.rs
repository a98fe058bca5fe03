//! Client side of a LAN speed test.
//!
//! One `LanSpeedSession` drives one test against one peer through
//! `idle -> connecting -> measuring_latency -> download -> upload -> complete`,
//! dropping to `failed` on any error, timeout or cancellation. Progress is
//! published on a `watch` channel (and optionally the [`EventBus`]); a
//! [`LanSpeedResult`] exists only for a session that reached `complete`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rand::RngCore;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::rpc::{LanMessage, ERR_VERSION_MISMATCH};
use super::wire::{Frame, LanCodec, MAX_DATA_CHUNK};
use super::{LanSpeedResult, PROTOCOL_VERSION};
use crate::config::LanTestConfig;
use crate::error::MeasurementError;
use crate::events::{EventBus, FinalResults, MeasurementEvent, ProgressUpdate};
use crate::meter::{self, ThroughputMeter};
use crate::progress::{LanPhase, LanTestProgress};

type Conn = Framed<TcpStream, LanCodec>;

/// What the latency phase collected.
#[derive(Debug, Clone, Default)]
struct LatencyStats {
    samples: Vec<f64>,
    dropped: u32,
}

pub struct LanSpeedSession {
    config: LanTestConfig,
    client_name: String,
    cancel: CancellationToken,
    progress: watch::Sender<LanTestProgress>,
    events: Option<EventBus>,
}

impl LanSpeedSession {
    pub fn new(config: LanTestConfig, client_name: impl Into<String>) -> Self {
        let (progress, _) = watch::channel(LanTestProgress::idle());
        Self {
            config,
            client_name: client_name.into(),
            cancel: CancellationToken::new(),
            progress,
            events: None,
        }
    }

    /// Also publish progress and the final result on `bus`.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<LanTestProgress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> LanTestProgress {
        self.progress.borrow().clone()
    }

    /// Token that aborts the session from any state.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run the whole test against `addr`. `peer_name` labels the result; an
    /// empty name falls back to the name the server announces.
    pub async fn run(
        &self,
        addr: SocketAddr,
        peer_name: &str,
    ) -> Result<LanSpeedResult, MeasurementError> {
        let run_id = Uuid::new_v4();
        if self.progress.borrow().phase != LanPhase::Idle {
            return Err(MeasurementError::backend("session already used"));
        }

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(MeasurementError::Cancelled),
            r = self.run_phases(addr, peer_name, run_id) => r,
        };

        match outcome {
            Ok(result) => {
                self.set(run_id, LanTestProgress::new(LanPhase::Complete, 1.0, "complete"));
                info!(
                    peer = %result.peer_name,
                    download_mbps = result.download_speed_mbps,
                    upload_mbps = result.upload_speed_mbps,
                    latency_ms = result.latency_ms,
                    "LAN speed test complete"
                );
                if let Some(bus) = &self.events {
                    bus.publish(MeasurementEvent::Final {
                        run_id,
                        results: FinalResults::Lan(Arc::new(result.clone())),
                    });
                }
                Ok(result)
            }
            Err(e) => {
                if e.is_cancelled() {
                    info!(%addr, "LAN speed test cancelled");
                } else {
                    warn!(%addr, kind = %e.kind(), error = %e, "LAN speed test failed");
                }
                self.set(run_id, LanTestProgress::new(LanPhase::Failed, 1.0, e.to_string()));
                Err(e)
            }
        }
    }

    async fn run_phases(
        &self,
        addr: SocketAddr,
        peer_name: &str,
        run_id: Uuid,
    ) -> Result<LanSpeedResult, MeasurementError> {
        let clock = Instant::now();

        self.set(run_id, LanTestProgress::new(LanPhase::Connecting, 0.0, format!("connecting to {}", addr)));
        let mut conn = self.connect(addr).await?;
        let server_name = self.handshake(&mut conn).await?;
        let peer_name = if peer_name.is_empty() {
            server_name
        } else {
            peer_name.to_string()
        };

        self.set(run_id, LanTestProgress::new(LanPhase::MeasuringLatency, 0.0, "measuring latency"));
        let latency = self.measure_latency(&mut conn, clock, run_id).await?;
        let latency_ms = meter::median(&latency.samples)
            .ok_or_else(|| MeasurementError::timeout("latency probe failed"))?;

        self.set(run_id, LanTestProgress::new(LanPhase::Download, 0.0, "download"));
        let (down_bytes, down_mbps, down_elapsed) = self.download(&mut conn, run_id).await?;

        self.set(run_id, LanTestProgress::new(LanPhase::Upload, 0.0, "upload"));
        let (up_bytes, up_mbps, up_elapsed) = self.upload(&mut conn, run_id).await?;

        let _ = conn.send(Frame::Control(LanMessage::Bye)).await;
        let _ = conn.close().await;

        Ok(LanSpeedResult {
            id: Uuid::new_v4(),
            peer_name,
            download_speed_mbps: down_mbps,
            upload_speed_mbps: up_mbps,
            latency_ms,
            jitter_ms: meter::jitter(&latency.samples),
            dropped_pings: latency.dropped,
            bytes_transferred: down_bytes + up_bytes,
            duration_seconds: (down_elapsed + up_elapsed).as_secs_f64(),
            timestamp: chrono::Utc::now(),
        })
    }

    async fn connect(&self, addr: SocketAddr) -> Result<Conn, MeasurementError> {
        let stream = match tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "connect failed");
                return Err(MeasurementError::unreachable("peer unreachable"));
            }
            Err(_) => {
                debug!(%addr, "connect timed out");
                return Err(MeasurementError::unreachable("peer unreachable"));
            }
        };
        let _ = stream.set_nodelay(true);
        Ok(Framed::new(stream, LanCodec::new()))
    }

    /// Exchange `hello`/`ready`; returns the server's announced name.
    async fn handshake(&self, conn: &mut Conn) -> Result<String, MeasurementError> {
        send(
            conn,
            LanMessage::Hello {
                version: PROTOCOL_VERSION,
                client_name: self.client_name.clone(),
            },
        )
        .await?;

        let deadline = Instant::now() + self.config.handshake_timeout();
        match recv(conn, deadline, "handshake").await? {
            Frame::Control(LanMessage::Ready {
                version,
                server_name,
                host_id,
            }) => {
                if version != PROTOCOL_VERSION {
                    return Err(MeasurementError::mismatch(format!(
                        "peer speaks protocol version {}, expected {}",
                        version, PROTOCOL_VERSION
                    )));
                }
                debug!(%server_name, %host_id, "handshake complete");
                Ok(server_name)
            }
            Frame::Control(LanMessage::Error { code, message }) if code == ERR_VERSION_MISMATCH => {
                Err(MeasurementError::mismatch(message))
            }
            Frame::Control(LanMessage::Error { code, message }) => Err(MeasurementError::backend(
                format!("peer error {}: {}", code, message),
            )),
            Frame::Control(other) => Err(MeasurementError::mismatch(format!(
                "expected ready, got {}",
                other.name()
            ))),
            Frame::Data(_) => Err(MeasurementError::mismatch("expected ready, got data")),
        }
    }

    /// Ping one at a time; a ping with no pong within the probe timeout is
    /// dropped. Fails as soon as more than half the pings are certain to be
    /// lost.
    async fn measure_latency(
        &self,
        conn: &mut Conn,
        clock: Instant,
        run_id: Uuid,
    ) -> Result<LatencyStats, MeasurementError> {
        let count = self.config.ping_count.max(1);
        let mut stats = LatencyStats::default();

        for seq in 0..count {
            let send_time_us = clock.elapsed().as_micros() as u64;
            send(conn, LanMessage::Ping { seq, send_time_us }).await?;

            let deadline = Instant::now() + self.config.probe_timeout();
            let rtt = loop {
                let frame = match tokio::time::timeout_at(deadline, conn.next()).await {
                    Err(_) => break None,
                    Ok(frame) => frame,
                };
                match frame {
                    None => return Err(MeasurementError::backend("peer closed the connection")),
                    Some(Err(e)) => return Err(MeasurementError::backend(e.to_string())),
                    Some(Ok(Frame::Control(LanMessage::Pong { seq: s, send_time_us: t }))) if s == seq => {
                        let now_us = clock.elapsed().as_micros() as u64;
                        break Some(now_us.saturating_sub(t) as f64 / 1000.0);
                    }
                    // Late pong for an earlier probe, or stray traffic.
                    Some(Ok(_)) => continue,
                }
            };

            match rtt {
                Some(ms) => stats.samples.push(ms),
                None => {
                    stats.dropped += 1;
                    debug!(seq, "ping dropped");
                }
            }
            if stats.dropped * 2 > count {
                return Err(MeasurementError::timeout("latency probe failed"));
            }

            let frac = (seq + 1) as f64 / count as f64;
            self.set(
                run_id,
                LanTestProgress::new(LanPhase::MeasuringLatency, frac, format!("ping {}/{}", seq + 1, count)),
            );
        }
        Ok(stats)
    }

    /// Returns bytes received, Mbps and the phase's elapsed time.
    async fn download(&self, conn: &mut Conn, run_id: Uuid) -> Result<(u64, f64, Duration), MeasurementError> {
        let duration = self.config.phase_duration();
        let cap = self.config.max_phase_bytes;
        send(
            conn,
            LanMessage::StartDownload {
                duration_ms: duration.as_millis() as u64,
                max_bytes: cap,
                chunk_size: self.config.chunk_size.clamp(1, MAX_DATA_CHUNK) as u32,
            },
        )
        .await?;

        let started = Instant::now();
        let deadline = started + duration + self.config.phase_slack();
        let mut meter = ThroughputMeter::starting_at(started, self.config.speed_window());
        let mut last_report = started;

        loop {
            match recv(conn, deadline, "download").await? {
                Frame::Data(bytes) => {
                    meter.record(bytes.len() as u64);
                    if last_report.elapsed() >= self.config.report_interval() {
                        last_report = Instant::now();
                        let frac = phase_fraction(started, duration, meter.total_bytes(), cap);
                        self.set(
                            run_id,
                            LanTestProgress::new(LanPhase::Download, frac, "download")
                                .with_speed(meter.current_mbps()),
                        );
                    }
                }
                Frame::Control(LanMessage::DownloadDone { bytes_sent }) => {
                    let elapsed = started.elapsed();
                    let received = meter.total_bytes();
                    if bytes_sent != received {
                        debug!(bytes_sent, received, "download byte count differs from server");
                    }
                    return Ok((received, meter::mbps(received, elapsed), elapsed));
                }
                Frame::Control(LanMessage::Error { code, message }) => {
                    return Err(MeasurementError::backend(format!("peer error {}: {}", code, message)));
                }
                Frame::Control(_) => continue,
            }
        }
    }

    async fn upload(&self, conn: &mut Conn, run_id: Uuid) -> Result<(u64, f64, Duration), MeasurementError> {
        let duration = self.config.phase_duration();
        let cap = self.config.max_phase_bytes;
        let chunk_size = self.config.chunk_size.clamp(1, MAX_DATA_CHUNK);
        send(
            conn,
            LanMessage::StartUpload {
                duration_ms: duration.as_millis() as u64,
                max_bytes: cap,
            },
        )
        .await?;

        let mut filler = vec![0u8; chunk_size];
        rand::thread_rng().fill_bytes(&mut filler);
        let filler = Bytes::from(filler);

        let started = Instant::now();
        let deadline = started + duration + self.config.phase_slack();
        let mut meter = ThroughputMeter::starting_at(started, self.config.speed_window());
        let mut last_report = started;

        while meter.total_bytes() < cap && started.elapsed() < duration {
            let len = (cap - meter.total_bytes()).min(chunk_size as u64) as usize;
            match tokio::time::timeout_at(deadline, conn.send(Frame::Data(filler.slice(..len)))).await {
                Err(_) => return Err(MeasurementError::timeout("upload phase timed out")),
                Ok(Err(e)) => return Err(MeasurementError::backend(e.to_string())),
                Ok(Ok(())) => meter.record(len as u64),
            }
            if last_report.elapsed() >= self.config.report_interval() {
                last_report = Instant::now();
                let frac = phase_fraction(started, duration, meter.total_bytes(), cap);
                self.set(
                    run_id,
                    LanTestProgress::new(LanPhase::Upload, frac, "upload").with_speed(meter.current_mbps()),
                );
            }
        }

        let sent = meter.total_bytes();
        let elapsed = started.elapsed();
        let mbps = meter::mbps(sent, elapsed);
        send(conn, LanMessage::UploadDone { bytes_sent: sent }).await?;

        // The ack is informational; a missing one does not void the measurement.
        let ack_deadline = Instant::now() + self.config.phase_slack();
        loop {
            match recv(conn, ack_deadline, "upload ack").await {
                Ok(Frame::Control(LanMessage::UploadAck { bytes_received })) => {
                    debug!(bytes_sent = sent, bytes_received, "upload acknowledged");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!(error = %e, "no upload ack");
                    break;
                }
            }
        }
        Ok((sent, mbps, elapsed))
    }

    /// Publish `next` if the state machine allows it, keeping progress
    /// non-decreasing within a phase.
    fn set(&self, run_id: Uuid, next: LanTestProgress) {
        let mut published = None;
        self.progress.send_if_modified(|current| {
            let allowed = current.phase == next.phase || current.phase.can_transition(next.phase);
            if !allowed || (current.phase.is_terminal() && current.phase == next.phase) {
                return false;
            }
            let mut next = next.clone();
            if current.phase == next.phase && next.progress < current.progress {
                next.progress = current.progress;
            }
            *current = next;
            published = Some(current.clone());
            true
        });

        if let (Some(bus), Some(update)) = (&self.events, published) {
            bus.publish(MeasurementEvent::Progress {
                run_id,
                update: ProgressUpdate::Lan(Arc::new(update)),
            });
        }
    }
}

async fn send(conn: &mut Conn, msg: LanMessage) -> Result<(), MeasurementError> {
    conn.send(Frame::Control(msg))
        .await
        .map_err(|e| MeasurementError::backend(e.to_string()))
}

async fn recv(conn: &mut Conn, deadline: Instant, what: &str) -> Result<Frame, MeasurementError> {
    match tokio::time::timeout_at(deadline, conn.next()).await {
        Err(_) => Err(MeasurementError::timeout(format!("{} timed out", what))),
        Ok(None) => Err(MeasurementError::backend(format!(
            "peer closed the connection during {}",
            what
        ))),
        Ok(Some(Err(e))) => Err(MeasurementError::backend(e.to_string())),
        Ok(Some(Ok(frame))) => Ok(frame),
    }
}

/// The larger of time-based and byte-based completion.
fn phase_fraction(started: Instant, duration: Duration, bytes: u64, cap: u64) -> f64 {
    let by_time = started.elapsed().as_secs_f64() / duration.as_secs_f64().max(f64::EPSILON);
    let by_bytes = bytes as f64 / cap.max(1) as f64;
    by_time.max(by_bytes).min(1.0)
}
