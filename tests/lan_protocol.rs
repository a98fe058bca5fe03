//! LAN speed protocol and discovery over loopback.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use netgauge::config::{DiscoveryConfig, LanServerConfig, LanTestConfig};
use netgauge::error::ErrorKind;
use netgauge::events::{EventBus, FinalResults, MeasurementEvent};
use netgauge::lan::discovery::{DiscoveryKind, DiscoveryMessage};
use netgauge::lan::rpc::{LanMessage, ERR_VERSION_MISMATCH};
use netgauge::lan::wire::{Frame, LanCodec};
use netgauge::lan::{LanDevice, LanDiscovery, LanSpeedServer, LanSpeedSession, PROTOCOL_VERSION};
use netgauge::progress::LanPhase;

fn quick_test_config() -> LanTestConfig {
    LanTestConfig {
        connect_timeout_ms: 1000,
        handshake_timeout_ms: 1000,
        ping_count: 5,
        probe_timeout_ms: 500,
        phase_duration_ms: 300,
        max_phase_bytes: 16 * 1024 * 1024,
        chunk_size: 64 * 1024,
        report_interval_ms: 50,
        speed_window_ms: 200,
        phase_slack_ms: 2000,
    }
}

async fn start_server() -> (SocketAddr, CancellationToken) {
    let config = LanServerConfig {
        listen_address: "127.0.0.1:0".to_string(),
        server_name: "loopback".to_string(),
        ..LanServerConfig::default()
    };
    let server = LanSpeedServer::bind(&config, "server-host-id").await.unwrap();
    let addr = server.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(server.serve(cancel.clone()));
    (addr, cancel)
}

/// Payload size of each data frame a hand-rolled peer sends.
const PEER_CHUNK: usize = 50_000;

/// How a hand-rolled peer behaves.
#[derive(Clone, Copy)]
enum Peer {
    /// Answers every ping after a fixed delay, then serves tiny phases.
    DelayedPongs(Duration),
    /// Answers pings at once and sends `chunks` data frames during
    /// download, sleeping `gap` before each one.
    Paced { chunks: u32, gap: Duration },
    /// Completes the handshake and never answers a ping.
    Silent,
    /// Announces a different protocol version.
    WrongVersion,
}

async fn spawn_peer(peer: Peer) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = Framed::new(stream, LanCodec::new());

        let Some(Ok(Frame::Control(LanMessage::Hello { .. }))) = conn.next().await else {
            return;
        };
        let version = match peer {
            Peer::WrongVersion => PROTOCOL_VERSION + 1,
            _ => PROTOCOL_VERSION,
        };
        let ready = LanMessage::Ready {
            version,
            server_name: "fake".to_string(),
            host_id: "fake-id".to_string(),
        };
        if conn.send(Frame::Control(ready)).await.is_err() {
            return;
        }

        while let Some(Ok(frame)) = conn.next().await {
            let reply = match (peer, frame) {
                (Peer::Silent, _) => continue,
                (_, Frame::Control(LanMessage::Ping { seq, send_time_us })) => {
                    if let Peer::DelayedPongs(d) = peer {
                        tokio::time::sleep(d).await;
                    }
                    LanMessage::Pong { seq, send_time_us }
                }
                (_, Frame::Control(LanMessage::StartDownload { .. })) => {
                    let (chunks, gap) = match peer {
                        Peer::Paced { chunks, gap } => (chunks, gap),
                        _ => (4, Duration::ZERO),
                    };
                    for _ in 0..chunks {
                        if !gap.is_zero() {
                            tokio::time::sleep(gap).await;
                        }
                        let chunk = Frame::Data(Bytes::from(vec![1u8; PEER_CHUNK]));
                        if conn.send(chunk).await.is_err() {
                            return;
                        }
                    }
                    LanMessage::DownloadDone {
                        bytes_sent: chunks as u64 * PEER_CHUNK as u64,
                    }
                }
                (_, Frame::Control(LanMessage::UploadDone { bytes_sent })) => LanMessage::UploadAck {
                    bytes_received: bytes_sent,
                },
                (_, Frame::Control(LanMessage::Bye)) => return,
                _ => continue,
            };
            if conn.send(Frame::Control(reply)).await.is_err() {
                return;
            }
        }
    });
    addr
}

fn dead_port() -> SocketAddr {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
}

#[tokio::test]
async fn test_full_session_against_real_server() {
    let (addr, server_cancel) = start_server().await;
    let bus = EventBus::default();
    let mut events = bus.subscribe();

    let session = LanSpeedSession::new(quick_test_config(), "tester").with_events(bus);
    let result = session.run(addr, "").await.unwrap();

    assert_eq!(result.peer_name, "loopback");
    assert!(result.download_speed_mbps > 0.0);
    assert!(result.upload_speed_mbps > 0.0);
    assert!(result.latency_ms >= 0.0);
    assert_eq!(result.dropped_pings, 0);
    assert!(result.bytes_transferred > 0);
    assert!(result.duration_seconds > 0.0);
    assert_eq!(session.progress().phase, LanPhase::Complete);

    let mut saw_final = false;
    while let Ok(event) = events.try_recv() {
        if let MeasurementEvent::Final {
            results: FinalResults::Lan(r),
            ..
        } = event
        {
            assert_eq!(r.id, result.id);
            saw_final = true;
        }
    }
    assert!(saw_final);
    server_cancel.cancel();
}

#[tokio::test]
async fn test_byte_cap_limits_download() {
    let (addr, server_cancel) = start_server().await;
    let config = LanTestConfig {
        phase_duration_ms: 5000,
        max_phase_bytes: 256 * 1024,
        ..quick_test_config()
    };

    let started = Instant::now();
    let result = LanSpeedSession::new(config, "tester").run(addr, "peer").await.unwrap();

    // Both phases stop at the cap long before the duration runs out.
    assert_eq!(result.bytes_transferred, 2 * 256 * 1024);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(result.peer_name, "peer");
    server_cancel.cancel();
}

#[tokio::test]
async fn test_latency_is_median_of_fixed_delay() {
    let delay = Duration::from_millis(40);
    let addr = spawn_peer(Peer::DelayedPongs(delay)).await;

    let result = LanSpeedSession::new(quick_test_config(), "tester")
        .run(addr, "fake")
        .await
        .unwrap();

    assert!(result.latency_ms >= 40.0, "latency {}", result.latency_ms);
    assert!(result.latency_ms < 80.0, "latency {}", result.latency_ms);
    assert_eq!(result.dropped_pings, 0);
}

#[tokio::test]
async fn test_duration_covers_transfer_phases_only() {
    // Five pongs at 200 ms each put a full second into the latency phase.
    let addr = spawn_peer(Peer::DelayedPongs(Duration::from_millis(200))).await;

    let started = Instant::now();
    let result = LanSpeedSession::new(quick_test_config(), "tester")
        .run(addr, "fake")
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(1));
    // Instant download plus a 300 ms upload.
    assert!(result.duration_seconds > 0.0);
    assert!(result.duration_seconds < 0.6, "duration {}", result.duration_seconds);
}

#[tokio::test]
async fn test_speeds_follow_bytes_over_time() {
    // 8 x 50 kB, one every 50 ms: 400 kB in about 400 ms is 8 Mbit/s.
    let chunks = 8;
    let addr = spawn_peer(Peer::Paced {
        chunks,
        gap: Duration::from_millis(50),
    })
    .await;

    let result = LanSpeedSession::new(quick_test_config(), "tester")
        .run(addr, "fake")
        .await
        .unwrap();

    let down_bytes = (chunks as usize * PEER_CHUNK) as f64;
    let expected_down = down_bytes * 8.0 / (0.4 * 1e6);
    let down_err = (result.download_speed_mbps - expected_down).abs() / expected_down;
    assert!(down_err < 0.15, "download {} Mbps, expected ~{}", result.download_speed_mbps, expected_down);

    // The remaining bytes and seconds belong to the upload phase.
    let down_secs = down_bytes * 8.0 / (result.download_speed_mbps * 1e6);
    let up_bytes = result.bytes_transferred as f64 - down_bytes;
    let up_secs = result.duration_seconds - down_secs;
    assert!(up_bytes > 0.0 && up_secs > 0.0);
    let expected_up = up_bytes * 8.0 / (up_secs * 1e6);
    let up_err = (result.upload_speed_mbps - expected_up).abs() / expected_up;
    assert!(up_err < 1e-6, "upload {} Mbps, expected {}", result.upload_speed_mbps, expected_up);
}

#[tokio::test]
async fn test_silent_peer_fails_latency_probe() {
    let addr = spawn_peer(Peer::Silent).await;
    let config = LanTestConfig {
        ping_count: 4,
        probe_timeout_ms: 150,
        ..quick_test_config()
    };

    let session = LanSpeedSession::new(config, "tester");
    let started = Instant::now();
    let err = session.run(addr, "fake").await.unwrap_err();

    assert_eq!(err.to_string(), "latency probe failed");
    assert_eq!(err.kind(), ErrorKind::Timeout);
    // Three of four lost settles it; the fourth ping is never sent.
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(session.progress().phase, LanPhase::Failed);
}

#[tokio::test]
async fn test_version_mismatch_from_peer() {
    let addr = spawn_peer(Peer::WrongVersion).await;
    let err = LanSpeedSession::new(quick_test_config(), "tester")
        .run(addr, "fake")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolMismatch);
}

#[tokio::test]
async fn test_server_rejects_other_protocol_version() {
    let (addr, server_cancel) = start_server().await;
    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut conn = Framed::new(stream, LanCodec::new());

    conn.send(Frame::Control(LanMessage::Hello {
        version: PROTOCOL_VERSION + 1,
        client_name: "future".to_string(),
    }))
    .await
    .unwrap();

    match conn.next().await {
        Some(Ok(Frame::Control(LanMessage::Error { code, .. }))) => assert_eq!(code, ERR_VERSION_MISMATCH),
        other => panic!("expected error frame, got {:?}", other),
    }
    server_cancel.cancel();
}

#[tokio::test]
async fn test_refused_peer_is_unreachable() {
    let config = quick_test_config();
    let bound = config.connect_timeout() + Duration::from_secs(1);

    let session = LanSpeedSession::new(config, "tester");
    let started = Instant::now();
    let err = session.run(dead_port(), "ghost").await.unwrap_err();

    assert_eq!(err.to_string(), "peer unreachable");
    assert_eq!(err.kind(), ErrorKind::Unreachable);
    assert!(started.elapsed() < bound);
    assert_eq!(session.progress().message, "peer unreachable");
}

/// A listener that never accepts and whose accept queue is already full,
/// so further connection attempts hang instead of being refused.
fn saturated_listener() -> (Socket, SocketAddr, Vec<std::net::TcpStream>) {
    let listener = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
    listener.bind(&bind.into()).unwrap();
    listener.listen(0).unwrap();
    let addr = listener.local_addr().unwrap().as_socket().unwrap();

    let mut held = Vec::new();
    for _ in 0..64 {
        match std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(200)) {
            Ok(stream) => held.push(stream),
            Err(_) => return (listener, addr, held),
        }
    }
    panic!("accept queue of {} never filled", addr);
}

#[tokio::test]
async fn test_connect_timeout_reports_unreachable() {
    let (_listener, addr, _held) = saturated_listener();
    let config = LanTestConfig {
        connect_timeout_ms: 300,
        ..quick_test_config()
    };
    let timeout = config.connect_timeout();

    let session = LanSpeedSession::new(config, "tester");
    let started = Instant::now();
    let err = session.run(addr, "stuck").await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.to_string(), "peer unreachable");
    assert_eq!(err.kind(), ErrorKind::Unreachable);
    assert!(elapsed >= timeout, "gave up after {:?}", elapsed);
    assert!(elapsed < timeout + Duration::from_millis(700), "gave up after {:?}", elapsed);
    assert_eq!(session.progress().phase, LanPhase::Failed);
}

#[tokio::test]
async fn test_cancel_during_download() {
    let (addr, server_cancel) = start_server().await;
    let config = LanTestConfig {
        phase_duration_ms: 20_000,
        max_phase_bytes: u64::MAX,
        ..quick_test_config()
    };
    let session = LanSpeedSession::new(config, "tester");
    let mut progress = session.subscribe();
    let cancel = session.cancel_token();

    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            if progress.borrow().phase == LanPhase::Download {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let err = session.run(addr, "loopback").await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(session.progress().phase, LanPhase::Failed);
    assert_eq!(session.progress().message, "cancelled");
    server_cancel.cancel();
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn unicast_discovery(port: u16) -> DiscoveryConfig {
    DiscoveryConfig {
        group: "127.0.0.1".to_string(),
        port,
        advertise_interval_ms: 100,
        sweep_interval_ms: 100,
        stale_after_ms: 400,
    }
}

/// Poll the registry until `check` holds or `limit` passes.
async fn wait_for_devices(discovery: &LanDiscovery, limit: Duration, check: impl Fn(&[LanDevice]) -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check(&discovery.devices().await) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_discovery_converges_and_withdraws() {
    let config = unicast_discovery(free_udp_port());
    let listener = LanDiscovery::new(config.clone(), "listener-id", "listener");
    let advertiser = LanDiscovery::new(config, "advertiser-id", "studio");

    listener.start_discovery().await.unwrap();
    // The listener also advertises; it must never list itself.
    listener.start_advertising(1111).await.unwrap();
    advertiser.start_advertising(4242).await.unwrap();

    assert!(wait_for_devices(&listener, Duration::from_secs(2), |d| !d.is_empty()).await);

    // Several more advertisement rounds still yield one entry.
    tokio::time::sleep(Duration::from_millis(350)).await;
    let devices = listener.devices().await;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, "advertiser-id");
    assert_eq!(devices[0].name, "studio");
    assert_eq!(devices[0].address.port(), 4242);

    advertiser.stop_advertising().await;
    assert!(wait_for_devices(&listener, Duration::from_millis(300), |d| d.is_empty()).await);

    listener.shutdown().await;
    assert!(!listener.is_discovering().await);
}

#[tokio::test]
async fn test_silent_device_goes_stale() {
    let config = unicast_discovery(free_udp_port());
    let target: SocketAddr = format!("127.0.0.1:{}", config.port).parse().unwrap();
    let listener = LanDiscovery::new(config, "listener-id", "listener");
    listener.start_discovery().await.unwrap();

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let advert = DiscoveryMessage::new(DiscoveryKind::Advertise, "one-shot", "ghost", 5000);
    sender
        .send_to(&serde_json::to_vec(&advert).unwrap(), target)
        .await
        .unwrap();
    sender.send_to(b"not for us", target).await.unwrap();

    assert!(wait_for_devices(&listener, Duration::from_secs(1), |d| d.len() == 1).await);
    // Stale after 400 ms, swept every 100 ms.
    assert!(wait_for_devices(&listener, Duration::from_secs(1), |d| d.is_empty()).await);
    listener.shutdown().await;
}
