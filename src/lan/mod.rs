//! Peer-to-peer LAN speed testing.
//!
//! Hosts running in server mode advertise themselves over UDP multicast
//! ([`discovery`]) and accept direct TCP sessions ([`server`]). A client picks
//! a discovered peer and drives a [`session::LanSpeedSession`] against it:
//! handshake, latency probes, then a timed download and upload over the
//! framed protocol in [`wire`] and [`rpc`].

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod discovery;
pub mod rpc;
pub mod server;
pub mod session;
pub mod wire;

pub use discovery::{DeviceRegistry, LanDiscovery};
pub use server::LanSpeedServer;
pub use session::LanSpeedSession;

/// Version spoken in `hello`/`ready` and in discovery datagrams.
pub const PROTOCOL_VERSION: u32 = 1;

/// Service tag carried by every discovery datagram.
pub const SERVICE_NAME: &str = "netgauge-lan";

/// A peer seen on the local network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanDevice {
    /// The advertised host id.
    pub id: String,
    pub name: String,
    /// Datagram source IP plus the advertised listen port.
    pub address: SocketAddr,
    pub last_seen_at: chrono::DateTime<chrono::Utc>,
}

/// Outcome of one completed LAN session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanSpeedResult {
    pub id: Uuid,
    pub peer_name: String,
    pub download_speed_mbps: f64,
    pub upload_speed_mbps: f64,
    pub latency_ms: f64,
    /// Mean absolute difference of consecutive RTT samples.
    pub jitter_ms: Option<f64>,
    pub dropped_pings: u32,
    /// Download plus upload bytes.
    pub bytes_transferred: u64,
    /// Download plus upload phase time; connect and latency probing excluded.
    pub duration_seconds: f64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}
