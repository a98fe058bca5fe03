//! Zero-configuration discovery of LAN speed peers over UDP multicast.
//!
//! A host in server mode sends an `advertise` datagram to the group every
//! few seconds and a single `withdraw` when it stops. Listeners keep a
//! [`DeviceRegistry`] keyed by host id and sweep out entries that have gone
//! quiet for longer than the staleness threshold.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{LanDevice, PROTOCOL_VERSION, SERVICE_NAME};
use crate::config::DiscoveryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    Advertise,
    Withdraw,
}

/// One discovery datagram, JSON encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryMessage {
    pub service: String,
    pub kind: DiscoveryKind,
    pub protocol_version: u32,
    pub host_id: String,
    pub host_name: String,
    pub listen_port: u16,
}

impl DiscoveryMessage {
    pub fn new(kind: DiscoveryKind, host_id: &str, host_name: &str, listen_port: u16) -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
            kind,
            protocol_version: PROTOCOL_VERSION,
            host_id: host_id.to_string(),
            host_name: host_name.to_string(),
            listen_port,
        }
    }

    /// Decode a datagram, returning `None` for anything that is not ours.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        let msg: Self = serde_json::from_slice(datagram).ok()?;
        if msg.service != SERVICE_NAME || msg.protocol_version != PROTOCOL_VERSION {
            return None;
        }
        if msg.host_id.is_empty() || msg.listen_port == 0 {
            return None;
        }
        Some(msg)
    }
}

/// What an update did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryChange {
    Added,
    /// Name or address changed.
    Updated,
    /// Only the last-seen time moved.
    Refreshed,
}

#[derive(Debug, Clone)]
struct Tracked {
    device: LanDevice,
    seen: Instant,
}

/// Known peers keyed by host id. Time is passed in explicitly.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, Tracked>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, id: &str, name: &str, address: SocketAddr, now: Instant) -> RegistryChange {
        let last_seen_at = chrono::Utc::now();
        match self.devices.get_mut(id) {
            Some(tracked) => {
                // Out-of-order datagrams must not move last-seen backwards.
                if now > tracked.seen {
                    tracked.seen = now;
                    tracked.device.last_seen_at = last_seen_at;
                }
                if tracked.device.name != name || tracked.device.address != address {
                    tracked.device.name = name.to_string();
                    tracked.device.address = address;
                    RegistryChange::Updated
                } else {
                    RegistryChange::Refreshed
                }
            }
            None => {
                self.devices.insert(
                    id.to_string(),
                    Tracked {
                        device: LanDevice {
                            id: id.to_string(),
                            name: name.to_string(),
                            address,
                            last_seen_at,
                        },
                        seen: now,
                    },
                );
                RegistryChange::Added
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<LanDevice> {
        self.devices.remove(id).map(|t| t.device)
    }

    /// Drop every device not seen within `stale_after` of `now`.
    pub fn prune(&mut self, now: Instant, stale_after: Duration) -> Vec<LanDevice> {
        let stale: Vec<String> = self
            .devices
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(t.seen) > stale_after)
            .map(|(id, _)| id.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.devices.remove(&id).map(|t| t.device))
            .collect()
    }

    /// Copy-out snapshot sorted by name, then id.
    pub fn snapshot(&self) -> Vec<LanDevice> {
        sorted(self.devices.values())
    }

    /// Like [`snapshot`](Self::snapshot), minus devices already past
    /// `stale_after` that the next sweep has not removed yet.
    pub fn live(&self, now: Instant, stale_after: Duration) -> Vec<LanDevice> {
        sorted(
            self.devices
                .values()
                .filter(|t| now.saturating_duration_since(t.seen) <= stale_after),
        )
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }
}

fn sorted<'a>(tracked: impl Iterator<Item = &'a Tracked>) -> Vec<LanDevice> {
    let mut devices: Vec<LanDevice> = tracked.map(|t| t.device.clone()).collect();
    devices.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    devices
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

/// Advertiser and listener for one host. Both halves toggle independently.
pub struct LanDiscovery {
    config: DiscoveryConfig,
    host_id: String,
    host_name: String,
    registry: Arc<RwLock<DeviceRegistry>>,
    listener: Mutex<Option<Worker>>,
    advertiser: Mutex<Option<Worker>>,
}

impl LanDiscovery {
    pub fn new(config: DiscoveryConfig, host_id: impl Into<String>, host_name: impl Into<String>) -> Self {
        Self {
            config,
            host_id: host_id.into(),
            host_name: host_name.into(),
            registry: Arc::new(RwLock::new(DeviceRegistry::new())),
            listener: Mutex::new(None),
            advertiser: Mutex::new(None),
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    fn group(&self) -> Result<Ipv4Addr> {
        self.config
            .group
            .parse()
            .with_context(|| format!("invalid discovery group address {}", self.config.group))
    }

    /// Start listening for advertisements. No-op if already listening.
    pub async fn start_discovery(&self) -> Result<()> {
        let mut slot = self.listener.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let group = self.group()?;
        let socket = bind_listener(group, self.config.port)
            .with_context(|| format!("failed to bind discovery socket on port {}", self.config.port))?;

        let cancel = CancellationToken::new();
        let ctx = ListenContext {
            socket,
            registry: Arc::clone(&self.registry),
            own_id: self.host_id.clone(),
            sweep_interval: self.config.sweep_interval(),
            stale_after: self.config.stale_after(),
        };
        let handle = tokio::spawn(listen_loop(ctx, cancel.clone()));
        info!(%group, port = self.config.port, "LAN discovery started");

        *slot = Some(Worker { cancel, handle });
        Ok(())
    }

    /// Stop listening and forget every known device.
    pub async fn stop_discovery(&self) {
        let worker = self.listener.lock().await.take();
        if let Some(worker) = worker {
            worker.stop().await;
            self.registry.write().await.clear();
            info!("LAN discovery stopped");
        }
    }

    /// Advertise this host's `listen_port` until [`stop_advertising`] is
    /// called. Restarts the advertiser if it is already running.
    ///
    /// [`stop_advertising`]: LanDiscovery::stop_advertising
    pub async fn start_advertising(&self, listen_port: u16) -> Result<()> {
        let mut slot = self.advertiser.lock().await;
        if let Some(previous) = slot.take() {
            previous.stop().await;
        }

        let group = self.group()?;
        let target = SocketAddr::new(IpAddr::V4(group), self.config.port);
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .context("failed to bind advertise socket")?;
        if group.is_multicast() {
            socket
                .set_multicast_ttl_v4(1)
                .context("failed to set multicast TTL")?;
            socket
                .set_multicast_loop_v4(true)
                .context("failed to enable multicast loopback")?;
        }

        let advertise = serde_json::to_vec(&DiscoveryMessage::new(
            DiscoveryKind::Advertise,
            &self.host_id,
            &self.host_name,
            listen_port,
        ))
        .context("failed to encode advertisement")?;
        let withdraw = serde_json::to_vec(&DiscoveryMessage::new(
            DiscoveryKind::Withdraw,
            &self.host_id,
            &self.host_name,
            listen_port,
        ))
        .context("failed to encode withdrawal")?;

        let cancel = CancellationToken::new();
        let interval = self.config.advertise_interval();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = socket.send_to(&advertise, target).await {
                            warn!(%target, error = %e, "failed to send advertisement");
                        }
                    }
                }
            }
            if let Err(e) = socket.send_to(&withdraw, target).await {
                debug!(%target, error = %e, "failed to send withdrawal");
            }
        });
        info!(%target, listen_port, "LAN advertising started");

        *slot = Some(Worker { cancel, handle });
        Ok(())
    }

    /// Stop advertising; peers are told with a final `withdraw`.
    pub async fn stop_advertising(&self) {
        let worker = self.advertiser.lock().await.take();
        if let Some(worker) = worker {
            worker.stop().await;
            info!("LAN advertising stopped");
        }
    }

    pub async fn is_discovering(&self) -> bool {
        self.listener.lock().await.is_some()
    }

    pub async fn is_advertising(&self) -> bool {
        self.advertiser.lock().await.is_some()
    }

    /// Snapshot of live devices, sorted by name.
    pub async fn devices(&self) -> Vec<LanDevice> {
        self.registry
            .read()
            .await
            .live(Instant::now(), self.config.stale_after())
    }

    pub async fn shutdown(&self) {
        self.stop_advertising().await;
        self.stop_discovery().await;
    }
}

struct ListenContext {
    socket: UdpSocket,
    registry: Arc<RwLock<DeviceRegistry>>,
    own_id: String,
    sweep_interval: Duration,
    stale_after: Duration,
}

async fn listen_loop(ctx: ListenContext, cancel: CancellationToken) {
    let mut buf = vec![0u8; 2048];
    let mut sweep = tokio::time::interval(ctx.sweep_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = ctx.socket.recv_from(&mut buf) => match received {
                Ok((n, src)) => handle_datagram(&ctx, &buf[..n], src).await,
                Err(e) => debug!(error = %e, "discovery recv failed"),
            },
            _ = sweep.tick() => {
                let removed = ctx.registry.write().await.prune(Instant::now(), ctx.stale_after);
                for device in removed {
                    info!(id = %device.id, name = %device.name, "LAN peer went stale");
                }
            }
        }
    }
}

async fn handle_datagram(ctx: &ListenContext, datagram: &[u8], src: SocketAddr) {
    let Some(msg) = DiscoveryMessage::parse(datagram) else {
        trace!(%src, len = datagram.len(), "ignoring foreign datagram");
        return;
    };
    if msg.host_id == ctx.own_id {
        return;
    }

    let mut registry = ctx.registry.write().await;
    match msg.kind {
        DiscoveryKind::Advertise => {
            let address = SocketAddr::new(src.ip(), msg.listen_port);
            match registry.upsert(&msg.host_id, &msg.host_name, address, Instant::now()) {
                RegistryChange::Added => {
                    info!(id = %msg.host_id, name = %msg.host_name, %address, "LAN peer discovered")
                }
                RegistryChange::Updated => {
                    debug!(id = %msg.host_id, name = %msg.host_name, %address, "LAN peer updated")
                }
                RegistryChange::Refreshed => {}
            }
        }
        DiscoveryKind::Withdraw => {
            if registry.remove(&msg.host_id).is_some() {
                info!(id = %msg.host_id, "LAN peer withdrew");
            }
        }
    }
}

/// Bind the listening socket. A multicast group is joined on all interfaces;
/// any other address is bound directly for unicast operation.
fn bind_listener(group: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    if group.is_multicast() {
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        let bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
        socket.bind(&bind.into())?;
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    } else {
        let bind: SocketAddr = (group, port).into();
        socket.bind(&bind.into())?;
    }

    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}
