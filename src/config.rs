//! TOML configuration for netgauge.
//!
//! A layered model with sensible defaults: the `NETGAUGE_CONFIG` environment
//! variable, then `/etc/netgauge/netgauge.toml`, then compiled-in defaults.
//! Every section is optional and falls back to its defaults field by field.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "NETGAUGE_CONFIG";

/// Standard system location of the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/netgauge/netgauge.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the netgauge process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub lan: LanConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try, in order: `$NETGAUGE_CONFIG`, the system path, compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "NETGAUGE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Cross-provider execution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Launch every provider at once.
    #[default]
    Concurrent,
    /// Run one provider at a time, in declaration order.
    Sequential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub mode: ExecutionMode,
    /// How long an adapter may take to honour cancellation before the
    /// coordinator abandons it and records `cancelled` itself.
    pub cancel_grace_ms: u64,
    /// Upper bound on one provider run. `0` disables the bound.
    pub run_timeout_sec: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Concurrent,
            cancel_grace_ms: 2_000,
            run_timeout_sec: 120,
        }
    }
}

impl CoordinatorConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_sec > 0).then(|| Duration::from_secs(self.run_timeout_sec))
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub apple: AppleConfig,
    pub cloudflare: CloudflareConfig,
    pub mlab: MlabConfig,
    pub ookla: OoklaConfig,
}

/// Apple `networkQuality` CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppleConfig {
    pub enabled: bool,
    pub path: String,
    /// Measure download and upload in parallel (the tool's default mode).
    pub parallel: bool,
    /// Typical run length, used to estimate progress since the tool prints
    /// nothing until it finishes.
    pub expected_duration_sec: u64,
    pub kill_grace_ms: u64,
}

impl Default for AppleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "networkQuality".to_string(),
            parallel: true,
            expected_duration_sec: 20,
            kill_grace_ms: 1_000,
        }
    }
}

/// Cloudflare speed test endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudflareConfig {
    pub enabled: bool,
    pub base_url: String,
    pub latency_samples: u32,
    pub download_bytes: u64,
    pub upload_bytes: u64,
    pub upload_chunk_bytes: usize,
    pub connect_timeout_ms: u64,
    pub request_timeout_sec: u64,
    pub report_interval_ms: u64,
}

impl Default for CloudflareConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://speed.cloudflare.com".to_string(),
            latency_samples: 10,
            download_bytes: 50_000_000,
            upload_bytes: 20_000_000,
            upload_chunk_bytes: 64 * 1024,
            connect_timeout_ms: 5_000,
            request_timeout_sec: 60,
            report_interval_ms: 100,
        }
    }
}

/// M-Lab NDT7 Go client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MlabConfig {
    pub enabled: bool,
    pub path: String,
    /// Optional explicit server (`-server`); empty uses the M-Lab locator.
    pub server: String,
    pub kill_grace_ms: u64,
}

impl Default for MlabConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "ndt7-client".to_string(),
            server: String::new(),
            kill_grace_ms: 1_000,
        }
    }
}

/// Ookla `speedtest` CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OoklaConfig {
    /// Off by default: the CLI's EULA restricts use to personal devices.
    pub enabled: bool,
    pub path: String,
    /// Optional server id (`--server-id`).
    pub server_id: Option<u32>,
    pub kill_grace_ms: u64,
}

impl Default for OoklaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "speedtest".to_string(),
            server_id: None,
            kill_grace_ms: 1_000,
        }
    }
}

// ---------------------------------------------------------------------------
// LAN
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LanConfig {
    pub server: LanServerConfig,
    pub discovery: DiscoveryConfig,
    pub test: LanTestConfig,
}

/// Server role of the LAN protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LanServerConfig {
    pub listen_address: String,
    /// Name advertised to peers. Empty uses `$HOSTNAME`.
    pub server_name: String,
    /// Hard cap on a phase duration a client may request.
    pub max_phase_duration_ms: u64,
    /// Hard cap on bytes per phase a client may request.
    pub max_phase_bytes: u64,
    /// A connection silent for this long is dropped.
    pub idle_timeout_ms: u64,
}

impl Default for LanServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:47078".to_string(),
            server_name: String::new(),
            max_phase_duration_ms: 30_000,
            max_phase_bytes: 4 * 1024 * 1024 * 1024,
            idle_timeout_ms: 10_000,
        }
    }
}

impl LanServerConfig {
    pub fn resolved_name(&self) -> String {
        if !self.server_name.is_empty() {
            return self.server_name.clone();
        }
        local_host_name()
    }
}

/// LAN peer advertisement and discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Multicast group (or, for tests, a unicast address) adverts go to.
    pub group: String,
    pub port: u16,
    pub advertise_interval_ms: u64,
    pub sweep_interval_ms: u64,
    pub stale_after_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: "239.255.77.77".to_string(),
            port: 47077,
            advertise_interval_ms: 3_000,
            sweep_interval_ms: 5_000,
            stale_after_ms: 10_000,
        }
    }
}

impl DiscoveryConfig {
    pub fn advertise_interval(&self) -> Duration {
        Duration::from_millis(self.advertise_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

/// Client side of a LAN speed session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LanTestConfig {
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub ping_count: u32,
    pub probe_timeout_ms: u64,
    pub phase_duration_ms: u64,
    pub max_phase_bytes: u64,
    pub chunk_size: usize,
    pub report_interval_ms: u64,
    pub speed_window_ms: u64,
    /// Extra time past the phase duration before a silent peer is a timeout.
    pub phase_slack_ms: u64,
}

impl Default for LanTestConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            handshake_timeout_ms: 5_000,
            ping_count: 10,
            probe_timeout_ms: 2_000,
            phase_duration_ms: 5_000,
            max_phase_bytes: 256 * 1024 * 1024,
            chunk_size: 64 * 1024,
            report_interval_ms: 100,
            speed_window_ms: 1_000,
            phase_slack_ms: 5_000,
        }
    }
}

impl LanTestConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn phase_duration(&self) -> Duration {
        Duration::from_millis(self.phase_duration_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn speed_window(&self) -> Duration {
        Duration::from_millis(self.speed_window_ms)
    }

    pub fn phase_slack(&self) -> Duration {
        Duration::from_millis(self.phase_slack_ms)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Best-effort host name without extra dependencies.
pub fn local_host_name() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    if let Ok(name) = std::fs::read_to_string("/etc/hostname") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    "netgauge".to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.coordinator.mode, ExecutionMode::Concurrent);
        assert_eq!(cfg.coordinator.cancel_grace(), Duration::from_secs(2));
        assert_eq!(cfg.coordinator.run_timeout(), Some(Duration::from_secs(120)));

        assert!(cfg.providers.apple.enabled);
        assert!(cfg.providers.apple.parallel);
        assert!(cfg.providers.cloudflare.enabled);
        assert!(cfg.providers.mlab.enabled);
        assert!(!cfg.providers.ookla.enabled);

        assert_eq!(cfg.lan.discovery.group, "239.255.77.77");
        assert_eq!(cfg.lan.discovery.advertise_interval(), Duration::from_secs(3));
        assert_eq!(cfg.lan.discovery.sweep_interval(), Duration::from_secs(5));
        assert_eq!(cfg.lan.discovery.stale_after(), Duration::from_secs(10));

        assert_eq!(cfg.lan.test.connect_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.lan.test.ping_count, 10);
        assert_eq!(cfg.lan.test.probe_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.lan.test.phase_duration(), Duration::from_secs(5));
        assert_eq!(cfg.lan.test.report_interval(), Duration::from_millis(100));

        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[coordinator]
mode = "sequential"
cancel_grace_ms = 1500
run_timeout_sec = 0

[providers.apple]
parallel = false

[providers.cloudflare]
base_url = "http://127.0.0.1:8080"
download_bytes = 1000000

[providers.ookla]
enabled = true
server_id = 4242

[lan.server]
listen_address = "127.0.0.1:6000"
server_name = "lab-pi"

[lan.discovery]
group = "127.0.0.1"
port = 6001

[lan.test]
ping_count = 4
probe_timeout_ms = 250

[logging]
level = "debug"
json = true
"#;

        let cfg: AppConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.coordinator.mode, ExecutionMode::Sequential);
        assert_eq!(cfg.coordinator.cancel_grace(), Duration::from_millis(1500));
        assert_eq!(cfg.coordinator.run_timeout(), None);
        assert!(!cfg.providers.apple.parallel);
        assert_eq!(cfg.providers.apple.path, "networkQuality");
        assert_eq!(cfg.providers.cloudflare.base_url, "http://127.0.0.1:8080");
        assert_eq!(cfg.providers.cloudflare.download_bytes, 1_000_000);
        assert!(cfg.providers.ookla.enabled);
        assert_eq!(cfg.providers.ookla.server_id, Some(4242));
        assert_eq!(cfg.lan.server.listen_address, "127.0.0.1:6000");
        assert_eq!(cfg.lan.server.resolved_name(), "lab-pi");
        assert_eq!(cfg.lan.discovery.group, "127.0.0.1");
        assert_eq!(cfg.lan.discovery.port, 6001);
        assert_eq!(cfg.lan.test.ping_count, 4);
        assert_eq!(cfg.lan.test.probe_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.lan.test.connect_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: AppConfig = toml::from_str("").unwrap();
        let defaults = AppConfig::default();

        assert_eq!(cfg.lan.server.listen_address, defaults.lan.server.listen_address);
        assert_eq!(cfg.providers.cloudflare.base_url, defaults.providers.cloudflare.base_url);
        assert_eq!(cfg.lan.test.max_phase_bytes, defaults.lan.test.max_phase_bytes);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("netgauge.toml");
        std::fs::write(
            &path,
            r#"
[lan.server]
listen_address = "0.0.0.0:9999"
"#,
        )
        .unwrap();

        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.lan.server.listen_address, "0.0.0.0:9999");
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = AppConfig::load(Path::new("/nonexistent/path/netgauge.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let cfg = AppConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let roundtripped: AppConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(cfg.lan.server.listen_address, roundtripped.lan.server.listen_address);
        assert_eq!(cfg.coordinator.mode, roundtripped.coordinator.mode);
        assert_eq!(cfg.lan.test.chunk_size, roundtripped.lan.test.chunk_size);
    }
}
