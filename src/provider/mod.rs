//! Speed test providers behind one uniform adapter contract.
//!
//! Each backend (a vendor CLI, an HTTP endpoint, a research measurement
//! protocol) implements [`ProviderAdapter::measure`]. The provided
//! [`ProviderAdapter::run`] folds the outcome into a [`SpeedTestResult`] so
//! that failures are always data, never a panic or error crossing into the
//! coordinator.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ProvidersConfig;
use crate::error::{ErrorKind, MeasurementError};
use crate::progress::{Phase, ProgressReporter};

pub mod cloudflare;
pub mod ndt7;
pub mod networkquality;
pub mod ookla;
pub mod process;

pub use cloudflare::CloudflareProvider;
pub use ndt7::Ndt7Provider;
pub use networkquality::NetworkQualityProvider;
pub use ookla::OoklaProvider;

/// How the provider talks to its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Wraps a vendor CLI and parses its output.
    Process,
    /// Drives HTTP endpoints directly.
    Http,
    /// Speaks (or wraps a client of) a research measurement protocol.
    ResearchProtocol,
}

/// Static description of a provider, defined once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    /// Whether the backend can measure download and upload simultaneously.
    pub supports_parallel_mode: bool,
    pub kind: ProviderKind,
    pub description: String,
}

/// Per-invocation knobs for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Measure download and upload at the same time. Ignored when the
    /// provider does not support parallel mode.
    pub parallel: bool,
}

/// Everything an adapter needs for one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub cancel: CancellationToken,
    pub progress: ProgressReporter,
    pub settings: ProviderSettings,
}

impl RunContext {
    pub fn new(cancel: CancellationToken, progress: ProgressReporter, settings: ProviderSettings) -> Self {
        Self {
            cancel,
            progress,
            settings,
        }
    }

    /// Context for running an adapter on its own, outside a coordinator.
    pub fn standalone(provider: &str) -> Self {
        Self::new(
            CancellationToken::new(),
            ProgressReporter::detached(provider),
            ProviderSettings::default(),
        )
    }

    /// Fail fast with [`MeasurementError::Cancelled`] if the run was cancelled.
    pub fn check_cancelled(&self) -> Result<(), MeasurementError> {
        if self.cancel.is_cancelled() {
            Err(MeasurementError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// What a successful adapter run measured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    /// Round-trips per minute, if the backend reports responsiveness.
    pub responsiveness_rpm: Option<f64>,
    pub server_location: Option<String>,
    /// Provider-native detail, kept verbatim for consumers.
    pub raw: Option<serde_json::Value>,
}

/// Normalized, immutable result of one adapter run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedTestResult {
    pub id: Uuid,
    pub provider: String,
    pub download_speed_mbps: f64,
    pub upload_speed_mbps: f64,
    pub latency_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub responsiveness_rpm: Option<f64>,
    pub server_location: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub raw: Option<serde_json::Value>,
}

impl SpeedTestResult {
    pub fn success(provider: impl Into<String>, m: Measurement) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider: provider.into(),
            download_speed_mbps: m.download_mbps,
            upload_speed_mbps: m.upload_mbps,
            latency_ms: m.latency_ms,
            jitter_ms: m.jitter_ms,
            responsiveness_rpm: m.responsiveness_rpm,
            server_location: m.server_location,
            timestamp: chrono::Utc::now(),
            error: None,
            error_kind: None,
            raw: m.raw,
        }
    }

    pub fn failure(provider: impl Into<String>, err: &MeasurementError) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider: provider.into(),
            download_speed_mbps: 0.0,
            upload_speed_mbps: 0.0,
            latency_ms: None,
            jitter_ms: None,
            responsiveness_rpm: None,
            server_location: None,
            timestamp: chrono::Utc::now(),
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
            raw: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_cancelled(&self) -> bool {
        self.error_kind == Some(ErrorKind::Cancelled)
    }
}

/// Uniform contract every speed test backend implements.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Static metadata about the provider.
    fn descriptor(&self) -> ProviderDescriptor;

    /// Check if the provider's CLI/dependency is available.
    fn is_available(&self) -> bool {
        true
    }

    /// Perform the measurement.
    ///
    /// Implementations must observe `ctx.cancel` at every blocking point and
    /// return [`MeasurementError::Cancelled`] within the grace period.
    async fn measure(&self, ctx: &RunContext) -> Result<Measurement, MeasurementError>;

    /// Run the adapter and fold the outcome into a result record. Never fails.
    async fn run(&self, ctx: &RunContext) -> SpeedTestResult {
        let name = self.descriptor().name;
        let outcome = match ctx.check_cancelled() {
            Ok(()) => self.measure(ctx).await,
            Err(e) => Err(e),
        };
        // A late success after cancellation is still a partial run.
        let outcome = match outcome {
            Ok(_) if ctx.cancel.is_cancelled() => Err(MeasurementError::Cancelled),
            other => other,
        };

        match outcome {
            Ok(m) => {
                tracing::info!(
                    provider = %name,
                    download_mbps = m.download_mbps,
                    upload_mbps = m.upload_mbps,
                    latency_ms = ?m.latency_ms,
                    "provider run complete"
                );
                ctx.progress.report(Phase::Complete, 1.0, None, None);
                SpeedTestResult::success(name, m)
            }
            Err(e) => {
                if e.is_cancelled() {
                    tracing::info!(provider = %name, "provider run cancelled");
                } else {
                    tracing::warn!(provider = %name, kind = %e.kind(), error = %e, "provider run failed");
                }
                ctx.progress.report(Phase::Failed, 1.0, None, None);
                SpeedTestResult::failure(name, &e)
            }
        }
    }
}

/// Build every provider enabled in the configuration, in declaration order.
pub fn get_all_providers(config: &ProvidersConfig) -> Vec<std::sync::Arc<dyn ProviderAdapter>> {
    let mut providers: Vec<std::sync::Arc<dyn ProviderAdapter>> = Vec::new();
    if config.apple.enabled {
        providers.push(std::sync::Arc::new(NetworkQualityProvider::new(config.apple.clone())));
    }
    if config.cloudflare.enabled {
        providers.push(std::sync::Arc::new(CloudflareProvider::new(config.cloudflare.clone())));
    }
    if config.mlab.enabled {
        providers.push(std::sync::Arc::new(Ndt7Provider::new(config.mlab.clone())));
    }
    if config.ookla.enabled {
        providers.push(std::sync::Arc::new(OoklaProvider::new(config.ookla.clone())));
    }
    providers
}

/// Invocation settings for `provider` as configured. Unknown names get defaults.
pub fn settings_for(config: &ProvidersConfig, provider: &str) -> ProviderSettings {
    match provider {
        "Apple" => ProviderSettings {
            parallel: config.apple.parallel,
        },
        _ => ProviderSettings::default(),
    }
}

/// Whether `binary` can be spawned (resolved through `$PATH` when bare).
pub(crate) fn binary_available(binary: &str, probe_arg: &str) -> bool {
    std::process::Command::new(binary)
        .arg(probe_arg)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok()
}
