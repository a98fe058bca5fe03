//! Progress vocabulary shared by every backend and by LAN sessions.
//!
//! Adapters emit [`SpeedTestProgress`] through a [`ProgressReporter`]; LAN
//! sessions emit [`LanTestProgress`]. Both are transient snapshots that are
//! overwritten on each update and never persisted.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Phase of a provider run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Connecting,
    Latency,
    Download,
    Upload,
    /// Download and upload measured at the same time.
    Parallel,
    Complete,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Connecting => "connecting",
            Phase::Latency => "latency",
            Phase::Download => "download",
            Phase::Upload => "upload",
            Phase::Parallel => "parallel",
            Phase::Complete => "complete",
            Phase::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time progress of one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedTestProgress {
    pub provider: String,
    pub phase: Phase,
    /// Fraction of the current phase, in `[0, 1]`.
    pub progress_fraction: f64,
    pub current_download_speed_mbps: Option<f64>,
    pub current_upload_speed_mbps: Option<f64>,
}

impl SpeedTestProgress {
    pub fn idle(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            phase: Phase::Idle,
            progress_fraction: 0.0,
            current_download_speed_mbps: None,
            current_upload_speed_mbps: None,
        }
    }

    /// Merge `next` on top of `self`, keeping the fraction non-decreasing while
    /// the phase stays the same. A phase change may reset the fraction.
    pub fn advance(&self, next: SpeedTestProgress) -> SpeedTestProgress {
        let mut merged = next;
        merged.progress_fraction = clamp_fraction(merged.progress_fraction);
        if merged.phase == self.phase && merged.progress_fraction < self.progress_fraction {
            merged.progress_fraction = self.progress_fraction;
        }
        merged
    }
}

fn clamp_fraction(f: f64) -> f64 {
    if f.is_nan() {
        0.0
    } else {
        f.clamp(0.0, 1.0)
    }
}

/// The `onProgress` callback handed to a provider adapter.
///
/// Cloneable and callable from any task the adapter spawns. Updates are
/// funnelled over one channel to a single consumer, which owns the progress
/// map; a closed consumer silently drops updates.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    provider: String,
    tx: Option<mpsc::UnboundedSender<SpeedTestProgress>>,
}

impl ProgressReporter {
    pub fn new(provider: impl Into<String>, tx: mpsc::UnboundedSender<SpeedTestProgress>) -> Self {
        Self {
            provider: provider.into(),
            tx: Some(tx),
        }
    }

    /// A reporter with no consumer, for running an adapter standalone.
    pub fn detached(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            tx: None,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn report(
        &self,
        phase: Phase,
        fraction: f64,
        download_mbps: Option<f64>,
        upload_mbps: Option<f64>,
    ) {
        let Some(tx) = &self.tx else { return };
        let _ = tx.send(SpeedTestProgress {
            provider: self.provider.clone(),
            phase,
            progress_fraction: clamp_fraction(fraction),
            current_download_speed_mbps: download_mbps,
            current_upload_speed_mbps: upload_mbps,
        });
    }

    pub fn phase(&self, phase: Phase) {
        self.report(phase, 0.0, None, None);
    }

    pub fn download(&self, fraction: f64, mbps: f64) {
        self.report(Phase::Download, fraction, Some(mbps), None);
    }

    pub fn upload(&self, fraction: f64, mbps: f64) {
        self.report(Phase::Upload, fraction, None, Some(mbps));
    }
}

/// Phase of a LAN speed session (client view).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LanPhase {
    Idle,
    Connecting,
    MeasuringLatency,
    Download,
    Upload,
    Complete,
    Failed,
}

impl LanPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, LanPhase::Complete | LanPhase::Failed)
    }

    /// Whether the client state machine allows moving from `self` to `next`.
    pub fn can_transition(self, next: LanPhase) -> bool {
        use LanPhase::*;
        match (self, next) {
            (Complete, _) | (Failed, _) => false,
            (_, Failed) => true,
            (Idle, Connecting) => true,
            (Connecting, MeasuringLatency) => true,
            (MeasuringLatency, Download) => true,
            (Download, Upload) => true,
            (Upload, Complete) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for LanPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LanPhase::Idle => "idle",
            LanPhase::Connecting => "connecting",
            LanPhase::MeasuringLatency => "measuring_latency",
            LanPhase::Download => "download",
            LanPhase::Upload => "upload",
            LanPhase::Complete => "complete",
            LanPhase::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time progress of a LAN session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanTestProgress {
    pub phase: LanPhase,
    pub progress: f64,
    pub current_speed_mbps: Option<f64>,
    pub message: String,
}

impl LanTestProgress {
    pub fn idle() -> Self {
        Self {
            phase: LanPhase::Idle,
            progress: 0.0,
            current_speed_mbps: None,
            message: String::new(),
        }
    }

    pub fn new(phase: LanPhase, progress: f64, message: impl Into<String>) -> Self {
        Self {
            phase,
            progress: clamp_fraction(progress),
            current_speed_mbps: None,
            message: message.into(),
        }
    }

    pub fn with_speed(mut self, mbps: f64) -> Self {
        self.current_speed_mbps = Some(mbps);
        self
    }
}

impl Default for LanTestProgress {
    fn default() -> Self {
        Self::idle()
    }
}
