use std::time::Duration;

use super::process::run_streaming;
use super::{Measurement, ProviderAdapter, ProviderDescriptor, ProviderKind, RunContext};
use crate::config::MlabConfig;
use crate::error::MeasurementError;
use crate::meter;
use crate::progress::{Phase, ProgressReporter};

/// ndt7 runs each direction for roughly ten seconds.
const NDT7_PHASE_SECS: f64 = 10.0;

/// M-Lab NDT7 via the reference Go client (`ndt7-client -format=json`).
///
/// Open methodology, best for diagnosing congestion. Progress comes from the
/// client's per-interval `measurement` events; the figures come from its
/// closing summary document.
pub struct Ndt7Provider {
    config: MlabConfig,
}

impl Ndt7Provider {
    pub fn new(config: MlabConfig) -> Self {
        Self { config }
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec!["-format=json".to_string()];
        if !self.config.server.is_empty() {
            args.push(format!("-server={}", self.config.server));
        }
        args
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for Ndt7Provider {
    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            name: "M-Lab".to_string(),
            supports_parallel_mode: false,
            kind: ProviderKind::ResearchProtocol,
            description: "M-Lab NDT7: open measurement methodology, real throughput under congestion."
                .to_string(),
        }
    }

    fn is_available(&self) -> bool {
        super::binary_available(&self.config.path, "-help")
    }

    async fn measure(&self, ctx: &RunContext) -> Result<Measurement, MeasurementError> {
        ctx.progress.phase(Phase::Connecting);

        let mut stream = EventStream::default();
        let progress = ctx.progress.clone();
        let grace = Duration::from_millis(self.config.kill_grace_ms);

        run_streaming(&self.config.path, &self.args(), &ctx.cancel, grace, |line| {
            stream.feed(line, &progress)
        })
        .await?;

        stream.finish()
    }
}

/// Incremental parser for the client's JSON event stream.
#[derive(Debug, Default)]
struct EventStream {
    summary: Option<serde_json::Value>,
    server: Option<String>,
    error: Option<String>,
}

impl EventStream {
    fn feed(&mut self, line: &str, progress: &ProgressReporter) {
        let Ok(json) = serde_json::from_str::<serde_json::Value>(line.trim()) else {
            return;
        };

        let Some(key) = json.get("Key").and_then(|v| v.as_str()) else {
            // The closing summary is the only document without a Key.
            if json.get("Download").is_some() || json.get("Upload").is_some() {
                self.summary = Some(json);
            }
            return;
        };
        let value = json.get("Value");
        let test = value
            .and_then(|v| v.get("Test"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let phase = match test {
            "download" => Phase::Download,
            "upload" => Phase::Upload,
            _ => return,
        };

        match key {
            "starting" => progress.report(phase, 0.0, None, None),
            "connected" => {
                if let Some(server) = value.and_then(|v| v.get("Server")).and_then(|v| v.as_str()) {
                    self.server.get_or_insert_with(|| server.to_string());
                }
            }
            "measurement" => {
                let Some(app) = value.and_then(|v| v.get("AppInfo")) else { return };
                let bytes = app.get("NumBytes").and_then(|v| v.as_u64()).unwrap_or(0);
                let elapsed_us = app.get("ElapsedTime").and_then(|v| v.as_u64()).unwrap_or(0);
                let elapsed = Duration::from_micros(elapsed_us);
                let mbps = meter::mbps(bytes, elapsed);
                let frac = elapsed.as_secs_f64() / NDT7_PHASE_SECS;
                match phase {
                    Phase::Download => progress.download(frac, mbps),
                    _ => progress.upload(frac, mbps),
                }
            }
            "error" => {
                let msg = value
                    .and_then(|v| v.get("Failure"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown failure");
                self.error = Some(format!("{} test failed: {}", test, msg));
            }
            _ => {}
        }
    }

    fn finish(self) -> Result<Measurement, MeasurementError> {
        if let Some(err) = self.error {
            return Err(MeasurementError::backend(err));
        }
        let summary = self
            .summary
            .ok_or_else(|| MeasurementError::backend("ndt7-client produced no summary"))?;
        let mut m = parse_summary(summary)?;
        if m.server_location.is_none() {
            m.server_location = self.server;
        }
        Ok(m)
    }
}

/// Parse the closing summary. Throughput is in Mbit/s, latency in ms.
pub fn parse_summary(json: serde_json::Value) -> Result<Measurement, MeasurementError> {
    let value = |dir: &str, metric: &str| -> Option<f64> {
        json.get(dir)?.get(metric)?.get("Value")?.as_f64()
    };

    let dl = value("Download", "Throughput");
    let ul = value("Upload", "Throughput");
    let (Some(dl), Some(ul)) = (dl, ul) else {
        return Err(MeasurementError::backend(
            "ndt7 summary missing download/upload throughput",
        ));
    };
    let latency = value("Download", "Latency");
    let server = json
        .get("ServerFQDN")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(Measurement {
        download_mbps: dl,
        upload_mbps: ul,
        latency_ms: latency,
        jitter_ms: None,
        responsiveness_rpm: None,
        server_location: server,
        raw: Some(json),
    })
}
