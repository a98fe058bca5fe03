use std::time::Duration;

use super::process::run_streaming;
use super::{Measurement, ProviderAdapter, ProviderDescriptor, ProviderKind, RunContext};
use crate::config::OoklaConfig;
use crate::error::MeasurementError;
use crate::progress::{Phase, ProgressReporter};

/// Speedtest.net (Ookla) official CLI.
///
/// Personal non-commercial use only per the vendor EULA, so the provider is
/// disabled unless configured. Runs with `--format=jsonl --progress=yes` and
/// turns each progress line into a live update.
pub struct OoklaProvider {
    config: OoklaConfig,
}

impl OoklaProvider {
    pub fn new(config: OoklaConfig) -> Self {
        Self { config }
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--format=jsonl".to_string(),
            "--progress=yes".to_string(),
            "--accept-license".to_string(),
            "--accept-gdpr".to_string(),
        ];
        if let Some(id) = self.config.server_id {
            args.push(format!("--server-id={}", id));
        }
        args
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for OoklaProvider {
    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            name: "Ookla".to_string(),
            supports_parallel_mode: false,
            kind: ProviderKind::Process,
            description: "Speedtest.net official CLI. Best for comparing against ISP marketing claims."
                .to_string(),
        }
    }

    fn is_available(&self) -> bool {
        super::binary_available(&self.config.path, "--version")
    }

    async fn measure(&self, ctx: &RunContext) -> Result<Measurement, MeasurementError> {
        ctx.progress.phase(Phase::Connecting);

        let mut parser = LineParser::default();
        let progress = ctx.progress.clone();
        let grace = Duration::from_millis(self.config.kill_grace_ms);

        run_streaming(&self.config.path, &self.args(), &ctx.cancel, grace, |line| {
            parser.feed(line, &progress)
        })
        .await?;

        parser.finish()
    }
}

/// Incremental parser for the `jsonl` stream.
#[derive(Debug, Default)]
struct LineParser {
    result: Option<serde_json::Value>,
    error: Option<String>,
}

impl LineParser {
    fn feed(&mut self, line: &str, progress: &ProgressReporter) {
        let Ok(json) = serde_json::from_str::<serde_json::Value>(line.trim()) else {
            return;
        };
        match json.get("type").and_then(|v| v.as_str()) {
            Some("testStart") => progress.phase(Phase::Connecting),
            Some("ping") => {
                let frac = field(&json, "ping", "progress").unwrap_or(0.0);
                progress.report(Phase::Latency, frac, None, None);
            }
            Some("download") => {
                let frac = field(&json, "download", "progress").unwrap_or(0.0);
                let mbps = field(&json, "download", "bandwidth").map(bytes_per_sec_to_mbps);
                progress.download(frac, mbps.unwrap_or(0.0));
            }
            Some("upload") => {
                let frac = field(&json, "upload", "progress").unwrap_or(0.0);
                let mbps = field(&json, "upload", "bandwidth").map(bytes_per_sec_to_mbps);
                progress.upload(frac, mbps.unwrap_or(0.0));
            }
            Some("result") => self.result = Some(json),
            Some("log") => {
                if json.get("level").and_then(|v| v.as_str()) == Some("error") {
                    let msg = json
                        .get("message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error");
                    self.error = Some(msg.to_string());
                }
            }
            _ => {}
        }
    }

    fn finish(self) -> Result<Measurement, MeasurementError> {
        if let Some(err) = self.error {
            return Err(MeasurementError::backend(format!("speedtest: {}", err)));
        }
        let json = self
            .result
            .ok_or_else(|| MeasurementError::backend("speedtest produced no result line"))?;
        parse_result(json)
    }
}

/// Parse the final `"type":"result"` document.
///
/// Bandwidth is reported in bytes per second; latency and jitter in ms.
pub fn parse_result(json: serde_json::Value) -> Result<Measurement, MeasurementError> {
    let dl = field(&json, "download", "bandwidth");
    let ul = field(&json, "upload", "bandwidth");
    let (Some(dl), Some(ul)) = (dl, ul) else {
        return Err(MeasurementError::backend(
            "speedtest result missing download/upload bandwidth",
        ));
    };

    let server = json.get("server").map(|s| {
        let name = s.get("name").and_then(|v| v.as_str()).unwrap_or_default();
        let location = s.get("location").and_then(|v| v.as_str()).unwrap_or_default();
        match (name.is_empty(), location.is_empty()) {
            (false, false) => format!("{} ({})", name, location),
            (false, true) => name.to_string(),
            _ => location.to_string(),
        }
    });

    Ok(Measurement {
        download_mbps: bytes_per_sec_to_mbps(dl),
        upload_mbps: bytes_per_sec_to_mbps(ul),
        latency_ms: field(&json, "ping", "latency"),
        jitter_ms: field(&json, "ping", "jitter"),
        responsiveness_rpm: None,
        server_location: server.filter(|s| !s.is_empty()),
        raw: Some(json),
    })
}

fn field(json: &serde_json::Value, section: &str, key: &str) -> Option<f64> {
    json.get(section)?.get(key)?.as_f64()
}

fn bytes_per_sec_to_mbps(bandwidth: f64) -> f64 {
    bandwidth * 8.0 / 1_000_000.0
}
