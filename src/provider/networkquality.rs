use std::time::Duration;

use tokio::time::Instant;

use super::process::run_streaming;
use super::{Measurement, ProviderAdapter, ProviderDescriptor, ProviderKind, RunContext};
use crate::config::AppleConfig;
use crate::error::MeasurementError;
use crate::progress::Phase;

/// Apple's `networkQuality` tool (macOS 12+).
///
/// Runs `networkQuality -c` and parses the final JSON document. The tool prints
/// nothing while measuring, so progress is estimated from elapsed time against
/// the configured typical run length.
pub struct NetworkQualityProvider {
    config: AppleConfig,
}

impl NetworkQualityProvider {
    pub fn new(config: AppleConfig) -> Self {
        Self { config }
    }

    fn args(&self, parallel: bool) -> Vec<String> {
        let mut args = vec!["-c".to_string()];
        if !parallel {
            args.push("-s".to_string());
        }
        args
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for NetworkQualityProvider {
    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            name: "Apple".to_string(),
            supports_parallel_mode: true,
            kind: ProviderKind::Process,
            description: "Apple networkQuality: throughput plus responsiveness (RPM) under load."
                .to_string(),
        }
    }

    fn is_available(&self) -> bool {
        super::binary_available(&self.config.path, "-h")
    }

    async fn measure(&self, ctx: &RunContext) -> Result<Measurement, MeasurementError> {
        let parallel = ctx.settings.parallel;
        let args = self.args(parallel);
        ctx.progress.phase(Phase::Connecting);

        let expected = Duration::from_secs(self.config.expected_duration_sec.max(1));
        let grace = Duration::from_millis(self.config.kill_grace_ms);

        // Elapsed-time progress ticker, stopped as soon as the process returns.
        let ticker_stop = ctx.cancel.child_token();
        let ticker = {
            let stop = ticker_stop.clone();
            let progress = ctx.progress.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let mut interval = tokio::time::interval(Duration::from_millis(250));
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = interval.tick() => {
                            let frac = started.elapsed().as_secs_f64() / expected.as_secs_f64();
                            // Hold short of 1.0 until the real result lands.
                            let frac = frac.min(0.95);
                            if parallel {
                                progress.report(Phase::Parallel, frac, None, None);
                            } else if frac < 0.5 {
                                progress.report(Phase::Download, frac * 2.0, None, None);
                            } else {
                                progress.report(Phase::Upload, (frac - 0.5) * 2.0, None, None);
                            }
                        }
                    }
                }
            })
        };

        let outcome = run_streaming(&self.config.path, &args, &ctx.cancel, grace, |_| {}).await;
        ticker_stop.cancel();
        let _ = ticker.await;

        let output = outcome?;
        parse_output(&output.stdout)
    }
}

/// Parse the JSON document printed by `networkQuality -c`.
///
/// Throughput fields are in bits per second; `base_rtt` is in milliseconds.
pub fn parse_output(stdout: &str) -> Result<Measurement, MeasurementError> {
    let json: serde_json::Value = serde_json::from_str(stdout.trim())
        .map_err(|e| MeasurementError::backend(format!("malformed networkQuality output: {}", e)))?;

    if let Some(err) = json.get("error_code").and_then(|v| v.as_i64()) {
        return Err(MeasurementError::backend(format!(
            "networkQuality reported error code {}",
            err
        )));
    }

    let dl = json.get("dl_throughput").and_then(|v| v.as_f64());
    let ul = json.get("ul_throughput").and_then(|v| v.as_f64());
    let (Some(dl), Some(ul)) = (dl, ul) else {
        return Err(MeasurementError::backend(
            "networkQuality output missing dl_throughput/ul_throughput",
        ));
    };

    let rpm = json
        .get("responsiveness")
        .and_then(|v| v.as_f64())
        .or_else(|| json.get("dl_responsiveness").and_then(|v| v.as_f64()));
    let latency = json.get("base_rtt").and_then(|v| v.as_f64());
    let endpoint = json
        .get("test_endpoint")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    Ok(Measurement {
        download_mbps: dl / 1_000_000.0,
        upload_mbps: ul / 1_000_000.0,
        latency_ms: latency,
        jitter_ms: None,
        responsiveness_rpm: rpm,
        server_location: endpoint,
        raw: Some(json),
    })
}
