use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Measurement, ProviderAdapter, ProviderDescriptor, ProviderKind, RunContext};
use crate::config::CloudflareConfig;
use crate::error::MeasurementError;
use crate::meter::{self, ThroughputMeter};
use crate::progress::Phase;

/// HTTP client carrying the configured timeouts. A builder failure is
/// logged and replaced by a default client.
fn build_client(config: &CloudflareConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .timeout(Duration::from_secs(config.request_timeout_sec))
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "failed to build HTTP client, falling back to one without timeouts");
            reqwest::Client::new()
        })
}

/// Cloudflare's speed test endpoints, driven directly over HTTP.
///
/// Latency is the median of small `__down?bytes=0` requests with the edge's
/// own processing time (`server-timing`) subtracted; throughput comes from
/// one streamed download and one streamed upload of configured size.
pub struct CloudflareProvider {
    config: CloudflareConfig,
    client: reqwest::Client,
}

impl CloudflareProvider {
    pub fn new(config: CloudflareConfig) -> Self {
        let client = build_client(&config);
        Self { config, client }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn measure_latency(
        &self,
        ctx: &RunContext,
    ) -> Result<(Vec<f64>, Option<String>), MeasurementError> {
        let n = self.config.latency_samples.max(1);
        let url = self.url("__down?bytes=0");
        let mut samples = Vec::with_capacity(n as usize);
        let mut location = None;
        let mut last_err = None;

        for i in 0..n {
            let started = Instant::now();
            let resp = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(MeasurementError::Cancelled),
                r = self.client.get(&url).send() => r,
            };
            let rtt_ms = started.elapsed().as_secs_f64() * 1000.0;

            match resp {
                Ok(resp) if resp.status().is_success() => {
                    let server_ms = server_timing_ms(resp.headers()).unwrap_or(0.0);
                    if location.is_none() {
                        location = colo(resp.headers());
                    }
                    samples.push((rtt_ms - server_ms).max(0.0));
                }
                Ok(resp) => {
                    last_err = Some(MeasurementError::backend(format!(
                        "latency probe returned HTTP {}",
                        resp.status()
                    )));
                }
                Err(e) => last_err = Some(classify(e)),
            }
            ctx.progress
                .report(Phase::Latency, (i + 1) as f64 / n as f64, None, None);
        }

        if samples.is_empty() {
            return Err(last_err.unwrap_or_else(|| MeasurementError::unreachable("no latency samples")));
        }
        Ok((samples, location))
    }

    async fn measure_download(&self, ctx: &RunContext) -> Result<f64, MeasurementError> {
        let target = self.config.download_bytes.max(1);
        let url = self.url(&format!("__down?bytes={}", target));
        ctx.progress.report(Phase::Download, 0.0, Some(0.0), None);

        let started = Instant::now();
        let resp = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(MeasurementError::Cancelled),
            r = self.client.get(&url).send() => r.map_err(classify)?,
        };
        if !resp.status().is_success() {
            return Err(MeasurementError::backend(format!(
                "download returned HTTP {}",
                resp.status()
            )));
        }

        let report_every = Duration::from_millis(self.config.report_interval_ms);
        let mut meter = ThroughputMeter::starting_at(started, Duration::from_secs(1));
        let mut last_report = Instant::now();
        let mut stream = resp.bytes_stream();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(MeasurementError::Cancelled),
                c = stream.next() => c,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(classify)?;
            meter.record(chunk.len() as u64);

            if last_report.elapsed() >= report_every {
                let frac = meter.total_bytes() as f64 / target as f64;
                ctx.progress.download(frac, meter.current_mbps());
                last_report = Instant::now();
            }
        }

        let mbps = meter::mbps(meter.total_bytes(), started.elapsed());
        ctx.progress.download(1.0, mbps);
        debug!(bytes = meter.total_bytes(), mbps, "cloudflare download finished");
        Ok(mbps)
    }

    async fn measure_upload(&self, ctx: &RunContext) -> Result<f64, MeasurementError> {
        let total = self.config.upload_bytes.max(1);
        let chunk_len = self.config.upload_chunk_bytes.max(1);
        let chunk = Bytes::from(vec![0u8; chunk_len]);
        let sent = Arc::new(AtomicU64::new(0));

        // Count bytes as reqwest pulls them off the body stream.
        let body_sent = Arc::clone(&sent);
        let body_stream = futures::stream::unfold(0u64, move |offset| {
            let chunk = chunk.clone();
            let body_sent = Arc::clone(&body_sent);
            async move {
                if offset >= total {
                    return None;
                }
                let len = (total - offset).min(chunk.len() as u64) as usize;
                body_sent.fetch_add(len as u64, Ordering::Relaxed);
                Some((Ok::<Bytes, std::io::Error>(chunk.slice(..len)), offset + len as u64))
            }
        });

        ctx.progress.report(Phase::Upload, 0.0, None, Some(0.0));
        let started = Instant::now();
        let request = self
            .client
            .post(self.url("__up"))
            .body(reqwest::Body::wrap_stream(body_stream))
            .send();
        tokio::pin!(request);

        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.report_interval_ms.max(1)));
        let mut meter = ThroughputMeter::starting_at(started, Duration::from_secs(1));
        let mut seen = 0u64;

        let resp = loop {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(MeasurementError::Cancelled),
                r = &mut request => break r.map_err(classify)?,
                _ = ticker.tick() => {
                    let now_sent = sent.load(Ordering::Relaxed);
                    meter.record(now_sent - seen);
                    seen = now_sent;
                    ctx.progress.upload(now_sent as f64 / total as f64, meter.current_mbps());
                }
            }
        };

        if !resp.status().is_success() {
            return Err(MeasurementError::backend(format!(
                "upload returned HTTP {}",
                resp.status()
            )));
        }

        let mbps = meter::mbps(sent.load(Ordering::Relaxed), started.elapsed());
        ctx.progress.upload(1.0, mbps);
        debug!(bytes = total, mbps, "cloudflare upload finished");
        Ok(mbps)
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for CloudflareProvider {
    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            name: "Cloudflare".to_string(),
            supports_parallel_mode: false,
            kind: ProviderKind::Http,
            description: "Cloudflare edge speed test over HTTPS.".to_string(),
        }
    }

    async fn measure(&self, ctx: &RunContext) -> Result<Measurement, MeasurementError> {
        ctx.progress.phase(Phase::Connecting);

        let (samples, location) = self.measure_latency(ctx).await?;
        let download = self.measure_download(ctx).await?;
        let upload = self.measure_upload(ctx).await?;

        Ok(Measurement {
            download_mbps: download,
            upload_mbps: upload,
            latency_ms: meter::median(&samples),
            jitter_ms: meter::jitter(&samples),
            responsiveness_rpm: None,
            server_location: location,
            raw: None,
        })
    }
}

fn classify(e: reqwest::Error) -> MeasurementError {
    if e.is_timeout() {
        MeasurementError::timeout(format!("request timed out: {}", e))
    } else if e.is_connect() {
        MeasurementError::unreachable(format!("connection failed: {}", e))
    } else {
        MeasurementError::backend(e.to_string())
    }
}

/// Edge processing time from `server-timing: cfRequestDuration;dur=12.3`.
fn server_timing_ms(headers: &reqwest::header::HeaderMap) -> Option<f64> {
    let value = headers.get("server-timing")?.to_str().ok()?;
    value
        .split([',', ';'])
        .map(str::trim)
        .find_map(|part| part.strip_prefix("dur="))
        .and_then(|v| v.parse::<f64>().ok())
}

/// Serving data-center code, from `cf-meta-colo` or the `cf-ray` suffix.
fn colo(headers: &reqwest::header::HeaderMap) -> Option<String> {
    if let Some(v) = headers.get("cf-meta-colo").and_then(|v| v.to_str().ok()) {
        return Some(v.to_string());
    }
    let ray = headers.get("cf-ray")?.to_str().ok()?;
    ray.rsplit_once('-').map(|(_, colo)| colo.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::Router;
    use reqwest::header::{HeaderMap as ReqHeaderMap, HeaderValue};
    use std::collections::HashMap;

    async fn down(Query(q): Query<HashMap<String, String>>) -> (HeaderMap, Vec<u8>) {
        let n: usize = q.get("bytes").and_then(|v| v.parse().ok()).unwrap_or(0);
        let mut headers = HeaderMap::new();
        headers.insert("cf-meta-colo", "LAB".parse().unwrap());
        headers.insert("server-timing", "cfRequestDuration;dur=0.5".parse().unwrap());
        (headers, vec![7u8; n])
    }

    async fn up(body: axum::body::Bytes) -> String {
        body.len().to_string()
    }

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn config(base_url: String) -> CloudflareConfig {
        CloudflareConfig {
            base_url,
            latency_samples: 3,
            download_bytes: 500_000,
            upload_bytes: 200_000,
            upload_chunk_bytes: 16 * 1024,
            ..CloudflareConfig::default()
        }
    }

    #[tokio::test]
    async fn test_full_run_against_local_endpoint() {
        let app = Router::new()
            .route("/__down", get(down))
            .route("/__up", post(up));
        let base = spawn(app).await;

        let provider = CloudflareProvider::new(config(base));
        let result = provider.run(&RunContext::standalone("Cloudflare")).await;

        assert!(result.is_success(), "error: {:?}", result.error);
        assert!(result.download_speed_mbps > 0.0);
        assert!(result.upload_speed_mbps > 0.0);
        assert!(result.latency_ms.is_some());
        assert_eq!(result.server_location.as_deref(), Some("LAB"));
    }

    #[tokio::test]
    async fn test_http_error_is_backend_failure() {
        let app = Router::new()
            .route("/__down", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        let base = spawn(app).await;

        let provider = CloudflareProvider::new(config(base));
        let result = provider.run(&RunContext::standalone("Cloudflare")).await;

        assert!(!result.is_success());
        assert_eq!(result.error_kind, Some(crate::error::ErrorKind::BackendFailure));
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider = CloudflareProvider::new(config(format!("http://{}", addr)));
        let result = provider.run(&RunContext::standalone("Cloudflare")).await;
        assert_eq!(result.error_kind, Some(crate::error::ErrorKind::Unreachable));
    }

    #[tokio::test]
    async fn test_configured_request_timeout_applies() {
        let stalled = || async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            StatusCode::OK
        };
        let base = spawn(Router::new().route("/__down", get(stalled))).await;
        let provider = CloudflareProvider::new(CloudflareConfig {
            latency_samples: 1,
            request_timeout_sec: 1,
            ..config(base)
        });

        let started = std::time::Instant::now();
        let result = provider.run(&RunContext::standalone("Cloudflare")).await;

        assert_eq!(result.error_kind, Some(crate::error::ErrorKind::Timeout));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_header_parsing() {
        let mut h = ReqHeaderMap::new();
        h.insert("server-timing", HeaderValue::from_static("cfRequestDuration;dur=12.5"));
        h.insert("cf-ray", HeaderValue::from_static("8a1b2c3d4e5f-AMS"));
        assert_eq!(server_timing_ms(&h), Some(12.5));
        assert_eq!(colo(&h).as_deref(), Some("AMS"));
    }
}
