//! Human-readable one-line summaries of results.

use crate::lan::LanSpeedResult;
use crate::provider::SpeedTestResult;

/// `245.3 Mbps`, or `9.41 Gbps` from 1000 Mbps up.
pub fn format_speed(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else {
        format!("{:.1} Mbps", mbps)
    }
}

/// Format a provider result as a human-readable summary.
pub fn format_summary(result: &SpeedTestResult) -> String {
    if let Some(err) = &result.error {
        return format!("{}: failed ({})", result.provider, err);
    }

    let mut summary = format!(
        "{}: down {}, up {}",
        result.provider,
        format_speed(result.download_speed_mbps),
        format_speed(result.upload_speed_mbps),
    );

    if let Some(latency) = result.latency_ms {
        summary.push_str(&format!(", latency: {:.1}ms", latency));
    }
    if let Some(jitter) = result.jitter_ms {
        summary.push_str(&format!(", jitter: {:.2}ms", jitter));
    }
    if let Some(rpm) = result.responsiveness_rpm {
        summary.push_str(&format!(", responsiveness: {:.0} RPM", rpm));
    }
    if let Some(server) = &result.server_location {
        summary.push_str(&format!(" [{}]", server));
    }

    summary
}

pub fn format_lan_summary(result: &LanSpeedResult) -> String {
    let mut summary = format!(
        "LAN {}: down {}, up {}, latency: {:.2}ms",
        result.peer_name,
        format_speed(result.download_speed_mbps),
        format_speed(result.upload_speed_mbps),
        result.latency_ms,
    );
    if let Some(jitter) = result.jitter_ms {
        summary.push_str(&format!(", jitter: {:.2}ms", jitter));
    }
    if result.dropped_pings > 0 {
        summary.push_str(&format!(
            ", {} ping{} lost",
            result.dropped_pings,
            if result.dropped_pings == 1 { "" } else { "s" }
        ));
    }
    summary.push_str(&format!(
        " ({:.1} MB in {:.1}s)",
        result.bytes_transferred as f64 / 1_000_000.0,
        result.duration_seconds
    ));
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeasurementError;
    use crate::provider::Measurement;

    #[test]
    fn test_format_summary_gbps() {
        let result = SpeedTestResult::success(
            "Cloudflare",
            Measurement {
                download_mbps: 9412.0,
                upload_mbps: 880.5,
                latency_ms: Some(4.2),
                jitter_ms: Some(0.05),
                server_location: Some("AMS".into()),
                ..Measurement::default()
            },
        );
        let summary = format_summary(&result);
        assert!(summary.contains("down 9.41 Gbps"));
        assert!(summary.contains("up 880.5 Mbps"));
        assert!(summary.contains("jitter: 0.05ms"));
        assert!(summary.ends_with("[AMS]"));
    }

    #[test]
    fn test_format_summary_failure() {
        let result = SpeedTestResult::failure("Apple", &MeasurementError::Cancelled);
        assert_eq!(format_summary(&result), "Apple: failed (cancelled)");
    }

    #[test]
    fn test_format_lan_summary() {
        let result = LanSpeedResult {
            id: uuid::Uuid::new_v4(),
            peer_name: "studio".into(),
            download_speed_mbps: 941.0,
            upload_speed_mbps: 1200.0,
            latency_ms: 0.42,
            jitter_ms: None,
            dropped_pings: 1,
            bytes_transferred: 1_300_000_000,
            duration_seconds: 10.6,
            timestamp: chrono::Utc::now(),
        };
        let summary = format_lan_summary(&result);
        assert!(summary.contains("down 941.0 Mbps"));
        assert!(summary.contains("up 1.20 Gbps"));
        assert!(summary.contains("1 ping lost"));
        assert!(summary.contains("1300.0 MB in 10.6s"));
    }
}
