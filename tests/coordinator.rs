//! Coordinator behaviour across several providers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use netgauge::config::{AppleConfig, CoordinatorConfig, ExecutionMode};
use netgauge::error::ErrorKind;
use netgauge::provider::{
    Measurement, NetworkQualityProvider, ProviderAdapter, ProviderDescriptor, ProviderKind, RunContext,
};
use netgauge::{CoordinatorError, MeasurementError, MultiServerCoordinator};

/// Sleeps for `delay` (or until cancelled) and then reports fixed speeds.
struct FakeProvider {
    name: &'static str,
    download: f64,
    delay: Duration,
}

#[async_trait::async_trait]
impl ProviderAdapter for FakeProvider {
    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            name: self.name.to_string(),
            supports_parallel_mode: false,
            kind: ProviderKind::Http,
            description: "fake".to_string(),
        }
    }

    async fn measure(&self, ctx: &RunContext) -> Result<Measurement, MeasurementError> {
        ctx.progress.download(0.1, self.download);
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(MeasurementError::Cancelled),
            _ = tokio::time::sleep(self.delay) => Ok(Measurement {
                download_mbps: self.download,
                upload_mbps: self.download / 10.0,
                latency_ms: Some(12.0),
                ..Measurement::default()
            }),
        }
    }
}

fn fake(name: &'static str, download: f64, delay_ms: u64) -> Arc<dyn ProviderAdapter> {
    Arc::new(FakeProvider {
        name,
        download,
        delay: Duration::from_millis(delay_ms),
    })
}

#[cfg(unix)]
fn failing_apple() -> Arc<dyn ProviderAdapter> {
    Arc::new(NetworkQualityProvider::new(AppleConfig {
        path: "false".to_string(),
        ..AppleConfig::default()
    }))
}

#[tokio::test]
async fn test_run_all_yields_one_result_per_provider() {
    let coordinator = MultiServerCoordinator::new(
        vec![fake("A", 100.0, 10), fake("B", 200.0, 20), fake("C", 300.0, 5)],
        CoordinatorConfig::default(),
    );
    let results = coordinator.run_all().await.unwrap();

    assert_eq!(results.len(), 3);
    for r in &results {
        assert_eq!(r.is_success(), r.error.is_none());
    }
    assert!(!coordinator.is_running().await);
    assert_eq!(coordinator.results().await, results);
}

#[cfg(unix)]
#[tokio::test]
async fn test_one_failure_does_not_abort_the_others() {
    let coordinator = MultiServerCoordinator::new(
        vec![failing_apple(), fake("Cloudflare", 200.0, 20), fake("M-Lab", 150.0, 30)],
        CoordinatorConfig::default(),
    );
    let results = coordinator.run_all().await.unwrap();
    assert_eq!(results.len(), 3);

    let by_name = |name: &str| results.iter().find(|r| r.provider == name).unwrap().clone();
    let apple = by_name("Apple");
    assert!(!apple.is_success());
    assert_eq!(apple.error_kind, Some(ErrorKind::BackendFailure));
    assert_eq!(by_name("Cloudflare").download_speed_mbps, 200.0);
    assert_eq!(by_name("M-Lab").download_speed_mbps, 150.0);
}

#[tokio::test]
async fn test_stop_all_cancels_unfinished_providers_only() {
    let coordinator = Arc::new(MultiServerCoordinator::new(
        vec![fake("quick", 50.0, 10), fake("slow-1", 1.0, 30_000), fake("slow-2", 1.0, 30_000)],
        CoordinatorConfig::default(),
    ));

    let runner = Arc::clone(&coordinator);
    let handle = tokio::spawn(async move { runner.run_all().await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(coordinator.is_running().await);

    let stopped_at = Instant::now();
    coordinator.stop_all().await;
    coordinator.stop_all().await;
    let results = handle.await.unwrap().unwrap();

    assert!(stopped_at.elapsed() < Duration::from_secs(2));
    assert_eq!(results.len(), 3);
    let quick = results.iter().find(|r| r.provider == "quick").unwrap();
    assert!(quick.is_success());
    for r in results.iter().filter(|r| r.provider.starts_with("slow")) {
        assert_eq!(r.error.as_deref(), Some("cancelled"));
        assert_eq!(r.download_speed_mbps, 0.0);
    }
    assert!(!coordinator.is_running().await);
}

#[cfg(unix)]
#[tokio::test]
async fn test_stop_all_terminates_subprocess_provider() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("networkQuality");
    std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let apple: Arc<dyn ProviderAdapter> = Arc::new(NetworkQualityProvider::new(AppleConfig {
        path: script.display().to_string(),
        kill_grace_ms: 500,
        ..AppleConfig::default()
    }));
    let coordinator = Arc::new(MultiServerCoordinator::new(vec![apple], CoordinatorConfig::default()));

    let runner = Arc::clone(&coordinator);
    let handle = tokio::spawn(async move { runner.run_all().await });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stopped_at = Instant::now();
    coordinator.stop_all().await;
    let results = handle.await.unwrap().unwrap();

    assert!(stopped_at.elapsed() < Duration::from_secs(3));
    assert!(results[0].is_cancelled());
}

#[tokio::test]
async fn test_sequential_mode_runs_one_at_a_time() {
    let coordinator = Arc::new(
        MultiServerCoordinator::new(
            vec![fake("first", 10.0, 150), fake("second", 20.0, 150)],
            CoordinatorConfig::default(),
        )
        .with_mode(ExecutionMode::Sequential),
    );

    let runner = Arc::clone(&coordinator);
    let handle = tokio::spawn(async move { runner.run_all().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(coordinator.current_provider().await.as_deref(), Some("first"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(coordinator.current_provider().await.as_deref(), Some("second"));

    let results = handle.await.unwrap().unwrap();
    let order: Vec<_> = results.iter().map(|r| r.provider.as_str()).collect();
    assert_eq!(order, vec!["first", "second"]);
    assert_eq!(coordinator.current_provider().await, None);
}

#[tokio::test]
async fn test_run_single_overwrites_in_place() {
    let coordinator = MultiServerCoordinator::new(
        vec![fake("A", 100.0, 5), fake("B", 200.0, 50)],
        CoordinatorConfig::default(),
    );
    let first = coordinator.run_all().await.unwrap();
    let old_b = first.iter().find(|r| r.provider == "B").unwrap().clone();

    let retest = coordinator.run_single("B").await.unwrap();
    assert_ne!(retest.id, old_b.id);

    let results = coordinator.results().await;
    assert_eq!(results.len(), 2);
    let order: Vec<_> = results.iter().map(|r| r.provider.as_str()).collect();
    let first_order: Vec<_> = first.iter().map(|r| r.provider.as_str()).collect();
    assert_eq!(order, first_order);
    assert_eq!(results.iter().find(|r| r.provider == "B").unwrap().id, retest.id);
}

#[tokio::test]
async fn test_run_single_unknown_provider() {
    let coordinator = MultiServerCoordinator::new(vec![fake("A", 1.0, 1)], CoordinatorConfig::default());
    let err = coordinator.run_single("Nope").await.unwrap_err();
    assert_eq!(err, CoordinatorError::UnknownProvider("Nope".to_string()));
}

#[tokio::test]
async fn test_second_run_while_running_is_rejected() {
    let coordinator = Arc::new(MultiServerCoordinator::new(
        vec![fake("A", 1.0, 300)],
        CoordinatorConfig::default(),
    ));
    let runner = Arc::clone(&coordinator);
    let handle = tokio::spawn(async move { runner.run_all().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(coordinator.run_all().await.unwrap_err(), CoordinatorError::AlreadyRunning);
    assert_eq!(coordinator.run_single("A").await.unwrap_err(), CoordinatorError::AlreadyRunning);
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_final_event_carries_results() {
    let coordinator =
        MultiServerCoordinator::new(vec![fake("A", 42.0, 5)], CoordinatorConfig::default());
    let mut events = coordinator.subscribe();
    coordinator.run_all().await.unwrap();

    let mut final_results = None;
    while let Ok(event) = events.try_recv() {
        if let netgauge::MeasurementEvent::Final {
            results: netgauge::events::FinalResults::Providers(r),
            ..
        } = event
        {
            final_results = Some(r);
        }
    }
    let results = final_results.expect("final event published");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].download_speed_mbps, 42.0);
}
