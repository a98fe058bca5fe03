//! Runs provider adapters, concurrently or one at a time, under one shared
//! cancellation scope.
//!
//! Results are appended as adapters finish. Progress from every adapter is
//! funnelled through one channel into a single fan-in task, which owns the
//! per-provider progress map and republishes each update on the
//! [`EventBus`]. All accessors hand out copies.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AppConfig, CoordinatorConfig, ExecutionMode};
use crate::error::{CoordinatorError, CoordinatorResult, MeasurementError};
use crate::events::{EventBus, FinalResults, MeasurementEvent, ProgressUpdate};
use crate::progress::{Phase, ProgressReporter, SpeedTestProgress};
use crate::provider::{
    get_all_providers, settings_for, ProviderAdapter, ProviderDescriptor, ProviderSettings, RunContext,
    SpeedTestResult,
};

#[derive(Debug, Default)]
struct CoordinatorState {
    results: Vec<SpeedTestResult>,
    progress: HashMap<String, SpeedTestProgress>,
    is_running: bool,
    current_provider: Option<String>,
    cancel: CancellationToken,
}

struct Entry {
    adapter: Arc<dyn ProviderAdapter>,
    descriptor: ProviderDescriptor,
    settings: ProviderSettings,
}

pub struct MultiServerCoordinator {
    entries: Vec<Entry>,
    config: CoordinatorConfig,
    state: Arc<RwLock<CoordinatorState>>,
    events: EventBus,
}

impl MultiServerCoordinator {
    pub fn new(adapters: Vec<Arc<dyn ProviderAdapter>>, config: CoordinatorConfig) -> Self {
        let entries = adapters
            .into_iter()
            .map(|adapter| Entry {
                descriptor: adapter.descriptor(),
                adapter,
                settings: ProviderSettings::default(),
            })
            .collect();

        Self {
            entries,
            config,
            state: Arc::new(RwLock::new(CoordinatorState::default())),
            events: EventBus::default(),
        }
    }

    /// Every enabled provider from `config`, with its configured settings.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut coordinator = Self::new(get_all_providers(&config.providers), config.coordinator.clone());
        for entry in &mut coordinator.entries {
            entry.settings = settings_for(&config.providers, &entry.descriptor.name);
        }
        coordinator
    }

    /// Override the invocation settings of one provider.
    pub fn with_settings(mut self, provider: &str, settings: ProviderSettings) -> Self {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.descriptor.name == provider) {
            entry.settings = settings;
        }
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn providers(&self) -> Vec<ProviderDescriptor> {
        self.entries.iter().map(|e| e.descriptor.clone()).collect()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<MeasurementEvent> {
        self.events.subscribe()
    }

    pub async fn results(&self) -> Vec<SpeedTestResult> {
        self.state.read().await.results.clone()
    }

    pub async fn progress(&self) -> HashMap<String, SpeedTestProgress> {
        self.state.read().await.progress.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.state.read().await.is_running
    }

    pub async fn current_provider(&self) -> Option<String> {
        self.state.read().await.current_provider.clone()
    }

    /// Run every provider. Previous results and progress are cleared first.
    pub async fn run_all(&self) -> CoordinatorResult<Vec<SpeedTestResult>> {
        if self.entries.is_empty() {
            return Err(CoordinatorError::NoProviders);
        }
        let indices: Vec<usize> = (0..self.entries.len()).collect();
        let cancel = self
            .begin(|state| {
                state.results.clear();
                state.progress = self
                    .entries
                    .iter()
                    .map(|e| (e.descriptor.name.clone(), SpeedTestProgress::idle(&e.descriptor.name)))
                    .collect();
            })
            .await?;

        info!(providers = indices.len(), mode = ?self.config.mode, "starting run");
        self.execute(&indices, cancel).await;
        Ok(self.results().await)
    }

    /// Retest one provider, replacing its previous result in place.
    pub async fn run_single(&self, provider: &str) -> CoordinatorResult<SpeedTestResult> {
        let index = self
            .entries
            .iter()
            .position(|e| e.descriptor.name == provider)
            .ok_or_else(|| CoordinatorError::UnknownProvider(provider.to_string()))?;

        let cancel = self
            .begin(|state| {
                state
                    .progress
                    .insert(provider.to_string(), SpeedTestProgress::idle(provider));
            })
            .await?;

        info!(%provider, "starting single-provider run");
        self.execute(&[index], cancel).await;

        let state = self.state.read().await;
        state
            .results
            .iter()
            .find(|r| r.provider == provider)
            .cloned()
            .ok_or_else(|| CoordinatorError::UnknownProvider(provider.to_string()))
    }

    /// Cancel everything in flight. A no-op when idle or already cancelled.
    pub async fn stop_all(&self) {
        let state = self.state.read().await;
        if state.is_running && !state.cancel.is_cancelled() {
            info!("stopping all providers");
            state.cancel.cancel();
        }
    }

    /// Flip to running under the write lock, or refuse.
    async fn begin<F>(&self, reset: F) -> CoordinatorResult<CancellationToken>
    where
        F: FnOnce(&mut CoordinatorState),
    {
        let mut state = self.state.write().await;
        if state.is_running {
            return Err(CoordinatorError::AlreadyRunning);
        }
        reset(&mut state);
        state.is_running = true;
        state.current_provider = None;
        state.cancel = CancellationToken::new();
        Ok(state.cancel.clone())
    }

    async fn execute(&self, indices: &[usize], cancel: CancellationToken) {
        let run_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let drained = CancellationToken::new();
        let fan_in_task = tokio::spawn(fan_in(
            rx,
            drained.clone(),
            Arc::clone(&self.state),
            self.events.clone(),
            run_id,
        ));

        {
            let run_one = |index: usize| {
                let entry = &self.entries[index];
                let ctx = RunContext::new(
                    cancel.child_token(),
                    ProgressReporter::new(entry.descriptor.name.clone(), tx.clone()),
                    entry.settings,
                );
                guarded_run(
                    Arc::clone(&entry.adapter),
                    ctx,
                    self.config.cancel_grace(),
                    self.config.run_timeout(),
                )
            };

            match self.config.mode {
                ExecutionMode::Concurrent => {
                    let mut running: FuturesUnordered<_> = indices.iter().map(|&i| run_one(i)).collect();
                    while let Some(result) = running.next().await {
                        self.record(result).await;
                    }
                }
                ExecutionMode::Sequential => {
                    for &index in indices {
                        self.state.write().await.current_provider =
                            Some(self.entries[index].descriptor.name.clone());
                        let result = run_one(index).await;
                        self.record(result).await;
                    }
                }
            }
        }

        drop(tx);
        drained.cancel();
        if let Err(e) = fan_in_task.await {
            warn!(error = %e, "progress fan-in task failed");
        }

        let results = {
            let mut state = self.state.write().await;
            state.is_running = false;
            state.current_provider = None;
            state.results.clone()
        };

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        info!(%run_id, total = results.len(), succeeded, "run finished");
        self.events.publish(MeasurementEvent::Final {
            run_id,
            results: FinalResults::Providers(Arc::new(results)),
        });
    }

    /// Replace the provider's earlier result in place, else append.
    async fn record(&self, result: SpeedTestResult) {
        let mut state = self.state.write().await;
        match state.results.iter_mut().find(|r| r.provider == result.provider) {
            Some(slot) => *slot = result,
            None => state.results.push(result),
        }
    }
}

/// Run one adapter, enforcing the cancel grace and the optional run timeout.
///
/// Past the grace the adapter future is dropped, which kills any child
/// process it spawned, and the result is written here instead.
fn guarded_run(
    adapter: Arc<dyn ProviderAdapter>,
    ctx: RunContext,
    grace: Duration,
    timeout: Option<Duration>,
) -> impl Future<Output = SpeedTestResult> {
    async move {
        let name = adapter.descriptor().name;
        let run = adapter.run(&ctx);
        tokio::pin!(run);

        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };

        let timed_out = tokio::select! {
            result = &mut run => return result,
            _ = ctx.cancel.cancelled() => false,
            _ = deadline => {
                warn!(provider = %name, "provider run timed out, cancelling");
                ctx.cancel.cancel();
                true
            }
        };

        let outcome = tokio::time::timeout(grace, &mut run).await;
        let error = match (timed_out, outcome) {
            (false, Ok(result)) => return result,
            (true, _) => MeasurementError::timeout(format!(
                "{} did not finish within {:?}",
                name,
                timeout.unwrap_or_default()
            )),
            (false, Err(_)) => {
                warn!(provider = %name, ?grace, "provider ignored cancellation, abandoning it");
                MeasurementError::Cancelled
            }
        };
        ctx.progress.report(Phase::Failed, 1.0, None, None);
        SpeedTestResult::failure(name, &error)
    }
}

/// Single consumer of all progress updates for one run.
async fn fan_in(
    mut rx: mpsc::UnboundedReceiver<SpeedTestProgress>,
    drained: CancellationToken,
    state: Arc<RwLock<CoordinatorState>>,
    events: EventBus,
    run_id: Uuid,
) {
    loop {
        let update = tokio::select! {
            biased;
            update = rx.recv() => update,
            _ = drained.cancelled() => {
                // Adapters are done; flush what is queued and stop even if a
                // stray task still holds a sender.
                rx.close();
                while let Some(update) = rx.recv().await {
                    apply(&state, &events, run_id, update).await;
                }
                break;
            }
        };
        match update {
            Some(update) => apply(&state, &events, run_id, update).await,
            None => break,
        }
    }
    debug!(%run_id, "progress fan-in finished");
}

async fn apply(
    state: &RwLock<CoordinatorState>,
    events: &EventBus,
    run_id: Uuid,
    update: SpeedTestProgress,
) {
    let merged = {
        let mut state = state.write().await;
        let merged = match state.progress.get(&update.provider) {
            Some(previous) => previous.advance(update),
            None => update,
        };
        state.progress.insert(merged.provider.clone(), merged.clone());
        merged
    };
    events.publish(MeasurementEvent::Progress {
        run_id,
        update: ProgressUpdate::Provider(Arc::new(merged)),
    });
}
