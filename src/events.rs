//! Broadcast of progress and final results to any number of observers.
//!
//! Payloads are `Arc`-shared and immutable; a slow subscriber lags and loses
//! the oldest events instead of holding up the measurement.

use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::lan::LanSpeedResult;
use crate::progress::{LanTestProgress, SpeedTestProgress};
use crate::provider::SpeedTestResult;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum ProgressUpdate {
    Provider(Arc<SpeedTestProgress>),
    Lan(Arc<LanTestProgress>),
}

#[derive(Debug, Clone)]
pub enum FinalResults {
    Providers(Arc<Vec<SpeedTestResult>>),
    Lan(Arc<LanSpeedResult>),
}

#[derive(Debug, Clone)]
pub enum MeasurementEvent {
    Progress { run_id: Uuid, update: ProgressUpdate },
    Final { run_id: Uuid, results: FinalResults },
}

impl MeasurementEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            MeasurementEvent::Progress { run_id, .. } | MeasurementEvent::Final { run_id, .. } => {
                *run_id
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MeasurementEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeasurementEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, event: MeasurementEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
