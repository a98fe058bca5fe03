//! netgauge -- multi-provider internet speed tests and peer-to-peer LAN
//! speed tests.
//!
//! This crate provides the provider adapters, the coordinator that runs them,
//! the LAN discovery and measurement protocol, and the event bus that
//! publishes progress and results to observers.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod lan;
pub mod meter;
pub mod progress;
pub mod provider;
pub mod report;

pub use coordinator::MultiServerCoordinator;
pub use error::{CoordinatorError, ErrorKind, MeasurementError};
pub use events::{EventBus, MeasurementEvent};
pub use provider::{ProviderAdapter, SpeedTestResult};
