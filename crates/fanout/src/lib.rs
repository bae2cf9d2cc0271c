//! Fanout: transfer scheduling and host-failover engine.
//!
//! This crate dispatches [`DataTransfer`]s from many logical [`Destination`]s
//! to a pool of transfer servers ("movers"), enforcing per-destination
//! concurrency limits, per-host retry/failover policy, and global fairness.
//! Persistence, transport, notification and monitoring are consumed through
//! injected trait interfaces; the engine itself is pure orchestration.
//!
//! ## Core components
//!
//! - [`SchedulerLoop`] - worker pool management and crash recovery
//! - [`DestinationWorker`] - per-destination dispatch state machine
//! - [`HostProvider`] - ordered host failover ring with retry credits
//! - [`TransferServerSelector`] - mover selection, rotation and clustering
//! - [`TransferOrchestrator`] - put/download/replicate/purge over movers
//! - [`StatusMonitor`] - colored dashboard status sampling
//!
//! ## Collaborator seams
//!
//! - [`Persistence`] - storage of the scheduling records
//! - [`MoverControl`] - remote mover operations
//! - [`HistorySink`], [`NotificationSink`], [`MonitorSink`] - outbound hooks
//! - [`PredicateEvaluator`] - duplicate-suppression rule evaluation
//!
//! The in-memory [`MemStore`] backs the tests and the CLI simulation.

pub mod config;
pub mod error;
pub mod memstore;
pub mod model;
pub mod monitor;
pub mod orchestrator;
pub mod provider;
pub mod scheduler;
pub mod selector;
pub mod services;
pub mod status;
pub mod worker;

#[cfg(test)]
pub(crate) mod testsupport;

pub use config::SchedulerConfig;
pub use error::{MoverError, Result, SchedulerError};
pub use memstore::MemStore;
pub use model::{
    DataFile, DataTransfer, Destination, Host, HostKind, OnHostFailure, SchedulerValue,
    TransferGroup, TransferServer,
};
pub use monitor::StatusMonitor;
pub use orchestrator::{DownloadCounters, TransferOrchestrator};
pub use provider::HostProvider;
pub use scheduler::SchedulerLoop;
pub use selector::{ServerSelection, TransferServerSelector};
pub use services::{
    EngineServices, HistorySink, MonitorSink, MoverControl, NotificationSink, Persistence,
    PredicateEvaluator,
};
pub use status::{DestinationStatus, StatusColor, TransferStatus};
pub use worker::{DestinationWorker, StepOutcome, WorkerHandle};
