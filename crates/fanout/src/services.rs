//! Trait seams for the external collaborators the engine depends on.
//!
//! The engine never talks to a database, a wire protocol or a dashboard
//! directly: every collaborator is injected as an `Arc<dyn Trait>` at
//! construction time. The in-memory implementation in [`crate::memstore`]
//! backs the tests and the CLI simulation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{MoverError, Result};
use crate::model::{
    DataFile, DataTransfer, Destination, Host, HostKind, SchedulerValue, TransferGroup,
    TransferServer,
};
use crate::status::{DestinationStatus, StatusColor, TransferStatus};
use chrono::{DateTime, Utc};

/// Persistent storage of the scheduling records.
///
/// Single-record updates must be atomic; the bulk interrupted-transfer
/// queries back the crash-recovery pass.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn destinations(&self) -> Result<Vec<Destination>>;

    async fn destination(&self, name: &str) -> Result<Destination>;

    async fn update_destination_status(
        &self,
        name: &str,
        status: DestinationStatus,
    ) -> Result<()>;

    /// Fetches the scheduler value for a destination, creating a fresh one
    /// when none was persisted yet.
    async fn scheduler_value(&self, destination: &str) -> Result<SchedulerValue>;

    async fn update_scheduler_value(&self, value: &SchedulerValue) -> Result<()>;

    /// Hosts attached to a destination, filtered by role, in configured order.
    async fn destination_hosts(&self, destination: &str, kind: HostKind) -> Result<Vec<Host>>;

    async fn host(&self, name: &str) -> Result<Host>;

    async fn transfer(&self, id: i64) -> Result<DataTransfer>;

    async fn update_transfer(&self, transfer: &DataTransfer) -> Result<()>;

    /// Transfers in WAIT/RETR/INTR whose queue time falls before `before`,
    /// most urgent first.
    async fn pending_transfers(
        &self,
        destination: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<DataTransfer>>;

    async fn pending_transfer_count(
        &self,
        destination: &str,
        before: DateTime<Utc>,
    ) -> Result<usize>;

    /// Transfers left in INIT/FETC/EXEC/INTR, across all destinations when
    /// `destination` is `None`.
    async fn interrupted_transfers(&self, destination: Option<&str>)
    -> Result<Vec<DataTransfer>>;

    /// Non-deleted transfers sharing a destination and target name, used by
    /// duplicate suppression.
    async fn transfers_by_target(
        &self,
        destination: &str,
        target: &str,
    ) -> Result<Vec<DataTransfer>>;

    /// Transfers whose queue time was pushed past their scheduled time by a
    /// max-start delay.
    async fn delayed_transfers(&self, destination: &str) -> Result<Vec<DataTransfer>>;

    async fn data_file(&self, id: i64) -> Result<DataFile>;

    async fn update_data_file(&self, file: &DataFile) -> Result<()>;

    async fn transfer_group(&self, name: &str) -> Result<Option<TransferGroup>>;

    async fn transfer_groups(&self) -> Result<Vec<TransferGroup>>;

    async fn transfer_servers(&self, group: &str) -> Result<Vec<TransferServer>>;
}

/// Remote-callable control interface of a mover.
///
/// Implementations must map every connectivity-class failure to
/// [`MoverError::Connectivity`] and everything else to
/// [`MoverError::Application`].
#[async_trait]
pub trait MoverControl: Send + Sync {
    /// Pushes the transfer's payload to its destination host.
    async fn put(
        &self,
        server: &TransferServer,
        transfer: &DataTransfer,
        host_for_source: Option<&Host>,
    ) -> std::result::Result<(), MoverError>;

    /// Retrieves the payload from its remote source onto the mover.
    async fn download(
        &self,
        server: &TransferServer,
        transfer: &DataTransfer,
        file: &DataFile,
        host_for_source: Option<&Host>,
    ) -> std::result::Result<(), MoverError>;

    /// Copies the payload to another mover for redundancy.
    async fn replicate(
        &self,
        server: &TransferServer,
        host_for_replication: &Host,
        file: &DataFile,
    ) -> std::result::Result<(), MoverError>;

    /// Runs the content-filtering hook against a stored payload.
    async fn filter(
        &self,
        server: &TransferServer,
        file: &DataFile,
        remove: bool,
    ) -> std::result::Result<(), MoverError>;

    /// Removes the payload copy held by this mover.
    async fn purge(
        &self,
        server: &TransferServer,
        file: &DataFile,
    ) -> std::result::Result<(), MoverError>;

    async fn size(
        &self,
        server: &TransferServer,
        host: &Host,
        source: &str,
    ) -> std::result::Result<u64, MoverError>;

    async fn del(
        &self,
        server: &TransferServer,
        host: &Host,
        source: &str,
    ) -> std::result::Result<(), MoverError>;

    async fn mkdir(
        &self,
        server: &TransferServer,
        host: &Host,
        dir: &str,
    ) -> std::result::Result<(), MoverError>;

    async fn rmdir(
        &self,
        server: &TransferServer,
        host: &Host,
        dir: &str,
    ) -> std::result::Result<(), MoverError>;

    async fn move_file(
        &self,
        server: &TransferServer,
        host: &Host,
        source: &str,
        target: &str,
    ) -> std::result::Result<(), MoverError>;

    async fn check(
        &self,
        server: &TransferServer,
        transfer: &DataTransfer,
    ) -> std::result::Result<(), MoverError>;

    async fn list(
        &self,
        server: &TransferServer,
        host: &Host,
        directory: &str,
    ) -> std::result::Result<Vec<String>, MoverError>;

    /// Whether the mover currently holds a live control-plane connection.
    async fn is_connected(&self, server_name: &str) -> bool;
}

/// Append-only audit trail of transfer state changes.
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record(&self, transfer: &DataTransfer, status: TransferStatus, comment: &str);
}

/// Best-effort "transfer started" hook.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn transfer_started(&self, transfer: &DataTransfer);
}

/// Colored per-destination status consumed by an external dashboard.
#[async_trait]
pub trait MonitorSink: Send + Sync {
    async fn destination_color(&self, destination: &str, color: StatusColor);
}

/// Evaluates the boolean expression language used by duplicate-suppression
/// rules. The engine substitutes the template values before calling; the
/// evaluator never sees the transfers themselves.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PredicateEvaluator: Send + Sync {
    async fn evaluate(&self, expression: &str) -> Result<bool>;
}

/// The full set of injected collaborators, cloned into each component.
#[derive(Clone)]
pub struct EngineServices {
    pub store: Arc<dyn Persistence>,
    pub mover: Arc<dyn MoverControl>,
    pub history: Arc<dyn HistorySink>,
    pub notifier: Arc<dyn NotificationSink>,
    pub monitor: Arc<dyn MonitorSink>,
    pub evaluator: Arc<dyn PredicateEvaluator>,
}

/// A history sink that drops everything, for wiring tests.
pub struct NullHistorySink;

#[async_trait]
impl HistorySink for NullHistorySink {
    async fn record(&self, _transfer: &DataTransfer, _status: TransferStatus, _comment: &str) {}
}

/// A notification sink that drops everything.
pub struct NullNotificationSink;

#[async_trait]
impl NotificationSink for NullNotificationSink {
    async fn transfer_started(&self, _transfer: &DataTransfer) {}
}

/// A monitor sink that drops everything.
pub struct NullMonitorSink;

#[async_trait]
impl MonitorSink for NullMonitorSink {
    async fn destination_color(&self, _destination: &str, _color: StatusColor) {}
}
