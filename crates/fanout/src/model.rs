//! Data model records shared between the engine and the persistence layer.
//!
//! These are owned value records: each mutable record has a single writer
//! (the worker or provider that owns it) and is persisted after mutation so
//! that a restart can resume from the stored snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::status::{DestinationStatus, TransferStatus};

/// What to do when the current host keeps failing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnHostFailure {
    /// Fail over and, after a success, jump back to the head of the ring.
    #[default]
    NextAndRetry,
    /// Fail over and stick to whichever host ends up working.
    NextAndStay,
}

/// Role of a configured host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostKind {
    Dissemination,
    Acquisition,
    Replication,
    Source,
    Backup,
    Proxy,
}

/// A logical delivery endpoint owning a transfer queue and one or more hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    pub name: String,
    pub status: DestinationStatus,
    pub active: bool,
    /// Destination-level connection cap; negative means unlimited.
    pub max_connections: i32,
    /// Attempts before a transfer is delayed by `start_frequency`.
    pub max_start: u32,
    /// Delays before a transfer is failed for good.
    pub max_requeue: u32,
    /// Full ring traversals before the destination is held; negative means
    /// unlimited.
    pub retry_count: i32,
    /// Pause after a full ring traversal.
    pub retry_frequency: Duration,
    /// How long a sticky host choice survives before the ring resets.
    pub reset_frequency: Duration,
    /// Queue-time push applied when `max_start` is reached.
    pub start_frequency: Duration,
    pub monitor: bool,
    /// Shut the worker down when the destination record changed under it.
    pub stop_if_dirty: bool,
    pub update_time: DateTime<Utc>,
    /// Earliest scheduled time the scheduler considers for this destination.
    pub min_queue_time: DateTime<Utc>,
    pub transfer_group: Option<String>,
    pub on_host_failure: OnHostFailure,
    /// Duplicate-suppression rule; template over `$time1/$size1/$time2/$size2`.
    pub requeue_on: Option<String>,
    /// Acquisition destinations resubmit transfers whose retrieval failed.
    pub acquisition: bool,
    pub requeue_on_failure: bool,
    pub mail_on_start: bool,
}

/// Per-destination scheduler bookkeeping, persisted after each mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerValue {
    pub destination: String,
    pub last_transfer_ok: Option<i64>,
    pub last_transfer_ko: Option<i64>,
    /// Host the provider was using when the record was last saved.
    pub host_name: Option<String>,
    pub start_count: u32,
    pub has_requeued: bool,
    pub reset_time: Option<DateTime<Utc>>,
}

impl SchedulerValue {
    pub fn new(destination: &str) -> Self {
        Self {
            destination: destination.to_owned(),
            ..Self::default()
        }
    }
}

/// A configured delivery or acquisition target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub nickname: String,
    pub address: String,
    /// Retries on this host before the ring advances.
    pub retry_count: u32,
    pub retry_frequency: Duration,
    /// Per-host connection cap; negative means unlimited.
    pub max_connections: i32,
    pub kind: HostKind,
    pub active: bool,
    pub transfer_group: Option<String>,
    /// Forced-mover spec for regular processing, if any.
    pub mover_list: Option<String>,
    /// Forced-mover spec for backup pushes, if any.
    pub mover_list_for_backup: Option<String>,
}

/// One scheduled delivery job for a [`DataFile`] to a [`Destination`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataTransfer {
    pub id: i64,
    pub target: String,
    pub destination: String,
    pub data_file: i64,
    pub status: TransferStatus,
    /// Lower value dispatches first.
    pub priority: i32,
    pub queue_time: DateTime<Utc>,
    pub scheduled_time: DateTime<Utc>,
    pub retry_time: Option<DateTime<Utc>>,
    pub expiry_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub start_count: u32,
    pub requeue_count: u32,
    pub requeue_history: u32,
    pub host_name: Option<String>,
    /// Mover currently assigned for delivery.
    pub server_name: Option<String>,
    /// Mover that performed the original retrieval, if any.
    pub original_server_name: Option<String>,
    pub proxy_host_name: Option<String>,
    pub comment: Option<String>,
    pub user_status: Option<String>,
    pub deleted: bool,
    pub asap: bool,
}

impl DataTransfer {
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry_time < now
    }
}

/// The payload referenced by one or more transfers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFile {
    pub id: i64,
    pub size: u64,
    pub checksum: Option<String>,
    /// Time base of the product, used by duplicate suppression.
    pub file_time: DateTime<Utc>,
    pub transfer_group: String,
    /// Volume index the payload lives on within its group.
    pub file_system: u32,
    pub downloaded: bool,
    pub delete_original: bool,
    pub source_host_name: Option<String>,
}

/// A worker node that physically moves bytes; belongs to a transfer group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferServer {
    pub name: String,
    pub transfer_group: String,
    pub active: bool,
    pub replicate: bool,
    pub host_for_replication: Option<String>,
}

/// A pool of movers sharing storage volumes, optionally part of a weighted
/// cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferGroup {
    pub name: String,
    pub active: bool,
    pub volume_count: u32,
    pub min_replication_count: u32,
    pub min_filtering_count: u32,
    pub cluster_name: Option<String>,
    pub cluster_weight: Option<u32>,
}
