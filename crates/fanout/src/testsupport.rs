//! Shared fixtures and a scripted mover for the unit tests.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::error::MoverError;
use crate::model::{
    DataFile, DataTransfer, Destination, Host, HostKind, OnHostFailure, TransferGroup,
    TransferServer,
};
use crate::services::{HistorySink, MoverControl};
use crate::status::{DestinationStatus, TransferStatus};

/// A history sink that keeps every entry for later assertions.
#[derive(Default)]
pub struct RecordingHistory {
    entries: Mutex<Vec<(i64, TransferStatus, String)>>,
}

impl RecordingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn comments(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|(_, _, comment)| comment.clone())
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|(_, _, comment)| comment.contains(needle))
    }
}

#[async_trait]
impl HistorySink for RecordingHistory {
    async fn record(&self, transfer: &DataTransfer, status: TransferStatus, comment: &str) {
        self.entries
            .lock()
            .push((transfer.id, status, comment.to_owned()));
    }
}

/// A mover whose connectivity and failures are scripted by the test.
///
/// Every call is logged as `(operation, server, source)` so tests can assert
/// on call order.
#[derive(Default)]
pub struct FakeMover {
    connected: Mutex<HashSet<String>>,
    failures: Mutex<HashMap<String, MoverError>>,
    calls: Mutex<Vec<(String, String, Option<String>)>>,
}

impl FakeMover {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, server: &str) {
        self.connected.lock().insert(server.to_owned());
    }

    pub fn disconnect(&self, server: &str) {
        self.connected.lock().remove(server);
    }

    /// Makes every operation on `server` fail with the given error.
    pub fn fail_server(&self, server: &str, error: MoverError) {
        self.failures.lock().insert(server.to_owned(), error);
    }

    /// Server names of the logged calls for one operation, in order.
    pub fn calls_for(&self, operation: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|(op, _, _)| op == operation)
            .map(|(_, server, _)| server.clone())
            .collect()
    }

    /// Source host names passed to the logged `put` calls, in order.
    pub fn put_sources(&self) -> Vec<Option<String>> {
        self.calls
            .lock()
            .iter()
            .filter(|(op, _, _)| op == "put")
            .map(|(_, _, source)| source.clone())
            .collect()
    }

    fn call(
        &self,
        operation: &str,
        server: &str,
        source: Option<String>,
    ) -> Result<(), MoverError> {
        self.calls
            .lock()
            .push((operation.to_owned(), server.to_owned(), source));
        match self.failures.lock().get(server) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MoverControl for FakeMover {
    async fn put(
        &self,
        server: &TransferServer,
        _transfer: &DataTransfer,
        host_for_source: Option<&Host>,
    ) -> Result<(), MoverError> {
        self.call(
            "put",
            &server.name,
            host_for_source.map(|h| h.name.clone()),
        )
    }

    async fn download(
        &self,
        server: &TransferServer,
        _transfer: &DataTransfer,
        _file: &DataFile,
        host_for_source: Option<&Host>,
    ) -> Result<(), MoverError> {
        self.call(
            "download",
            &server.name,
            host_for_source.map(|h| h.name.clone()),
        )
    }

    async fn replicate(
        &self,
        server: &TransferServer,
        host_for_replication: &Host,
        _file: &DataFile,
    ) -> Result<(), MoverError> {
        self.call(
            "replicate",
            &server.name,
            Some(host_for_replication.name.clone()),
        )
    }

    async fn filter(
        &self,
        server: &TransferServer,
        _file: &DataFile,
        _remove: bool,
    ) -> Result<(), MoverError> {
        self.call("filter", &server.name, None)
    }

    async fn purge(&self, server: &TransferServer, _file: &DataFile) -> Result<(), MoverError> {
        self.call("purge", &server.name, None)
    }

    async fn size(
        &self,
        server: &TransferServer,
        _host: &Host,
        _source: &str,
    ) -> Result<u64, MoverError> {
        self.call("size", &server.name, None).map(|()| 0)
    }

    async fn del(
        &self,
        server: &TransferServer,
        _host: &Host,
        _source: &str,
    ) -> Result<(), MoverError> {
        self.call("del", &server.name, None)
    }

    async fn mkdir(
        &self,
        server: &TransferServer,
        _host: &Host,
        _dir: &str,
    ) -> Result<(), MoverError> {
        self.call("mkdir", &server.name, None)
    }

    async fn rmdir(
        &self,
        server: &TransferServer,
        _host: &Host,
        _dir: &str,
    ) -> Result<(), MoverError> {
        self.call("rmdir", &server.name, None)
    }

    async fn move_file(
        &self,
        server: &TransferServer,
        _host: &Host,
        _source: &str,
        _target: &str,
    ) -> Result<(), MoverError> {
        self.call("move_file", &server.name, None)
    }

    async fn check(
        &self,
        server: &TransferServer,
        _transfer: &DataTransfer,
    ) -> Result<(), MoverError> {
        self.call("check", &server.name, None)
    }

    async fn list(
        &self,
        server: &TransferServer,
        _host: &Host,
        _directory: &str,
    ) -> Result<Vec<String>, MoverError> {
        self.call("list", &server.name, None).map(|()| Vec::new())
    }

    async fn is_connected(&self, server_name: &str) -> bool {
        self.connected.lock().contains(server_name)
    }
}

/// A destination with zero delays and unlimited budgets, so tests never
/// sleep.
pub fn destination(name: &str) -> Destination {
    Destination {
        name: name.to_owned(),
        status: DestinationStatus::Exec,
        active: true,
        max_connections: -1,
        max_start: 5,
        max_requeue: 3,
        retry_count: -1,
        retry_frequency: Duration::ZERO,
        reset_frequency: Duration::from_secs(600),
        start_frequency: Duration::from_secs(600),
        monitor: true,
        stop_if_dirty: false,
        update_time: Utc::now(),
        min_queue_time: Utc::now() - chrono::Duration::days(1),
        transfer_group: None,
        on_host_failure: OnHostFailure::NextAndRetry,
        requeue_on: None,
        acquisition: false,
        requeue_on_failure: false,
        mail_on_start: false,
    }
}

pub fn host(name: &str, retry_count: u32, retry_frequency: Duration) -> Host {
    Host {
        name: name.to_owned(),
        nickname: name.to_owned(),
        address: format!("{name}.example.int"),
        retry_count,
        retry_frequency,
        max_connections: -1,
        kind: HostKind::Dissemination,
        active: true,
        transfer_group: None,
        mover_list: None,
        mover_list_for_backup: None,
    }
}

pub fn transfer(id: i64, destination: &str, target: &str, priority: i32) -> DataTransfer {
    let now = Utc::now();
    DataTransfer {
        id,
        target: target.to_owned(),
        destination: destination.to_owned(),
        data_file: id,
        status: TransferStatus::Wait,
        priority,
        queue_time: now,
        scheduled_time: now,
        retry_time: None,
        expiry_time: now + chrono::Duration::days(2),
        start_time: None,
        finish_time: None,
        start_count: 0,
        requeue_count: 0,
        requeue_history: 0,
        host_name: None,
        server_name: None,
        original_server_name: None,
        proxy_host_name: None,
        comment: None,
        user_status: None,
        deleted: false,
        asap: false,
    }
}

pub fn data_file(id: i64, transfer_group: &str, file_system: u32) -> DataFile {
    DataFile {
        id,
        size: 1024,
        checksum: None,
        file_time: Utc::now(),
        transfer_group: transfer_group.to_owned(),
        file_system,
        downloaded: false,
        delete_original: false,
        source_host_name: None,
    }
}

pub fn group(
    name: &str,
    volume_count: u32,
    cluster: Option<&str>,
    weight: Option<u32>,
) -> TransferGroup {
    TransferGroup {
        name: name.to_owned(),
        active: true,
        volume_count,
        min_replication_count: 0,
        min_filtering_count: 0,
        cluster_name: cluster.map(str::to_owned),
        cluster_weight: weight,
    }
}

pub fn server(name: &str, transfer_group: &str, active: bool) -> TransferServer {
    TransferServer {
        name: name.to_owned(),
        transfer_group: transfer_group.to_owned(),
        active,
        replicate: false,
        host_for_replication: None,
    }
}
