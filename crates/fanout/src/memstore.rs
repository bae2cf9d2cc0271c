//! In-memory [`Persistence`] implementation.
//!
//! Backs the test suites and the CLI simulation. Ordering semantics match
//! what a SQL-backed store would provide: pending transfers come back most
//! urgent first, hosts in configured order.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{Result, SchedulerError};
use crate::model::{
    DataFile, DataTransfer, Destination, Host, HostKind, SchedulerValue, TransferGroup,
    TransferServer,
};
use crate::services::Persistence;
use crate::status::{DestinationStatus, TransferStatus};

#[derive(Default)]
struct State {
    destinations: HashMap<String, Destination>,
    values: HashMap<String, SchedulerValue>,
    hosts: HashMap<String, Host>,
    /// Per-destination host names, in configured order.
    destination_hosts: HashMap<String, Vec<String>>,
    transfers: HashMap<i64, DataTransfer>,
    files: HashMap<i64, DataFile>,
    groups: HashMap<String, TransferGroup>,
    /// Group insertion order, so listings stay deterministic.
    group_order: Vec<String>,
    servers: HashMap<String, Vec<TransferServer>>,
}

/// A map-backed store with interior mutability.
#[derive(Default)]
pub struct MemStore {
    state: RwLock<State>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_destination(&self, destination: Destination) {
        let mut state = self.state.write();
        state
            .destination_hosts
            .entry(destination.name.clone())
            .or_default();
        state
            .destinations
            .insert(destination.name.clone(), destination);
    }

    /// Registers a host and appends it to a destination's ring, in call
    /// order.
    pub fn attach_host(&self, destination: &str, host: Host) {
        let mut state = self.state.write();
        state
            .destination_hosts
            .entry(destination.to_owned())
            .or_default()
            .push(host.name.clone());
        state.hosts.insert(host.name.clone(), host);
    }

    pub fn add_host(&self, host: Host) {
        self.state.write().hosts.insert(host.name.clone(), host);
    }

    pub fn add_transfer(&self, transfer: DataTransfer) {
        self.state.write().transfers.insert(transfer.id, transfer);
    }

    pub fn add_data_file(&self, file: DataFile) {
        self.state.write().files.insert(file.id, file);
    }

    pub fn add_group(&self, group: TransferGroup) {
        let mut state = self.state.write();
        state.group_order.push(group.name.clone());
        state.groups.insert(group.name.clone(), group);
    }

    pub fn add_server(&self, server: TransferServer) {
        self.state
            .write()
            .servers
            .entry(server.transfer_group.clone())
            .or_default()
            .push(server);
    }

    fn sorted(mut transfers: Vec<DataTransfer>) -> Vec<DataTransfer> {
        transfers.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.queue_time.cmp(&b.queue_time))
                .then(a.id.cmp(&b.id))
        });
        transfers
    }

    fn is_pending(transfer: &DataTransfer, destination: &str, before: DateTime<Utc>) -> bool {
        transfer.destination == destination
            && !transfer.deleted
            && matches!(
                transfer.status,
                TransferStatus::Wait | TransferStatus::Retr | TransferStatus::Intr
            )
            && transfer.queue_time <= before
    }
}

#[async_trait]
impl Persistence for MemStore {
    async fn destinations(&self) -> Result<Vec<Destination>> {
        let mut all: Vec<Destination> = self.state.read().destinations.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn destination(&self, name: &str) -> Result<Destination> {
        self.state
            .read()
            .destinations
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::Persistence(format!("unknown destination {name}")))
    }

    async fn update_destination_status(
        &self,
        name: &str,
        status: DestinationStatus,
    ) -> Result<()> {
        let mut state = self.state.write();
        let destination = state
            .destinations
            .get_mut(name)
            .ok_or_else(|| SchedulerError::Persistence(format!("unknown destination {name}")))?;
        destination.status = status;
        Ok(())
    }

    async fn scheduler_value(&self, destination: &str) -> Result<SchedulerValue> {
        let mut state = self.state.write();
        Ok(state
            .values
            .entry(destination.to_owned())
            .or_insert_with(|| SchedulerValue::new(destination))
            .clone())
    }

    async fn update_scheduler_value(&self, value: &SchedulerValue) -> Result<()> {
        self.state
            .write()
            .values
            .insert(value.destination.clone(), value.clone());
        Ok(())
    }

    async fn destination_hosts(&self, destination: &str, kind: HostKind) -> Result<Vec<Host>> {
        let state = self.state.read();
        let names = state
            .destination_hosts
            .get(destination)
            .cloned()
            .unwrap_or_default();
        let mut hosts = Vec::new();
        for name in names {
            if let Some(host) = state.hosts.get(&name)
                && host.kind == kind
            {
                hosts.push(host.clone());
            }
        }
        Ok(hosts)
    }

    async fn host(&self, name: &str) -> Result<Host> {
        self.state
            .read()
            .hosts
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::Persistence(format!("unknown host {name}")))
    }

    async fn transfer(&self, id: i64) -> Result<DataTransfer> {
        self.state
            .read()
            .transfers
            .get(&id)
            .cloned()
            .ok_or_else(|| SchedulerError::Persistence(format!("unknown transfer {id}")))
    }

    async fn update_transfer(&self, transfer: &DataTransfer) -> Result<()> {
        self.state
            .write()
            .transfers
            .insert(transfer.id, transfer.clone());
        Ok(())
    }

    async fn pending_transfers(
        &self,
        destination: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<DataTransfer>> {
        let pending = self
            .state
            .read()
            .transfers
            .values()
            .filter(|t| Self::is_pending(t, destination, before))
            .cloned()
            .collect();
        Ok(Self::sorted(pending))
    }

    async fn pending_transfer_count(
        &self,
        destination: &str,
        before: DateTime<Utc>,
    ) -> Result<usize> {
        Ok(self
            .state
            .read()
            .transfers
            .values()
            .filter(|t| Self::is_pending(t, destination, before))
            .count())
    }

    async fn interrupted_transfers(
        &self,
        destination: Option<&str>,
    ) -> Result<Vec<DataTransfer>> {
        let interrupted = self
            .state
            .read()
            .transfers
            .values()
            .filter(|t| {
                destination.is_none_or(|d| t.destination == d)
                    && matches!(
                        t.status,
                        TransferStatus::Init
                            | TransferStatus::Fetc
                            | TransferStatus::Exec
                            | TransferStatus::Intr
                    )
            })
            .cloned()
            .collect();
        Ok(Self::sorted(interrupted))
    }

    async fn transfers_by_target(
        &self,
        destination: &str,
        target: &str,
    ) -> Result<Vec<DataTransfer>> {
        let matching = self
            .state
            .read()
            .transfers
            .values()
            .filter(|t| !t.deleted && t.destination == destination && t.target == target)
            .cloned()
            .collect();
        Ok(Self::sorted(matching))
    }

    async fn delayed_transfers(&self, destination: &str) -> Result<Vec<DataTransfer>> {
        let delayed = self
            .state
            .read()
            .transfers
            .values()
            .filter(|t| {
                !t.deleted && t.destination == destination && t.queue_time > t.scheduled_time
            })
            .cloned()
            .collect();
        Ok(Self::sorted(delayed))
    }

    async fn data_file(&self, id: i64) -> Result<DataFile> {
        self.state
            .read()
            .files
            .get(&id)
            .cloned()
            .ok_or_else(|| SchedulerError::Persistence(format!("unknown data file {id}")))
    }

    async fn update_data_file(&self, file: &DataFile) -> Result<()> {
        self.state.write().files.insert(file.id, file.clone());
        Ok(())
    }

    async fn transfer_group(&self, name: &str) -> Result<Option<TransferGroup>> {
        Ok(self.state.read().groups.get(name).cloned())
    }

    async fn transfer_groups(&self) -> Result<Vec<TransferGroup>> {
        let state = self.state.read();
        Ok(state
            .group_order
            .iter()
            .filter_map(|name| state.groups.get(name).cloned())
            .collect())
    }

    async fn transfer_servers(&self, group: &str) -> Result<Vec<TransferServer>> {
        Ok(self
            .state
            .read()
            .servers
            .get(group)
            .cloned()
            .unwrap_or_default())
    }
}
