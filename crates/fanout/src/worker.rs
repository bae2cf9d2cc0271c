//! Per-destination dispatch loop.
//!
//! One worker owns one destination: its priority queue, its host failover
//! ring and its in-flight set. The scheduler talks to it through a
//! [`WorkerHandle`]; completions arrive as messages so the worker stays the
//! single writer of its own state.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::model::{DataTransfer, Destination, HostKind, SchedulerValue, TransferServer};
use crate::orchestrator::TransferOrchestrator;
use crate::provider::HostProvider;
use crate::selector::TransferServerSelector;
use crate::services::EngineServices;
use crate::status::{DestinationStatus, TransferStatus};

/// What one step of the loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A transfer was handed to a mover.
    Dispatched,
    /// A transfer was dropped, delayed, held or failed without a dispatch.
    Pruned,
    /// Nothing could be done right now; wait a tick.
    Delayed,
    /// The queue is empty.
    Idle,
    /// The worker must stop (destination held or no hosts left).
    Stopped,
}

/// Parameters of the single in-flight shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownState {
    pub timeout: Duration,
    pub reset: bool,
    pub comment: String,
}

enum WorkerMessage {
    /// A dispatched transfer finished, in whatever final status.
    Completion(DataTransfer),
    /// A dispatched transfer was pushed back to the queue externally.
    Requeue(DataTransfer),
}

/// Queue key: lower priority value first, then queue time, then id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
    priority: i32,
    queue_time: DateTime<Utc>,
    id: i64,
}

/// The scheduler-facing side of a worker.
#[derive(Clone)]
pub struct WorkerHandle {
    destination: String,
    wakeup: Arc<Notify>,
    token: CancellationToken,
    reset_requested: Arc<AtomicBool>,
    shutdown: Arc<Mutex<Option<ShutdownState>>>,
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerHandle {
    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn wake(&self) {
        self.wakeup.notify_one();
    }

    /// Asks the provider to move back to the head of its ring.
    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::Relaxed);
        self.wakeup.notify_one();
    }

    /// Starts, or retargets, the worker shutdown.
    ///
    /// A shutdown already in flight has its parameters replaced instead of a
    /// second sequence starting. Returns whether this call initiated it.
    pub fn request_shutdown(&self, timeout: Duration, reset: bool, comment: &str) -> bool {
        let initiated = {
            let mut slot = self.shutdown.lock();
            let initiated = slot.is_none();
            *slot = Some(ShutdownState {
                timeout,
                reset,
                comment: comment.to_owned(),
            });
            initiated
        };
        info!(
            destination = %self.destination,
            timeout_s = timeout.as_secs(),
            reset,
            comment,
            initiated,
            "worker shutdown requested"
        );
        self.wakeup.notify_one();
        initiated
    }

    pub fn shutdown_state(&self) -> Option<ShutdownState> {
        self.shutdown.lock().clone()
    }

    pub fn notify_completion(&self, transfer: DataTransfer) {
        let _ = self.tx.send(WorkerMessage::Completion(transfer));
        self.wakeup.notify_one();
    }

    pub fn notify_requeue(&self, transfer: DataTransfer) {
        let _ = self.tx.send(WorkerMessage::Requeue(transfer));
        self.wakeup.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Dispatch state machine for one destination.
pub struct DestinationWorker {
    destination: Destination,
    config: SchedulerConfig,
    services: EngineServices,
    selector: Arc<TransferServerSelector>,
    orchestrator: Arc<TransferOrchestrator>,
    provider: HostProvider,
    value: Arc<Mutex<SchedulerValue>>,
    queue: BinaryHeap<Reverse<QueueEntry>>,
    /// Ids currently in the queue; reload skips them.
    queued: HashSet<i64>,
    in_flight: HashSet<i64>,
    last_activity: Instant,
    wakeup: Arc<Notify>,
    token: CancellationToken,
    reset_requested: Arc<AtomicBool>,
    shutdown: Arc<Mutex<Option<ShutdownState>>>,
    rx: mpsc::UnboundedReceiver<WorkerMessage>,
}

impl DestinationWorker {
    /// Builds the worker and its handle; fails with `NoHostAvailable` when
    /// the destination has no dissemination hosts.
    pub async fn new(
        destination: Destination,
        services: EngineServices,
        selector: Arc<TransferServerSelector>,
        orchestrator: Arc<TransferOrchestrator>,
        config: SchedulerConfig,
    ) -> Result<(Self, WorkerHandle)> {
        let value = Arc::new(Mutex::new(
            services.store.scheduler_value(&destination.name).await?,
        ));
        let token = CancellationToken::new();
        let reset_requested = Arc::new(AtomicBool::new(false));
        let provider = HostProvider::new(
            destination.clone(),
            value.clone(),
            services.store.clone(),
            token.clone(),
            reset_requested.clone(),
        )
        .await?;
        let wakeup = Arc::new(Notify::new());
        let shutdown = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = WorkerHandle {
            destination: destination.name.clone(),
            wakeup: wakeup.clone(),
            token: token.clone(),
            reset_requested: reset_requested.clone(),
            shutdown: shutdown.clone(),
            tx,
        };
        Ok((
            Self {
                destination,
                config,
                services,
                selector,
                orchestrator,
                provider,
                value,
                queue: BinaryHeap::new(),
                queued: HashSet::new(),
                in_flight: HashSet::new(),
                last_activity: Instant::now(),
                wakeup,
                token,
                reset_requested,
                shutdown,
                rx,
            },
            handle,
        ))
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Runs the step loop until cancelled, shut down, held, or idle for too
    /// long.
    pub async fn run(mut self) {
        info!(destination = %self.destination.name, "destination worker started");
        loop {
            while let Ok(message) = self.rx.try_recv() {
                self.handle_message(message).await;
            }
            if self.token.is_cancelled() {
                break;
            }
            if self.shutdown.lock().is_some() {
                if let Err(e) = self.perform_shutdown().await {
                    warn!(
                        destination = %self.destination.name,
                        error = %e,
                        "shutdown left inconsistent state"
                    );
                }
                break;
            }
            if self.reset_requested.swap(false, Ordering::Relaxed)
                && let Err(e) = self.provider.to_be_reset().await
            {
                warn!(destination = %self.destination.name, error = %e, "host reset failed");
            }
            let outcome = match self.step().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(destination = %self.destination.name, error = %e, "step failed");
                    StepOutcome::Delayed
                }
            };
            match outcome {
                StepOutcome::Dispatched | StepOutcome::Pruned => {
                    self.last_activity = Instant::now();
                }
                StepOutcome::Stopped => break,
                StepOutcome::Delayed => self.wait_tick().await,
                StepOutcome::Idle => {
                    if self.in_flight.is_empty()
                        && self.last_activity.elapsed() >= self.config.inactivity_timeout
                    {
                        info!(
                            destination = %self.destination.name,
                            "nothing to do, worker going to sleep"
                        );
                        if let Err(e) = self
                            .services
                            .store
                            .update_destination_status(
                                &self.destination.name,
                                DestinationStatus::Idle,
                            )
                            .await
                        {
                            warn!(error = %e, "could not record sleeping status");
                        }
                        break;
                    }
                    self.wait_tick().await;
                }
            }
        }
        self.token.cancel();
        info!(destination = %self.destination.name, "destination worker stopped");
    }

    async fn wait_tick(&mut self) {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => {}
            _ = self.wakeup.notified() => {}
            message = self.rx.recv() => {
                if let Some(message) = message {
                    self.handle_message(message).await;
                }
            }
            _ = tokio::time::sleep(self.config.step_delay) => {}
        }
    }

    async fn handle_message(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Completion(transfer) => {
                if let Err(e) = self.update_count(&transfer, false).await {
                    warn!(transfer = transfer.id, error = %e, "completion handling failed");
                }
                self.last_activity = Instant::now();
            }
            WorkerMessage::Requeue(transfer) => {
                self.in_flight.remove(&transfer.id);
                self.queued.remove(&transfer.id);
                self.last_activity = Instant::now();
            }
        }
    }

    async fn reload(&mut self) -> Result<()> {
        let pending = self
            .services
            .store
            .pending_transfers(&self.destination.name, Utc::now())
            .await?;
        for transfer in pending {
            if self.queued.contains(&transfer.id) || self.in_flight.contains(&transfer.id) {
                continue;
            }
            self.queued.insert(transfer.id);
            self.queue.push(Reverse(QueueEntry {
                priority: transfer.priority,
                queue_time: transfer.queue_time,
                id: transfer.id,
            }));
        }
        Ok(())
    }

    /// One iteration: reload, pop the most urgent transfer, walk it through
    /// the dispatch rules.
    pub async fn step(&mut self) -> Result<StepOutcome> {
        self.reload().await?;
        let Some(Reverse(entry)) = self.queue.pop() else {
            return Ok(StepOutcome::Idle);
        };
        let mut transfer = match self.services.store.transfer(entry.id).await {
            Ok(transfer) => transfer,
            Err(e) => {
                warn!(transfer = entry.id, error = %e, "queued transfer vanished");
                self.queued.remove(&entry.id);
                return Ok(StepOutcome::Pruned);
            }
        };
        let now = Utc::now();

        // Expiry wins over every retry rule.
        if transfer.status != TransferStatus::Exec && transfer.expired_at(now) {
            transfer.status = TransferStatus::Fail;
            transfer.finish_time = Some(now);
            transfer.comment = Some("File expired before transmission".to_owned());
            self.persist_with_history(&transfer).await?;
            self.queued.remove(&entry.id);
            return Ok(StepOutcome::Pruned);
        }

        // A failed retrieval must not loop silently through RETR.
        if self.destination.acquisition
            && transfer.status == TransferStatus::Retr
            && !self.destination.requeue_on_failure
        {
            let file = self.services.store.data_file(transfer.data_file).await?;
            if !file.downloaded {
                transfer.status = TransferStatus::Fail;
                transfer.finish_time = Some(now);
                transfer.comment =
                    Some("File was not retrieved and requeue on failure is not allowed".to_owned());
                self.persist_with_history(&transfer).await?;
                self.queued.remove(&entry.id);
                return Ok(StepOutcome::Pruned);
            }
        }

        if transfer.status.is_parked() || transfer.queue_time > now {
            self.queued.remove(&entry.id);
            return Ok(StepOutcome::Pruned);
        }

        if !self.provider.available() {
            self.queue.push(Reverse(entry));
            return Ok(StepOutcome::Delayed);
        }

        if transfer.start_count >= self.destination.max_start {
            let outcome = self.delay_or_fail(transfer).await?;
            self.queued.remove(&entry.id);
            return Ok(outcome);
        }

        let retried = transfer.status == TransferStatus::Retr;
        if retried {
            if !self.provider.next(&transfer).await? {
                // Destination was put on hold by the provider.
                self.queue.push(Reverse(entry));
                return Ok(StepOutcome::Stopped);
            }
            if self.token.is_cancelled() {
                self.queue.push(Reverse(entry));
                return Ok(StepOutcome::Stopped);
            }
            transfer.status = TransferStatus::Wait;
        } else if transfer.status == TransferStatus::Intr {
            transfer.status = TransferStatus::Wait;
        }

        if let Some(rule) = self.destination.requeue_on.clone()
            && let Some(winner) = self.duplicate_winner(&transfer, retried, &rule).await?
        {
            let file = self.services.store.data_file(winner.data_file).await?;
            transfer.status = TransferStatus::Hold;
            transfer.finish_time = Some(now);
            transfer.comment = Some(format!(
                "Duplicate file found dated {} sized {} bytes (DataTransferId={}) with rule '{}' false",
                winner.scheduled_time.format("%Y-%m-%d %H:%M:%S"),
                file.size,
                winner.id,
                rule
            ));
            self.persist_with_history(&transfer).await?;
            self.queued.remove(&entry.id);
            return Ok(StepOutcome::Pruned);
        }

        self.dispatch(transfer, retried).await
    }

    async fn persist_with_history(&self, transfer: &DataTransfer) -> Result<()> {
        self.services.store.update_transfer(transfer).await?;
        if let Some(comment) = &transfer.comment {
            self.services
                .history
                .record(transfer, transfer.status, comment)
                .await;
        }
        Ok(())
    }

    /// Max-start ceiling: delay the transfer, or fail it when the requeue
    /// budget is spent too.
    async fn delay_or_fail(&mut self, mut transfer: DataTransfer) -> Result<StepOutcome> {
        let now = Utc::now();
        transfer.requeue_count += 1;
        transfer.requeue_history += 1;
        if transfer.requeue_count > self.destination.max_requeue {
            transfer.status = TransferStatus::Fail;
            transfer.finish_time = Some(now);
            transfer.comment = Some(format!(
                "Maximum requeue limit reached (stopped after {} attempt(s))",
                transfer.requeue_count
            ));
            self.persist_with_history(&transfer).await?;
            return Ok(StepOutcome::Pruned);
        }
        let delay = chrono::Duration::from_std(self.destination.start_frequency)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let until = now + delay;
        transfer.queue_time = until;
        transfer.start_count = 0;
        transfer.status = TransferStatus::Retr;
        transfer.comment = Some(format!(
            "Maximum start limit reached (delayed until {})",
            until.format("%Y-%m-%d %H:%M:%S")
        ));
        self.persist_with_history(&transfer).await?;
        let snapshot = {
            let mut value = self.value.lock();
            value.has_requeued = true;
            value.clone()
        };
        self.services.store.update_scheduler_value(&snapshot).await?;
        Ok(StepOutcome::Pruned)
    }

    async fn dispatch(&mut self, mut transfer: DataTransfer, retried: bool) -> Result<StepOutcome> {
        let host = match self.provider.host() {
            Ok(host) => host,
            Err(SchedulerError::NoHostAvailable { reason }) => {
                warn!(destination = %self.destination.name, reason, "no hosts available");
                self.request_shutdown_internal(Duration::ZERO, false, "no hosts available");
                return Ok(StepOutcome::Stopped);
            }
            Err(e) => return Err(e),
        };
        let file = self.services.store.data_file(transfer.data_file).await?;
        let selection = match self
            .selector
            .resolve(
                &self.destination.name,
                Some(file.file_system),
                None,
                &self.destination.name,
                Some(&host),
            )
            .await
        {
            Ok(selection) => selection,
            Err(e)
                if e.is_capacity() || matches!(e, SchedulerError::GroupNotAvailable { .. }) =>
            {
                warn!(transfer = transfer.id, error = %e, "no mover for transfer");
                self.services
                    .history
                    .record(&transfer, TransferStatus::Stop, &e.to_string())
                    .await;
                transfer.status = TransferStatus::Retr;
                transfer.finish_time = Some(Utc::now());
                transfer.comment =
                    Some("No Transfer Server available (Transfer Group might be empty?)".to_owned());
                self.services.store.update_transfer(&transfer).await?;
                self.services
                    .history
                    .record(
                        &transfer,
                        TransferStatus::Retr,
                        "Requeued by the scheduler because no Transfer Server was available",
                    )
                    .await;
                self.queued.remove(&transfer.id);
                return Ok(StepOutcome::Delayed);
            }
            Err(e) => return Err(e),
        };

        let mut servers = selection.servers;
        if retried || transfer.start_count > 0 {
            shuffle_servers(&mut servers);
        } else if let Some(original) = transfer.original_server_name.clone()
            && let Some(position) = servers.iter().position(|s| s.name == original)
        {
            let preferred = servers.remove(position);
            servers.insert(0, preferred);
        }

        // A proxy host must still be one of the destination's proxies.
        if let Some(proxy) = transfer.proxy_host_name.clone() {
            let proxies = self
                .services
                .store
                .destination_hosts(&self.destination.name, HostKind::Proxy)
                .await?;
            if !proxies.iter().any(|h| h.name == proxy) {
                warn!(transfer = transfer.id, proxy, "proxy host no longer configured");
                transfer.proxy_host_name = None;
            }
        }

        let now = Utc::now();
        transfer.host_name = Some(host.name.clone());
        transfer.status = TransferStatus::Exec;
        transfer.start_time = Some(now);
        transfer.retry_time = Some(now);
        transfer.start_count += 1;
        transfer.comment = None;
        self.services.store.update_transfer(&transfer).await?;
        self.update_count(&transfer, true).await?;
        if self.destination.mail_on_start {
            self.services.notifier.transfer_started(&transfer).await;
        }

        let host_for_source = match &file.source_host_name {
            Some(name) => Some(self.services.store.host(name).await?),
            None => None,
        };
        let sent = self
            .orchestrator
            .put(&servers, &mut transfer, host_for_source.as_ref())
            .await?;
        if sent {
            debug!(
                transfer = transfer.id,
                server = ?transfer.server_name,
                host = %host.nickname,
                "transfer queued on DataMover"
            );
            self.services.store.update_transfer(&transfer).await?;
            self.queued.remove(&transfer.id);
            self.in_flight.insert(transfer.id);
            return Ok(StepOutcome::Dispatched);
        }

        let diagnostic = if transfer.comment.is_some() {
            "Transfer request failed on all DataMover(s)"
        } else {
            "No DataMover available for transfer request"
        };
        transfer.status = TransferStatus::Retr;
        transfer.finish_time = Some(Utc::now());
        self.update_count(&transfer, false).await?;
        transfer.comment = Some(diagnostic.to_owned());
        self.persist_with_history(&transfer).await?;
        self.queued.remove(&transfer.id);
        Ok(StepOutcome::Delayed)
    }

    /// Bridges transfer starts and completions into the provider and the
    /// persisted bookkeeping.
    pub async fn update_count(&mut self, transfer: &DataTransfer, started: bool) -> Result<()> {
        let emergency = self.provider.update(transfer, started).await?;
        if emergency {
            self.request_shutdown_internal(
                Duration::ZERO,
                false,
                "connection accounting underflow",
            );
        }
        if started {
            return Ok(());
        }
        self.in_flight.remove(&transfer.id);
        self.queued.remove(&transfer.id);
        let snapshot = {
            let mut value = self.value.lock();
            if transfer.status == TransferStatus::Done {
                value.last_transfer_ok = Some(transfer.id);
            } else {
                value.last_transfer_ko = Some(transfer.id);
            }
            value.clone()
        };
        self.services.store.update_scheduler_value(&snapshot).await?;
        if transfer.status == TransferStatus::Done && snapshot.has_requeued {
            self.reschedule_delayed().await?;
        }
        Ok(())
    }

    /// After a success following a max-start delay, push delayed transfers
    /// back to their original schedule in one pass.
    async fn reschedule_delayed(&mut self) -> Result<()> {
        let now = Utc::now();
        for mut delayed in self
            .services
            .store
            .delayed_transfers(&self.destination.name)
            .await?
        {
            if delayed.queue_time > now && !delayed.status.is_parked() {
                info!(
                    transfer = delayed.id,
                    "rescheduling delayed transfer to its original time"
                );
                delayed.queue_time = delayed.scheduled_time;
                self.services.store.update_transfer(&delayed).await?;
            }
        }
        let snapshot = {
            let mut value = self.value.lock();
            value.has_requeued = false;
            value.clone()
        };
        self.services.store.update_scheduler_value(&snapshot).await?;
        self.wakeup.notify_one();
        Ok(())
    }

    fn request_shutdown_internal(&self, timeout: Duration, reset: bool, comment: &str) {
        let mut slot = self.shutdown.lock();
        *slot = Some(ShutdownState {
            timeout,
            reset,
            comment: comment.to_owned(),
        });
    }

    /// Drains in-flight transfers up to the (live) shutdown timeout, then
    /// force-requeues whatever is still executing.
    pub async fn perform_shutdown(&mut self) -> Result<()> {
        let started = Instant::now();
        while !self.in_flight.is_empty() {
            let timeout = self
                .shutdown
                .lock()
                .as_ref()
                .map(|s| s.timeout)
                .unwrap_or(Duration::ZERO);
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                break;
            }
            let slice = (timeout - elapsed).min(Duration::from_secs(1));
            tokio::select! {
                message = self.rx.recv() => {
                    if let Some(message) = message {
                        self.handle_message(message).await;
                    }
                }
                _ = tokio::time::sleep(slice) => {}
            }
        }
        let state = self.shutdown.lock().clone().unwrap_or(ShutdownState {
            timeout: Duration::ZERO,
            reset: false,
            comment: "shutdown".to_owned(),
        });
        info!(
            destination = %self.destination.name,
            reset = state.reset,
            comment = %state.comment,
            remaining = self.in_flight.len(),
            "worker shutting down"
        );
        if state.reset {
            let snapshot = {
                let mut value = self.value.lock();
                value.start_count = 0;
                value.host_name = None;
                value.clone()
            };
            self.services.store.update_scheduler_value(&snapshot).await?;
        }
        for id in std::mem::take(&mut self.in_flight) {
            let mut transfer = match self.services.store.transfer(id).await {
                Ok(transfer) => transfer,
                Err(e) => {
                    warn!(transfer = id, error = %e, "in-flight transfer vanished");
                    continue;
                }
            };
            if transfer.status == TransferStatus::Exec {
                transfer.status = TransferStatus::Retr;
                transfer.finish_time = Some(Utc::now());
                transfer.user_status = None;
                transfer.comment =
                    Some("Requeued by the scheduler after a Destination shutdown".to_owned());
                self.persist_with_history(&transfer).await?;
            }
        }
        self.token.cancel();
        Ok(())
    }

    async fn compare(
        &self,
        rule: &str,
        first: &DataTransfer,
        second: &DataTransfer,
    ) -> Result<bool> {
        let first_file = self.services.store.data_file(first.data_file).await?;
        let second_file = self.services.store.data_file(second.data_file).await?;
        let expression = rule
            .replace("$time2", &second_file.file_time.timestamp_millis().to_string())
            .replace("$size2", &second_file.size.to_string())
            .replace("$time1", &first_file.file_time.timestamp_millis().to_string())
            .replace("$size1", &first_file.size.to_string())
            .replace("$destination", &first.destination)
            .replace("$target", &first.target);
        self.services.evaluator.evaluate(&expression).await
    }

    /// Resolves which same-target transfer should actually be delivered.
    ///
    /// Returns the sibling that beats the current transfer, or `None` when
    /// the current transfer wins.
    async fn duplicate_winner(
        &self,
        current: &DataTransfer,
        retried: bool,
        rule: &str,
    ) -> Result<Option<DataTransfer>> {
        let siblings = self
            .services
            .store
            .transfers_by_target(&current.destination, &current.target)
            .await?;
        let mut candidates = Vec::new();
        for sibling in siblings {
            if sibling.id == current.id {
                continue;
            }
            if !self.compare(rule, &sibling, current).await? {
                candidates.push(sibling);
            }
        }
        if candidates.is_empty() {
            return Ok(None);
        }
        for sibling in &candidates {
            if self.compare(rule, current, sibling).await? {
                return Ok(Some(sibling.clone()));
            }
        }
        let mut running = Vec::new();
        for sibling in &candidates {
            if matches!(
                sibling.status,
                TransferStatus::Done | TransferStatus::Exec | TransferStatus::Retr
            ) {
                if !retried {
                    // A copy already moving beats one that never started.
                    return Ok(Some(sibling.clone()));
                }
                running.push(sibling.clone());
            }
        }
        let pool = if retried {
            if running.is_empty() {
                return Ok(None);
            }
            running
        } else {
            candidates
        };
        Ok(pool
            .into_iter()
            .max_by_key(|sibling| sibling.id)
            .filter(|sibling| sibling.id > current.id))
    }
}

fn shuffle_servers(servers: &mut [TransferServer]) {
    servers.shuffle(&mut rand::rng());
}
