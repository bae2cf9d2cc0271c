//! Top-level scheduling loop: worker pool management and crash recovery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::model::{DataTransfer, Destination};
use crate::orchestrator::{DownloadCounters, TransferOrchestrator};
use crate::selector::TransferServerSelector;
use crate::services::EngineServices;
use crate::status::{DestinationStatus, TransferStatus};
use crate::worker::{DestinationWorker, WorkerHandle};

struct WorkerEntry {
    handle: WorkerHandle,
    join: JoinHandle<()>,
    /// Destination update time the worker was started with; a later one
    /// means the configuration is dirty.
    seen_update: DateTime<Utc>,
    last_reset: Instant,
}

/// Owns the worker pool; at most one worker per destination.
pub struct SchedulerLoop {
    config: SchedulerConfig,
    services: EngineServices,
    selector: Arc<TransferServerSelector>,
    orchestrator: Arc<TransferOrchestrator>,
    workers: Mutex<HashMap<String, WorkerEntry>>,
    token: CancellationToken,
}

impl SchedulerLoop {
    pub fn new(services: EngineServices, config: SchedulerConfig) -> Self {
        let counters = Arc::new(DownloadCounters::new());
        let selector = Arc::new(TransferServerSelector::new(
            services.store.clone(),
            services.mover.clone(),
            counters.clone(),
            None,
        ));
        let orchestrator = Arc::new(TransferOrchestrator::new(
            services.store.clone(),
            services.mover.clone(),
            services.history.clone(),
            counters,
            selector.clone(),
        ));
        Self {
            config,
            services,
            selector,
            orchestrator,
            workers: Mutex::new(HashMap::new()),
            token: CancellationToken::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn worker_handle(&self, destination: &str) -> Option<WorkerHandle> {
        self.workers
            .lock()
            .get(destination)
            .map(|entry| entry.handle.clone())
    }

    /// Reclassifies transfers left over from an ungraceful process stop.
    ///
    /// Must run once before the first tick.
    pub async fn recover(&self) -> Result<()> {
        for mut transfer in self.services.store.interrupted_transfers(None).await? {
            let comment = match transfer.status {
                TransferStatus::Init => {
                    transfer.status = TransferStatus::Intr;
                    transfer.deleted = true;
                    "Interrupted by Master Server shutdown while arriving"
                }
                TransferStatus::Fetc => {
                    let mut file = self.services.store.data_file(transfer.data_file).await?;
                    file.downloaded = false;
                    self.services.store.update_data_file(&file).await?;
                    transfer.status = TransferStatus::Sche;
                    "Rescheduled by the scheduler after a Master Server restart"
                }
                TransferStatus::Exec | TransferStatus::Intr => {
                    transfer.status = TransferStatus::Retr;
                    transfer.finish_time = Some(Utc::now());
                    transfer.user_status = None;
                    "Requeued by the scheduler after a Master Server restart"
                }
                _ => continue,
            };
            info!(transfer = transfer.id, status = %transfer.status, comment, "crash recovery");
            transfer.comment = Some(comment.to_owned());
            self.services.store.update_transfer(&transfer).await?;
            self.services
                .history
                .record(&transfer, transfer.status, comment)
                .await;
        }
        Ok(())
    }

    /// One scheduling pass over all destinations.
    pub async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        self.workers.lock().retain(|name, entry| {
            let alive = !entry.join.is_finished();
            if !alive {
                debug!(destination = %name, "worker finished");
            }
            alive
        });
        let look_ahead = chrono::Duration::from_std(self.config.look_ahead)
            .unwrap_or_else(|_| chrono::Duration::zero());
        for destination in self.services.store.destinations().await? {
            if !destination.active || destination.min_queue_time > now {
                continue;
            }
            if !matches!(
                destination.status,
                DestinationStatus::Exec | DestinationStatus::Wait | DestinationStatus::Idle
            ) {
                continue;
            }
            let running = {
                let mut workers = self.workers.lock();
                workers.get_mut(&destination.name).map(|entry| {
                    let reset_due = !destination.reset_frequency.is_zero()
                        && entry.last_reset.elapsed() >= destination.reset_frequency;
                    if reset_due {
                        entry.last_reset = Instant::now();
                    }
                    (entry.handle.clone(), entry.seen_update, reset_due)
                })
            };
            if let Some((handle, seen_update, reset_due)) = running {
                if destination.stop_if_dirty && destination.update_time > seen_update {
                    handle.request_shutdown(
                        self.config.dirty_shutdown_timeout,
                        true,
                        "configuration update detected",
                    );
                    continue;
                }
                if reset_due {
                    handle.request_reset();
                }
                if self
                    .services
                    .store
                    .pending_transfer_count(&destination.name, now + look_ahead)
                    .await?
                    > 0
                {
                    handle.wake();
                }
                continue;
            }
            // A sleeping destination only wakes up for actual work.
            if destination.status == DestinationStatus::Idle
                && self
                    .services
                    .store
                    .pending_transfer_count(&destination.name, now + look_ahead)
                    .await?
                    == 0
            {
                continue;
            }
            if self.workers.lock().len() >= self.config.pool_size {
                warn!(
                    destination = %destination.name,
                    pool_size = self.config.pool_size,
                    "worker pool exhausted, destination delayed to the next cycle"
                );
                continue;
            }
            self.spawn_worker(destination).await?;
        }
        Ok(())
    }

    async fn spawn_worker(&self, destination: Destination) -> Result<()> {
        // Whatever a previous worker left mid-flight goes back to the queue.
        for mut transfer in self
            .services
            .store
            .interrupted_transfers(Some(&destination.name))
            .await?
        {
            if matches!(
                transfer.status,
                TransferStatus::Exec | TransferStatus::Intr
            ) {
                transfer.status = TransferStatus::Retr;
                transfer.finish_time = Some(Utc::now());
                transfer.user_status = None;
                let comment = "Requeued by the scheduler after a Destination restart";
                transfer.comment = Some(comment.to_owned());
                self.services.store.update_transfer(&transfer).await?;
                self.services
                    .history
                    .record(&transfer, transfer.status, comment)
                    .await;
            }
        }
        let name = destination.name.clone();
        let seen_update = destination.update_time;
        match DestinationWorker::new(
            destination,
            self.services.clone(),
            self.selector.clone(),
            self.orchestrator.clone(),
            self.config.clone(),
        )
        .await
        {
            Ok((worker, handle)) => {
                self.services
                    .store
                    .update_destination_status(&name, DestinationStatus::Exec)
                    .await?;
                info!(destination = %name, "starting destination worker");
                let join = tokio::spawn(worker.run());
                self.workers.lock().insert(
                    name,
                    WorkerEntry {
                        handle,
                        join,
                        seen_update,
                        last_reset: Instant::now(),
                    },
                );
            }
            Err(SchedulerError::NoHostAvailable { reason }) => {
                warn!(destination = %name, reason, "no hosts available");
                self.services
                    .store
                    .update_destination_status(&name, DestinationStatus::Fail)
                    .await?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Runs recovery then ticks until cancelled.
    pub async fn run(&self) {
        if let Err(e) = self.recover().await {
            warn!(error = %e, "crash recovery failed");
        }
        info!("scheduler loop started");
        loop {
            if self.token.is_cancelled() {
                break;
            }
            if let Err(e) = self.tick().await {
                warn!(error = %e, "scheduler tick failed");
            }
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(self.config.tick) => {}
            }
        }
        info!("scheduler loop stopped");
    }

    /// Routes a mover completion report to the owning worker.
    pub fn notify_completion(&self, transfer: DataTransfer) -> bool {
        match self.worker_handle(&transfer.destination) {
            Some(handle) => {
                handle.notify_completion(transfer);
                true
            }
            None => {
                debug!(
                    transfer = transfer.id,
                    destination = %transfer.destination,
                    "completion for a destination with no worker"
                );
                false
            }
        }
    }

    /// Routes an external requeue (operator action) to the owning worker.
    pub fn notify_requeue(&self, transfer: DataTransfer) -> bool {
        match self.worker_handle(&transfer.destination) {
            Some(handle) => {
                handle.notify_requeue(transfer);
                handle.wake();
                true
            }
            None => false,
        }
    }

    /// Shuts every worker down and stops the loop.
    pub fn shutdown(&self, timeout: Duration, comment: &str) {
        for entry in self.workers.lock().values() {
            entry.handle.request_shutdown(timeout, false, comment);
        }
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memstore::MemStore;
    use crate::services::{
        MockPredicateEvaluator, NullMonitorSink, NullNotificationSink, Persistence,
    };
    use crate::testsupport::{
        RecordingHistory, data_file, destination, group, host, server, transfer,
    };
    use crate::testsupport::FakeMover;

    struct Rig {
        store: Arc<MemStore>,
        history: Arc<RecordingHistory>,
        scheduler: SchedulerLoop,
    }

    fn rig(config: SchedulerConfig) -> Rig {
        let store = Arc::new(MemStore::new());
        store.add_group(group("g", 1, None, None));
        store.add_server(server("s1", "g", true));
        let mover = Arc::new(FakeMover::new());
        mover.connect("s1");
        let history = Arc::new(RecordingHistory::new());
        let services = EngineServices {
            store: store.clone(),
            mover,
            history: history.clone(),
            notifier: Arc::new(NullNotificationSink),
            monitor: Arc::new(NullMonitorSink),
            evaluator: Arc::new(MockPredicateEvaluator::new()),
        };
        Rig {
            store,
            history,
            scheduler: SchedulerLoop::new(services, config),
        }
    }

    fn eligible_destination(r: &Rig, name: &str) {
        r.store.add_destination(destination(name));
        let mut h = host(&format!("{name}-h1"), 2, std::time::Duration::ZERO);
        h.transfer_group = Some("g".into());
        r.store.attach_host(name, h);
    }

    #[tokio::test]
    async fn recovery_reclassifies_crashed_transfers() {
        let r = rig(SchedulerConfig::default());
        eligible_destination(&r, "x");
        for (id, status) in [
            (1, TransferStatus::Init),
            (2, TransferStatus::Fetc),
            (3, TransferStatus::Exec),
            (4, TransferStatus::Intr),
        ] {
            let mut t = transfer(id, "x", &format!("t{id}"), 50);
            t.status = status;
            r.store.add_data_file(data_file(id, "g", 0));
            r.store.add_transfer(t);
        }

        r.scheduler.recover().await.unwrap();

        let arriving = r.store.transfer(1).await.unwrap();
        assert_eq!(arriving.status, TransferStatus::Intr);
        assert!(arriving.deleted);
        assert!(
            arriving
                .comment
                .unwrap()
                .contains("Interrupted by Master Server shutdown while arriving")
        );

        let fetching = r.store.transfer(2).await.unwrap();
        assert_eq!(fetching.status, TransferStatus::Sche);
        assert!(!r.store.data_file(2).await.unwrap().downloaded);

        for id in [3, 4] {
            let requeued = r.store.transfer(id).await.unwrap();
            assert_eq!(requeued.status, TransferStatus::Retr);
            assert_eq!(
                requeued.comment.unwrap(),
                "Requeued by the scheduler after a Master Server restart"
            );
        }
        assert!(r.history.contains("Master Server restart"));
    }

    #[tokio::test]
    async fn pool_cap_bounds_worker_creation() {
        let config = SchedulerConfig {
            pool_size: 2,
            ..SchedulerConfig::default()
        };
        let r = rig(config);
        for name in ["d1", "d2", "d3"] {
            eligible_destination(&r, name);
        }

        r.scheduler.tick().await.unwrap();
        assert_eq!(r.scheduler.worker_count(), 2);
        // The same two stay; the third keeps waiting for a slot.
        r.scheduler.tick().await.unwrap();
        assert_eq!(r.scheduler.worker_count(), 2);
        assert!(r.scheduler.worker_handle("d1").is_some());
        assert!(r.scheduler.worker_handle("d2").is_some());
        assert!(r.scheduler.worker_handle("d3").is_none());
    }

    #[tokio::test]
    async fn one_worker_per_destination() {
        let r = rig(SchedulerConfig::default());
        eligible_destination(&r, "x");
        r.scheduler.tick().await.unwrap();
        r.scheduler.tick().await.unwrap();
        assert_eq!(r.scheduler.worker_count(), 1);
    }

    #[tokio::test]
    async fn destination_without_hosts_is_failed() {
        let r = rig(SchedulerConfig::default());
        r.store.add_destination(destination("empty"));

        r.scheduler.tick().await.unwrap();
        assert_eq!(r.scheduler.worker_count(), 0);
        assert_eq!(
            r.store.destination("empty").await.unwrap().status,
            DestinationStatus::Fail
        );
    }

    #[tokio::test]
    async fn dirty_configuration_triggers_a_resetting_shutdown() {
        let r = rig(SchedulerConfig::default());
        eligible_destination(&r, "x");
        r.scheduler.tick().await.unwrap();
        assert_eq!(r.scheduler.worker_count(), 1);

        let mut updated = r.store.destination("x").await.unwrap();
        updated.stop_if_dirty = true;
        updated.update_time = Utc::now() + chrono::Duration::seconds(5);
        r.store.add_destination(updated);

        r.scheduler.tick().await.unwrap();
        let handle = r.scheduler.worker_handle("x").unwrap();
        let state = handle.shutdown_state().unwrap();
        assert!(state.reset);
        assert_eq!(state.comment, "configuration update detected");
    }

    #[tokio::test]
    async fn spawn_requeues_transfers_from_a_dead_worker() {
        let r = rig(SchedulerConfig::default());
        eligible_destination(&r, "x");
        let mut stuck = transfer(1, "x", "a", 50);
        stuck.status = TransferStatus::Exec;
        // Kept out of the pending window so the fresh worker cannot pick it
        // up again before the assertions run.
        stuck.queue_time = Utc::now() + chrono::Duration::hours(1);
        r.store.add_data_file(data_file(1, "g", 0));
        r.store.add_transfer(stuck);

        r.scheduler.tick().await.unwrap();
        let requeued = r.store.transfer(1).await.unwrap();
        assert_eq!(requeued.status, TransferStatus::Retr);
        assert_eq!(
            requeued.comment.unwrap(),
            "Requeued by the scheduler after a Destination restart"
        );
    }

    #[tokio::test]
    async fn completion_for_unknown_destination_is_reported() {
        let r = rig(SchedulerConfig::default());
        let t = transfer(1, "ghost", "a", 50);
        assert!(!r.scheduler.notify_completion(t));
    }
}
