//! Runs the scheduling engine against an in-memory store with simulated
//! movers, as a smoke test and a living example of the wiring.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

use fanout::{
    DataFile, DataTransfer, Destination, DestinationStatus, EngineServices, HistorySink, Host,
    HostKind, MemStore, MonitorSink, MoverControl, MoverError, NotificationSink, OnHostFailure,
    PredicateEvaluator, SchedulerConfig, SchedulerLoop, StatusColor, StatusMonitor, TransferGroup,
    TransferServer, TransferStatus,
};

#[derive(Parser)]
#[command(name = "fanout", about = "Transfer scheduling engine simulation")]
struct Args {
    /// Number of simulated destinations.
    #[arg(long, default_value_t = 3)]
    destinations: usize,

    /// Movers in the simulated transfer group.
    #[arg(long, default_value_t = 2)]
    movers: usize,

    /// Transfers queued per destination.
    #[arg(long, default_value_t = 10)]
    transfers: usize,

    /// Probability that a mover rejects a put.
    #[arg(long, default_value_t = 0.1)]
    failure_rate: f64,

    /// How long to run the simulation, in seconds.
    #[arg(long, default_value_t = 20)]
    duration: u64,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// A mover that sleeps a little and fails a configurable fraction of puts.
struct SimulatedMover {
    failure_rate: f64,
}

#[async_trait]
impl MoverControl for SimulatedMover {
    async fn put(
        &self,
        server: &TransferServer,
        transfer: &DataTransfer,
        _host_for_source: Option<&Host>,
    ) -> Result<(), MoverError> {
        let (latency_ms, fails) = {
            use rand::RngExt;
            let mut rng = rand::rng();
            (
                rng.random_range(10..60u64),
                rng.random_range(0.0..1.0) < self.failure_rate,
            )
        };
        tokio::time::sleep(Duration::from_millis(latency_ms)).await;
        if fails {
            return Err(MoverError::connectivity(format!(
                "simulated connection failure on {}",
                server.name
            )));
        }
        info!(transfer = transfer.id, server = %server.name, "simulated put accepted");
        Ok(())
    }

    async fn download(
        &self,
        _server: &TransferServer,
        _transfer: &DataTransfer,
        _file: &DataFile,
        _host_for_source: Option<&Host>,
    ) -> Result<(), MoverError> {
        Ok(())
    }

    async fn replicate(
        &self,
        _server: &TransferServer,
        _host_for_replication: &Host,
        _file: &DataFile,
    ) -> Result<(), MoverError> {
        Ok(())
    }

    async fn filter(
        &self,
        _server: &TransferServer,
        _file: &DataFile,
        _remove: bool,
    ) -> Result<(), MoverError> {
        Ok(())
    }

    async fn purge(&self, _server: &TransferServer, _file: &DataFile) -> Result<(), MoverError> {
        Ok(())
    }

    async fn size(
        &self,
        _server: &TransferServer,
        _host: &Host,
        _source: &str,
    ) -> Result<u64, MoverError> {
        Ok(0)
    }

    async fn del(
        &self,
        _server: &TransferServer,
        _host: &Host,
        _source: &str,
    ) -> Result<(), MoverError> {
        Ok(())
    }

    async fn mkdir(
        &self,
        _server: &TransferServer,
        _host: &Host,
        _dir: &str,
    ) -> Result<(), MoverError> {
        Ok(())
    }

    async fn rmdir(
        &self,
        _server: &TransferServer,
        _host: &Host,
        _dir: &str,
    ) -> Result<(), MoverError> {
        Ok(())
    }

    async fn move_file(
        &self,
        _server: &TransferServer,
        _host: &Host,
        _source: &str,
        _target: &str,
    ) -> Result<(), MoverError> {
        Ok(())
    }

    async fn check(
        &self,
        _server: &TransferServer,
        _transfer: &DataTransfer,
    ) -> Result<(), MoverError> {
        Ok(())
    }

    async fn list(
        &self,
        _server: &TransferServer,
        _host: &Host,
        _directory: &str,
    ) -> Result<Vec<String>, MoverError> {
        Ok(Vec::new())
    }

    async fn is_connected(&self, _server_name: &str) -> bool {
        true
    }
}

struct LogHistory;

#[async_trait]
impl HistorySink for LogHistory {
    async fn record(&self, transfer: &DataTransfer, status: TransferStatus, comment: &str) {
        info!(
            transfer = transfer.id,
            status = %status,
            comment,
            "history"
        );
    }
}

struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn transfer_started(&self, transfer: &DataTransfer) {
        info!(transfer = transfer.id, "transfer started");
    }
}

struct LogMonitor;

#[async_trait]
impl MonitorSink for LogMonitor {
    async fn destination_color(&self, destination: &str, color: StatusColor) {
        info!(destination, color = %color, "monitor");
    }
}

/// No duplicate-suppression rules are configured in the simulation.
struct NeverSuppress;

#[async_trait]
impl PredicateEvaluator for NeverSuppress {
    async fn evaluate(&self, _expression: &str) -> fanout::Result<bool> {
        Ok(false)
    }
}

fn make_destination(name: &str) -> Destination {
    Destination {
        name: name.to_owned(),
        status: DestinationStatus::Wait,
        active: true,
        max_connections: 5,
        max_start: 5,
        max_requeue: 3,
        retry_count: -1,
        retry_frequency: Duration::from_secs(1),
        reset_frequency: Duration::from_secs(600),
        start_frequency: Duration::from_secs(60),
        monitor: true,
        stop_if_dirty: false,
        update_time: Utc::now(),
        min_queue_time: Utc::now() - chrono::Duration::hours(1),
        transfer_group: None,
        on_host_failure: OnHostFailure::NextAndRetry,
        requeue_on: None,
        acquisition: false,
        requeue_on_failure: false,
        mail_on_start: true,
    }
}

fn make_host(name: &str, group: &str) -> Host {
    Host {
        name: name.to_owned(),
        nickname: name.to_owned(),
        address: format!("{name}.example.int"),
        retry_count: 2,
        retry_frequency: Duration::from_secs(1),
        max_connections: -1,
        kind: HostKind::Dissemination,
        active: true,
        transfer_group: Some(group.to_owned()),
        mover_list: None,
        mover_list_for_backup: None,
    }
}

fn populate(store: &MemStore, args: &Args) -> usize {
    store.add_group(TransferGroup {
        name: "internet".to_owned(),
        active: true,
        volume_count: 2,
        min_replication_count: 1,
        min_filtering_count: 1,
        cluster_name: None,
        cluster_weight: None,
    });
    for i in 1..=args.movers {
        store.add_server(TransferServer {
            name: format!("mover{i}"),
            transfer_group: "internet".to_owned(),
            active: true,
            replicate: true,
            host_for_replication: None,
        });
    }
    let now = Utc::now();
    let mut next_id: i64 = 0;
    for d in 1..=args.destinations {
        let name = format!("dest{d}");
        store.add_destination(make_destination(&name));
        store.attach_host(&name, make_host(&format!("{name}-primary"), "internet"));
        store.attach_host(&name, make_host(&format!("{name}-fallback"), "internet"));
        for t in 1..=args.transfers {
            next_id += 1;
            store.add_data_file(DataFile {
                id: next_id,
                size: 1024 * t as u64,
                checksum: None,
                file_time: now,
                transfer_group: "internet".to_owned(),
                file_system: (t % 2) as u32,
                downloaded: true,
                delete_original: false,
                source_host_name: None,
            });
            store.add_transfer(DataTransfer {
                id: next_id,
                target: format!("products/{name}/file-{t}.grib"),
                destination: name.clone(),
                data_file: next_id,
                status: TransferStatus::Wait,
                priority: (t % 3) as i32 * 30,
                queue_time: now,
                scheduled_time: now,
                retry_time: None,
                expiry_time: now + chrono::Duration::days(1),
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
            });
        }
    }
    next_id as usize
}

/// Marks executing transfers done shortly after dispatch, standing in for
/// the completion reports a real mover would send back.
async fn drive_completions(store: Arc<MemStore>, scheduler: Arc<SchedulerLoop>, total: usize) {
    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        for id in 1..=total as i64 {
            let Ok(mut transfer) = fanout::Persistence::transfer(store.as_ref(), id).await else {
                continue;
            };
            if transfer.status != TransferStatus::Exec {
                continue;
            }
            let Some(started) = transfer.start_time else {
                continue;
            };
            if Utc::now().signed_duration_since(started) < chrono::Duration::milliseconds(300) {
                continue;
            }
            transfer.status = TransferStatus::Done;
            transfer.finish_time = Some(Utc::now());
            if fanout::Persistence::update_transfer(store.as_ref(), &transfer)
                .await
                .is_ok()
            {
                scheduler.notify_completion(transfer);
            }
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let store = Arc::new(MemStore::new());
    let total = populate(&store, &args);
    info!(
        destinations = args.destinations,
        movers = args.movers,
        transfers = total,
        "simulation populated"
    );

    let services = EngineServices {
        store: store.clone(),
        mover: Arc::new(SimulatedMover {
            failure_rate: args.failure_rate,
        }),
        history: Arc::new(LogHistory),
        notifier: Arc::new(LogNotifier),
        monitor: Arc::new(LogMonitor),
        evaluator: Arc::new(NeverSuppress),
    };
    let config = SchedulerConfig {
        tick: Duration::from_millis(500),
        step_delay: Duration::from_millis(500),
        monitor_tick: Duration::from_secs(2),
        ..SchedulerConfig::default()
    };
    let scheduler = Arc::new(SchedulerLoop::new(services.clone(), config.clone()));
    let monitor = Arc::new(StatusMonitor::new(services, config));

    let scheduler_task = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run().await }
    });
    let monitor_task = tokio::spawn({
        let monitor = monitor.clone();
        async move { monitor.run().await }
    });
    let driver = tokio::spawn(drive_completions(store.clone(), scheduler.clone(), total));

    tokio::time::sleep(Duration::from_secs(args.duration)).await;
    info!("simulation time elapsed, shutting down");
    scheduler.shutdown(Duration::from_secs(5), "simulation finished");
    monitor.cancellation_token().cancel();
    driver.abort();
    let _ = scheduler_task.await;
    let _ = monitor_task.await;

    let mut done = 0;
    let mut failed = 0;
    let mut pending = 0;
    for id in 1..=total as i64 {
        if let Ok(transfer) = fanout::Persistence::transfer(store.as_ref(), id).await {
            match transfer.status {
                TransferStatus::Done => done += 1,
                TransferStatus::Fail => failed += 1,
                _ => pending += 1,
            }
        }
    }
    info!(done, failed, pending, "simulation finished");
    Ok(())
}
