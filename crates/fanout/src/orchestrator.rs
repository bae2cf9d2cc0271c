//! Stateless orchestration of remote mover operations.
//!
//! Every remote failure reaches this layer already normalized into
//! [`MoverError`]; the orchestrator turns per-operation failures into
//! transfer state and comments, never into loop-stopping errors.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::{DataFile, DataTransfer, Host, TransferGroup, TransferServer};
use crate::selector::TransferServerSelector;
use crate::services::{HistorySink, MoverControl, Persistence};
use crate::status::TransferStatus;

/// Live per-mover-per-volume in-flight download counts.
///
/// Incremented before a download is issued and decremented by the guard's
/// `Drop`, so counts never leak across failure paths.
#[derive(Default)]
pub struct DownloadCounters {
    counts: Mutex<HashMap<(String, String, u32), usize>>,
}

impl DownloadCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self, group: &str, server: &str, volume: u32) -> usize {
        self.counts
            .lock()
            .get(&(group.to_owned(), server.to_owned(), volume))
            .copied()
            .unwrap_or(0)
    }

    pub fn acquire(
        self: &Arc<Self>,
        group: &str,
        server: &str,
        volume: u32,
    ) -> DownloadGuard {
        let key = (group.to_owned(), server.to_owned(), volume);
        *self.counts.lock().entry(key.clone()).or_insert(0) += 1;
        DownloadGuard {
            counters: Arc::clone(self),
            key,
        }
    }
}

/// Releases one in-flight download slot when dropped.
pub struct DownloadGuard {
    counters: Arc<DownloadCounters>,
    key: (String, String, u32),
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        let mut counts = self.counters.counts.lock();
        if let Some(count) = counts.get_mut(&self.key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&self.key);
            }
        }
    }
}

/// Outcome of a replication or filtering pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOutcome {
    /// Whether the configured minimum was reached.
    pub complete: bool,
    /// Movers holding a copy, the source included.
    pub copies: u32,
}

/// Wraps each remote mover call with uniform failure handling.
pub struct TransferOrchestrator {
    store: Arc<dyn Persistence>,
    mover: Arc<dyn MoverControl>,
    history: Arc<dyn HistorySink>,
    counters: Arc<DownloadCounters>,
    selector: Arc<TransferServerSelector>,
}

impl TransferOrchestrator {
    pub fn new(
        store: Arc<dyn Persistence>,
        mover: Arc<dyn MoverControl>,
        history: Arc<dyn HistorySink>,
        counters: Arc<DownloadCounters>,
        selector: Arc<TransferServerSelector>,
    ) -> Self {
        Self {
            store,
            mover,
            history,
            counters,
            selector,
        }
    }

    pub fn counters(&self) -> Arc<DownloadCounters> {
        Arc::clone(&self.counters)
    }

    /// Tries movers in order until one accepts the transfer.
    ///
    /// The source host is only applied on the last candidate (or when no
    /// original mover is known) to avoid hammering the source prematurely.
    /// Stops early when the transfer was externally interrupted or stopped.
    /// Returns `false` when every mover failed; the transfer comment then
    /// carries the last error.
    pub async fn put(
        &self,
        servers: &[TransferServer],
        transfer: &mut DataTransfer,
        host_for_source: Option<&Host>,
    ) -> Result<bool> {
        let usable: Vec<&TransferServer> = {
            let mut kept = Vec::new();
            for server in servers {
                if server.active && self.mover.is_connected(&server.name).await {
                    kept.push(server);
                }
            }
            kept
        };
        for (i, server) in usable.iter().enumerate() {
            let stored = self.store.transfer(transfer.id).await?;
            if matches!(stored.status, TransferStatus::Intr | TransferStatus::Stop) {
                debug!(
                    transfer = transfer.id,
                    status = %stored.status,
                    "transfer externally interrupted, aborting put"
                );
                break;
            }
            let last = i == usable.len() - 1;
            let source = if last || transfer.original_server_name.is_none() {
                host_for_source
            } else {
                None
            };
            match self.mover.put(server, transfer, source).await {
                Ok(()) => {
                    transfer.server_name = Some(server.name.clone());
                    return Ok(true);
                }
                Err(e) => {
                    warn!(
                        transfer = transfer.id,
                        server = %server.name,
                        error = %e,
                        "put failed on DataMover"
                    );
                    transfer.comment = Some(e.to_string());
                }
            }
        }
        Ok(false)
    }

    /// Retrieves a transfer's payload onto one of the given movers.
    ///
    /// The caller supplies the servers ordered most-suitable-first; the
    /// in-flight counter for the chosen mover/volume is held for the whole
    /// call. An already-expired transfer completes immediately.
    pub async fn download(
        &self,
        servers: &[TransferServer],
        transfer: &DataTransfer,
        file: &mut DataFile,
        host_for_source: Option<&Host>,
    ) -> Result<bool> {
        if transfer.expired_at(Utc::now()) {
            warn!(transfer = transfer.id, "not downloaded before expiration");
            self.history
                .record(transfer, transfer.status, "File expired before retrieval")
                .await;
            return Ok(true);
        }
        for server in servers {
            if !server.active || !self.mover.is_connected(&server.name).await {
                continue;
            }
            let _guard =
                self.counters
                    .acquire(&file.transfer_group, &server.name, file.file_system);
            self.history
                .record(transfer, transfer.status, &format!("Retrieving on {}", server.name))
                .await;
            match self
                .mover
                .download(server, transfer, file, host_for_source)
                .await
            {
                Ok(()) => {
                    file.downloaded = true;
                    self.store.update_data_file(file).await?;
                    return Ok(true);
                }
                Err(e) => {
                    warn!(
                        transfer = transfer.id,
                        server = %server.name,
                        error = %e,
                        "download failed on DataMover"
                    );
                    self.history
                        .record(
                            transfer,
                            transfer.status,
                            &format!("Retrieval failed on {}: {e}", server.name),
                        )
                        .await;
                }
            }
        }
        Ok(false)
    }

    /// Pushes copies of the payload to additional movers until the group's
    /// minimum replication count is reached.
    pub async fn replicate(
        &self,
        source_server: &str,
        servers: &[TransferServer],
        transfer: &DataTransfer,
        file: &DataFile,
        group: &TransferGroup,
    ) -> Result<CopyOutcome> {
        let minimum = group.min_replication_count.min(servers.len() as u32);
        let mut copies = 1u32; // the source mover holds one
        if transfer.expired_at(Utc::now()) {
            warn!(transfer = transfer.id, "not replicated before expiration");
            return Ok(CopyOutcome {
                complete: true,
                copies,
            });
        }
        // Source mover first in the traversal, then skipped.
        let mut ordered: Vec<&TransferServer> = servers.iter().collect();
        ordered.sort_by_key(|s| s.name != source_server);
        for server in ordered {
            if copies >= minimum {
                break;
            }
            if server.name == source_server
                || !server.replicate
                || !self.mover.is_connected(&server.name).await
            {
                continue;
            }
            let Some(host_name) = server.host_for_replication.as_deref() else {
                warn!(server = %server.name, "no replication host configured");
                continue;
            };
            let host = self.store.host(host_name).await?;
            match self.mover.replicate(server, &host, file).await {
                Ok(()) => copies += 1,
                Err(e) => warn!(
                    transfer = transfer.id,
                    server = %server.name,
                    error = %e,
                    "replication failed on DataMover"
                ),
            }
        }
        Ok(CopyOutcome {
            complete: copies >= minimum,
            copies,
        })
    }

    /// Pushes one copy of the payload to a designated backup or proxy host.
    ///
    /// A forced backup-mover spec on the host is resolved through the
    /// selector and the mandatory mover moved to the head of the line.
    pub async fn backup(
        &self,
        host_for_backup: &Host,
        servers: &[TransferServer],
        file: &DataFile,
    ) -> Result<bool> {
        let mut ordered: Vec<TransferServer> = servers.to_vec();
        if let Some(spec) = host_for_backup.mover_list_for_backup.as_deref() {
            let group = host_for_backup
                .transfer_group
                .as_deref()
                .or_else(|| servers.first().map(|s| s.transfer_group.as_str()))
                .unwrap_or_default();
            match self.selector.select_single(group, None, spec).await? {
                Some(forced) => {
                    ordered.retain(|s| s.name != forced.name);
                    ordered.insert(0, forced);
                }
                None => warn!(
                    host = %host_for_backup.nickname,
                    spec,
                    "could not find mandatory backup DataMover"
                ),
            }
        }
        for server in &ordered {
            if !server.active || !self.mover.is_connected(&server.name).await {
                continue;
            }
            match self.mover.replicate(server, host_for_backup, file).await {
                Ok(()) => return Ok(true),
                Err(e) => warn!(
                    server = %server.name,
                    host = %host_for_backup.nickname,
                    error = %e,
                    "backup failed on DataMover"
                ),
            }
        }
        Ok(false)
    }

    /// Runs the content-filtering hook on enough movers.
    ///
    /// The mover currently holding the source copy goes first; `remove`
    /// widens the pass to every mover.
    pub async fn filter(
        &self,
        servers: &[TransferServer],
        file: &DataFile,
        source_server: Option<&str>,
        group: &TransferGroup,
        remove: bool,
    ) -> Result<bool> {
        let minimum = if remove {
            servers.len() as u32
        } else {
            group.min_filtering_count.min(servers.len() as u32)
        };
        let mut ordered: Vec<&TransferServer> = servers.iter().collect();
        if let Some(source) = source_server {
            ordered.sort_by_key(|s| s.name != source);
        }
        let mut filtered = 0u32;
        for server in ordered {
            if filtered >= minimum {
                break;
            }
            if !self.mover.is_connected(&server.name).await {
                continue;
            }
            match self.mover.filter(server, file, remove).await {
                Ok(()) => filtered += 1,
                Err(e) => warn!(
                    server = %server.name,
                    error = %e,
                    "filtering failed on DataMover"
                ),
            }
        }
        Ok(filtered >= minimum)
    }

    /// Deletes a payload's copies across all movers of its group,
    /// tolerating individual failures.
    pub async fn purge(&self, servers: &[TransferServer], file: &DataFile) -> Result<bool> {
        let mut complete = true;
        for server in servers {
            if let Err(e) = self.mover.purge(server, file).await {
                warn!(
                    server = %server.name,
                    file = file.id,
                    error = %e,
                    "purge failed on DataMover"
                );
                complete = false;
            }
        }
        Ok(complete)
    }

    /// Purge through proxy movers: the first success wins.
    pub async fn purge_via_proxy(
        &self,
        servers: &[TransferServer],
        file: &DataFile,
    ) -> Result<bool> {
        for server in servers {
            match self.mover.purge(server, file).await {
                Ok(()) => return Ok(true),
                Err(e) => warn!(
                    server = %server.name,
                    file = file.id,
                    error = %e,
                    "proxy purge failed"
                ),
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memstore::MemStore;
    use crate::services::NullHistorySink;
    use crate::testsupport::{FakeMover, data_file, group, server, transfer};
    use crate::error::MoverError;

    fn orchestrator(
        store: Arc<MemStore>,
        mover: Arc<FakeMover>,
    ) -> (TransferOrchestrator, Arc<DownloadCounters>) {
        let counters = Arc::new(DownloadCounters::new());
        let selector = Arc::new(TransferServerSelector::new(
            store.clone(),
            mover.clone(),
            Arc::clone(&counters),
            None,
        ));
        (
            TransferOrchestrator::new(
                store,
                mover,
                Arc::new(NullHistorySink),
                Arc::clone(&counters),
                selector,
            ),
            counters,
        )
    }

    #[tokio::test]
    async fn put_skips_unusable_servers_and_fails_when_none_left() {
        // [s1 inactive, s2 active+connected], s2 rejects the put: overall
        // failure, with s1 never attempted.
        let store = Arc::new(MemStore::new());
        let mut t = transfer(1, "x", "a/b", 50);
        store.add_transfer(t.clone());
        let mover = Arc::new(FakeMover::new());
        mover.connect("s2");
        mover.fail_server("s2", MoverError::application("disk full"));
        let (orch, _) = orchestrator(store, mover.clone());
        let servers = [server("s1", "g", false), server("s2", "g", true)];
        let ok = orch.put(&servers, &mut t, None).await.unwrap();
        assert!(!ok);
        assert_eq!(mover.calls_for("put"), vec!["s2"]);
        assert!(t.comment.unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn put_records_the_successful_mover() {
        let store = Arc::new(MemStore::new());
        let mut t = transfer(1, "x", "a/b", 50);
        store.add_transfer(t.clone());
        let mover = Arc::new(FakeMover::new());
        mover.connect("s1");
        mover.connect("s2");
        mover.fail_server("s1", MoverError::connectivity("connection refused"));
        let (orch, _) = orchestrator(store, mover);
        let servers = [server("s1", "g", true), server("s2", "g", true)];
        let ok = orch.put(&servers, &mut t, None).await.unwrap();
        assert!(ok);
        assert_eq!(t.server_name.as_deref(), Some("s2"));
    }

    #[tokio::test]
    async fn put_applies_source_host_only_on_last_server() {
        let store = Arc::new(MemStore::new());
        let mut t = transfer(1, "x", "a/b", 50);
        t.original_server_name = Some("s9".into());
        store.add_transfer(t.clone());
        let mover = Arc::new(FakeMover::new());
        mover.connect("s1");
        mover.connect("s2");
        mover.fail_server("s1", MoverError::connectivity("reset"));
        mover.fail_server("s2", MoverError::connectivity("reset"));
        let (orch, _) = orchestrator(store, mover.clone());
        let servers = [server("s1", "g", true), server("s2", "g", true)];
        let source = crate::testsupport::host("src", 1, std::time::Duration::ZERO);
        orch.put(&servers, &mut t, Some(&source)).await.unwrap();
        assert_eq!(mover.put_sources(), vec![None, Some("src".to_owned())]);
    }

    #[tokio::test]
    async fn put_stops_when_transfer_externally_stopped() {
        let store = Arc::new(MemStore::new());
        let mut t = transfer(1, "x", "a/b", 50);
        t.status = TransferStatus::Stop;
        store.add_transfer(t.clone());
        let mover = Arc::new(FakeMover::new());
        mover.connect("s1");
        let (orch, _) = orchestrator(store, mover.clone());
        let servers = [server("s1", "g", true)];
        let ok = orch.put(&servers, &mut t, None).await.unwrap();
        assert!(!ok);
        assert!(mover.calls_for("put").is_empty());
    }

    #[tokio::test]
    async fn download_counter_is_released_on_failure() {
        let store = Arc::new(MemStore::new());
        let t = transfer(1, "x", "a/b", 50);
        let mut file = data_file(1, "g", 0);
        store.add_data_file(file.clone());
        let mover = Arc::new(FakeMover::new());
        mover.connect("s1");
        mover.fail_server("s1", MoverError::connectivity("reset"));
        let (orch, counters) = orchestrator(store, mover);
        let servers = [server("s1", "g", true)];
        let ok = orch.download(&servers, &t, &mut file, None).await.unwrap();
        assert!(!ok);
        assert_eq!(counters.in_flight("g", "s1", 0), 0);
        assert!(!file.downloaded);
    }

    #[tokio::test]
    async fn download_marks_file_downloaded() {
        let store = Arc::new(MemStore::new());
        let t = transfer(1, "x", "a/b", 50);
        let mut file = data_file(1, "g", 0);
        store.add_data_file(file.clone());
        let mover = Arc::new(FakeMover::new());
        mover.connect("s1");
        let (orch, counters) = orchestrator(store.clone(), mover);
        let servers = [server("s1", "g", true)];
        let ok = orch.download(&servers, &t, &mut file, None).await.unwrap();
        assert!(ok);
        assert!(file.downloaded);
        assert!(store.data_file(1).await.unwrap().downloaded);
        assert_eq!(counters.in_flight("g", "s1", 0), 0);
    }

    #[tokio::test]
    async fn expired_transfer_completes_download_without_calls() {
        let store = Arc::new(MemStore::new());
        let mut t = transfer(1, "x", "a/b", 50);
        t.expiry_time = Utc::now() - chrono::Duration::hours(1);
        let mut file = data_file(1, "g", 0);
        let mover = Arc::new(FakeMover::new());
        mover.connect("s1");
        let (orch, _) = orchestrator(store, mover.clone());
        let servers = [server("s1", "g", true)];
        let ok = orch.download(&servers, &t, &mut file, None).await.unwrap();
        assert!(ok);
        assert!(mover.calls_for("download").is_empty());
    }

    #[tokio::test]
    async fn replicate_reaches_minimum_and_skips_source() {
        let store = Arc::new(MemStore::new());
        store.add_host(crate::testsupport::host("rh", 1, std::time::Duration::ZERO));
        let t = transfer(1, "x", "a/b", 50);
        let file = data_file(1, "g", 0);
        let g = {
            let mut g = group("g", 1, None, None);
            g.min_replication_count = 2;
            g
        };
        let mover = Arc::new(FakeMover::new());
        for name in ["s1", "s2", "s3"] {
            mover.connect(name);
        }
        let (orch, _) = orchestrator(store, mover.clone());
        let mut servers = vec![
            server("s1", "g", true),
            server("s2", "g", true),
            server("s3", "g", true),
        ];
        for s in &mut servers {
            s.replicate = true;
            s.host_for_replication = Some("rh".into());
        }
        let outcome = orch.replicate("s1", &servers, &t, &file, &g).await.unwrap();
        assert!(outcome.complete);
        assert_eq!(outcome.copies, 2);
        // One replication call was enough, and never to the source mover.
        let calls = mover.calls_for("replicate");
        assert_eq!(calls.len(), 1);
        assert_ne!(calls[0], "s1");
    }

    #[tokio::test]
    async fn replicate_reports_partial_completion() {
        let store = Arc::new(MemStore::new());
        store.add_host(crate::testsupport::host("rh", 1, std::time::Duration::ZERO));
        let t = transfer(1, "x", "a/b", 50);
        let file = data_file(1, "g", 0);
        let g = {
            let mut g = group("g", 1, None, None);
            g.min_replication_count = 3;
            g
        };
        let mover = Arc::new(FakeMover::new());
        mover.connect("s1");
        mover.connect("s2");
        mover.fail_server("s2", MoverError::connectivity("reset"));
        let (orch, _) = orchestrator(store, mover);
        let mut servers = vec![server("s1", "g", true), server("s2", "g", true)];
        for s in &mut servers {
            s.replicate = true;
            s.host_for_replication = Some("rh".into());
        }
        let outcome = orch.replicate("s1", &servers, &t, &file, &g).await.unwrap();
        assert!(!outcome.complete);
        assert_eq!(outcome.copies, 1);
    }

    #[tokio::test]
    async fn backup_stops_at_first_success() {
        let store = Arc::new(MemStore::new());
        let file = data_file(1, "g", 0);
        let backup_host = crate::testsupport::host("bk", 1, std::time::Duration::ZERO);
        let mover = Arc::new(FakeMover::new());
        mover.connect("s2");
        mover.connect("s3");
        let (orch, _) = orchestrator(store, mover.clone());
        // s1 disconnected, s2 accepts: s3 must never be attempted.
        let servers = [
            server("s1", "g", true),
            server("s2", "g", true),
            server("s3", "g", true),
        ];
        let ok = orch.backup(&backup_host, &servers, &file).await.unwrap();
        assert!(ok);
        assert_eq!(mover.calls_for("replicate"), vec!["s2"]);
    }

    #[tokio::test]
    async fn backup_honors_forced_mover_spec() {
        // s2 would normally win as the first connected mover, but the host
        // mandates s3 for backup pushes.
        let store = Arc::new(MemStore::new());
        store.add_group(group("g", 1, None, None));
        for name in ["s1", "s2", "s3"] {
            store.add_server(server(name, "g", true));
        }
        let file = data_file(1, "g", 0);
        let mut backup_host = crate::testsupport::host("bk", 1, std::time::Duration::ZERO);
        backup_host.transfer_group = Some("g".into());
        backup_host.mover_list_for_backup = Some("s3".into());
        let mover = Arc::new(FakeMover::new());
        mover.connect("s2");
        mover.connect("s3");
        let (orch, _) = orchestrator(store, mover.clone());
        let servers = [
            server("s1", "g", true),
            server("s2", "g", true),
            server("s3", "g", true),
        ];
        let ok = orch.backup(&backup_host, &servers, &file).await.unwrap();
        assert!(ok);
        assert_eq!(mover.calls_for("replicate"), vec!["s3"]);
    }

    #[tokio::test]
    async fn backup_falls_back_when_forced_mover_unavailable() {
        let store = Arc::new(MemStore::new());
        store.add_group(group("g", 1, None, None));
        for name in ["s1", "s2", "s3"] {
            store.add_server(server(name, "g", true));
        }
        let file = data_file(1, "g", 0);
        let mut backup_host = crate::testsupport::host("bk", 1, std::time::Duration::ZERO);
        backup_host.transfer_group = Some("g".into());
        backup_host.mover_list_for_backup = Some("s3".into());
        let mover = Arc::new(FakeMover::new());
        // s3 never connected: the regular order applies.
        mover.connect("s2");
        let (orch, _) = orchestrator(store, mover.clone());
        let servers = [server("s2", "g", true), server("s3", "g", true)];
        let ok = orch.backup(&backup_host, &servers, &file).await.unwrap();
        assert!(ok);
        assert_eq!(mover.calls_for("replicate"), vec!["s2"]);
    }

    #[tokio::test]
    async fn purge_tolerates_failures_and_reports_conjunction() {
        let store = Arc::new(MemStore::new());
        let file = data_file(1, "g", 0);
        let mover = Arc::new(FakeMover::new());
        mover.fail_server("s2", MoverError::connectivity("reset"));
        let (orch, _) = orchestrator(store, mover.clone());
        let servers = [
            server("s1", "g", true),
            server("s2", "g", true),
            server("s3", "g", true),
        ];
        let complete = orch.purge(&servers, &file).await.unwrap();
        assert!(!complete);
        // All movers were still attempted.
        assert_eq!(mover.calls_for("purge").len(), 3);
    }

    #[tokio::test]
    async fn proxy_purge_stops_at_first_success() {
        let store = Arc::new(MemStore::new());
        let file = data_file(1, "g", 0);
        let mover = Arc::new(FakeMover::new());
        mover.fail_server("p1", MoverError::connectivity("reset"));
        let (orch, _) = orchestrator(store, mover.clone());
        let servers = [
            server("p1", "g", true),
            server("p2", "g", true),
            server("p3", "g", true),
        ];
        let ok = orch.purge_via_proxy(&servers, &file).await.unwrap();
        assert!(ok);
        assert_eq!(mover.calls_for("purge"), vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn filter_orders_source_first() {
        let store = Arc::new(MemStore::new());
        let file = data_file(1, "g", 0);
        let g = {
            let mut g = group("g", 1, None, None);
            g.min_filtering_count = 1;
            g
        };
        let mover = Arc::new(FakeMover::new());
        mover.connect("s1");
        mover.connect("s2");
        let (orch, _) = orchestrator(store, mover.clone());
        let servers = [server("s1", "g", true), server("s2", "g", true)];
        let ok = orch
            .filter(&servers, &file, Some("s2"), &g, false)
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(mover.calls_for("filter"), vec!["s2"]);
    }

    #[tokio::test]
    async fn counters_track_concurrent_guards() {
        let counters = Arc::new(DownloadCounters::new());
        let g1 = counters.acquire("g", "s1", 0);
        let g2 = counters.acquire("g", "s1", 0);
        let _g3 = counters.acquire("g", "s1", 1);
        assert_eq!(counters.in_flight("g", "s1", 0), 2);
        assert_eq!(counters.in_flight("g", "s1", 1), 1);
        drop(g1);
        drop(g2);
        assert_eq!(counters.in_flight("g", "s1", 0), 0);
        assert_eq!(counters.in_flight("g", "s1", 1), 1);
    }
}
