//! Per-destination host selection: an ordered failover ring with per-host
//! retry credits.
//!
//! The ring gives bounded, deterministic failover: no host is retried more
//! than its configured count before the provider moves on, while sticky
//! behavior avoids thrashing across hosts for transient errors.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::model::{DataTransfer, Destination, Host, HostKind, OnHostFailure, SchedulerValue};
use crate::services::Persistence;
use crate::status::{DestinationStatus, TransferStatus};

/// A host plus its runtime counters inside the ring.
#[derive(Debug)]
pub struct HostElement {
    host: Host,
    current: usize,
    next: usize,
    /// When this element was last selected.
    selected_at: DateTime<Utc>,
    /// Retry credits remaining before the ring advances.
    retry: u32,
    /// Live connections on this host.
    count: i32,
    /// High-water mark of `count`.
    max: i32,
    /// Lifetime started connections.
    total: u64,
}

impl HostElement {
    fn new(host: Host, current: usize, next: usize) -> Self {
        let retry = host.retry_count;
        Self {
            host,
            current,
            next,
            selected_at: DateTime::<Utc>::MIN_UTC,
            retry,
            count: 0,
            max: 0,
            total: 0,
        }
    }

    fn start(&mut self) {
        self.selected_at = Utc::now();
        self.retry = self.host.retry_count.saturating_sub(1);
    }

    fn stop(&mut self) {
        self.retry = self.host.retry_count;
    }

    /// Consumes one retry credit; false when the budget is exhausted.
    fn consume_retry(&mut self) -> bool {
        if self.retry > 0 {
            self.retry -= 1;
            debug!(host = %self.host.name, "host retry ({self})");
            true
        } else {
            false
        }
    }

    fn update_count(&mut self, start: bool) {
        if start || self.count > 0 {
            self.count += if start { 1 } else { -1 };
            if self.count > self.max {
                self.max = self.count;
            }
        }
        if start {
            self.total += 1;
        }
    }

    fn available(&self) -> bool {
        let max = self.host.max_connections;
        max < 0 || self.count < max
    }

    pub fn host(&self) -> &Host {
        &self.host
    }
}

impl fmt::Display for HostElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let retry = self.host.retry_count;
        write!(
            f,
            "start={}/{},count={},max={},total={},pos={}",
            retry - self.retry,
            retry,
            self.count,
            self.max,
            self.total,
            self.current
        )
    }
}

/// Selects among a destination's configured dissemination hosts.
///
/// Owned by a single worker; all methods take `&mut self` and the scheduler
/// only ever sees read-only snapshots through [`HostProvider::describe`].
pub struct HostProvider {
    destination: Destination,
    value: Arc<Mutex<SchedulerValue>>,
    store: Arc<dyn Persistence>,
    hosts: Vec<HostElement>,
    current: usize,
    connections: i32,
    next_and_retry: bool,
    token: CancellationToken,
    reset_requested: Arc<AtomicBool>,
}

impl HostProvider {
    /// Builds the ring from the destination's dissemination hosts.
    ///
    /// Resumes on the persisted host when the failure policy is NextAndStay
    /// and the reset window has not elapsed; otherwise starts at ring
    /// position 0. Fails when the destination has no dissemination hosts.
    pub async fn new(
        destination: Destination,
        value: Arc<Mutex<SchedulerValue>>,
        store: Arc<dyn Persistence>,
        token: CancellationToken,
        reset_requested: Arc<AtomicBool>,
    ) -> Result<Self> {
        let next_and_retry = destination.on_host_failure == OnHostFailure::NextAndRetry;
        let configured = store
            .destination_hosts(&destination.name, HostKind::Dissemination)
            .await?;
        if configured.is_empty() {
            return Err(SchedulerError::no_host(format!(
                "no host(s) for the destination {}",
                destination.name
            )));
        }
        let resume_host = {
            let value = value.lock();
            let mut name = if next_and_retry {
                None
            } else {
                value.host_name.clone()
            };
            if let (Some(_), Some(reset_time)) = (&name, value.reset_time) {
                let elapsed = Utc::now().signed_duration_since(reset_time);
                if elapsed.to_std().unwrap_or(Duration::MAX) > destination.reset_frequency {
                    name = None;
                }
            }
            name
        };
        if let Some(name) = &resume_host {
            debug!(host = %name, "last host used");
        }
        let count = configured.len();
        let mut hosts = Vec::with_capacity(count);
        let mut index = 0;
        for (i, host) in configured.into_iter().enumerate() {
            if resume_host.as_deref() == Some(host.name.as_str()) {
                index = i;
            }
            hosts.push(HostElement::new(host, i, if i == count - 1 { 0 } else { i + 1 }));
        }
        let mut provider = Self {
            destination,
            value,
            store,
            hosts,
            current: index,
            connections: 0,
            next_and_retry,
            token,
            reset_requested,
        };
        provider.hosts[index].start();
        if resume_host.is_none() {
            let snapshot = {
                let mut value = provider.value.lock();
                value.host_name = Some(provider.hosts[index].host.name.clone());
                value.start_count = 1;
                value.reset_time = Some(Utc::now());
                value.clone()
            };
            provider.store.update_scheduler_value(&snapshot).await?;
        }
        Ok(provider)
    }

    /// The current host, when it is active.
    pub fn host(&self) -> Result<Host> {
        let host = &self.hosts[self.current].host;
        if host.active {
            Ok(host.clone())
        } else {
            Err(SchedulerError::no_host(format!(
                "host {} NOT activated",
                host.nickname
            )))
        }
    }

    /// Whether the current host and the destination both have spare
    /// connection capacity.
    pub fn available(&self) -> bool {
        let max = self.destination.max_connections;
        self.hosts[self.current].available()
            && (max < 0 || (self.connections >= 0 && self.connections < max))
    }

    pub fn connection_count(&self) -> i32 {
        self.connections
    }

    pub fn start_count(&self) -> u32 {
        self.value.lock().start_count
    }

    fn element_index(&self, host_name: Option<&str>) -> Option<usize> {
        let wanted = host_name?;
        self.hosts.iter().position(|e| e.host.name == wanted)
    }

    /// A transfer outcome is only attributed to the current host when the
    /// transfer actually ran on it since it was last selected.
    fn is_fresh(&self, transfer: &DataTransfer) -> bool {
        transfer.host_name.as_deref() == Some(self.hosts[self.current].host.name.as_str())
            && transfer.retry_time > Some(self.hosts[self.current].selected_at)
    }

    async fn select(&mut self, index: usize, stamp_reset_time: bool) -> Result<()> {
        if index == self.current {
            // Re-selecting the same host refreshes its retry credits.
            self.hosts[index].start();
            return Ok(());
        }
        self.hosts[self.current].stop();
        self.current = index;
        self.hosts[index].start();
        let snapshot = {
            let mut value = self.value.lock();
            value.host_name = Some(self.hosts[index].host.name.clone());
            if stamp_reset_time {
                value.reset_time = Some(Utc::now());
            }
            value.clone()
        };
        info!(
            destination = %self.destination.name,
            host = %self.hosts[index].host.name,
            ring = %self.describe(),
            "select host"
        );
        self.store.update_scheduler_value(&snapshot).await?;
        Ok(())
    }

    /// Interruptible wait: returns early on cancellation or a reset request.
    async fn wait_for(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        info!(
            destination = %self.destination.name,
            wait_ms = duration.as_millis() as u64,
            "waiting before retry"
        );
        let deadline = tokio::time::Instant::now() + duration;
        while !self.token.is_cancelled() && !self.reset_requested.load(Ordering::Relaxed) {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            let slice = (deadline - now).min(Duration::from_secs(1));
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(slice) => {}
            }
        }
    }

    /// Advances the retry/failover state machine after a failed attempt.
    ///
    /// Returns `Ok(false)` only when the destination was put on hold because
    /// its overall retry budget is exhausted.
    pub async fn next(&mut self, transfer: &DataTransfer) -> Result<bool> {
        if !self.is_fresh(transfer) {
            return Ok(true);
        }
        if self.hosts[self.current].consume_retry() {
            info!(host = %self.hosts[self.current].host.name, "stick to host");
            let mut delay = self.hosts[self.current].host.retry_frequency;
            if let Some(finish) = transfer.finish_time {
                let gap = Utc::now().signed_duration_since(finish);
                if let Ok(gap) = gap.to_std()
                    && !gap.is_zero()
                    && gap < delay
                {
                    delay -= gap;
                }
            }
            self.wait_for(delay).await;
            return Ok(true);
        }
        error!(
            destination = %self.destination.name,
            "move to next host"
        );
        let next = self.hosts[self.current].next;
        let mut result = true;
        if next == 0 {
            // Full ring traversal: destination-level retry policy applies.
            let mut retry_frequency = self.destination.retry_frequency;
            let retry_count = self.destination.retry_count;
            if retry_count >= 0 {
                let start_count = self.value.lock().start_count;
                if start_count >= retry_count as u32 {
                    error!(destination = %self.destination.name, "interrupt the destination");
                    self.store
                        .update_destination_status(&self.destination.name, DestinationStatus::Hold)
                        .await?;
                    retry_frequency = Duration::ZERO;
                    result = false;
                } else {
                    let snapshot = {
                        let mut value = self.value.lock();
                        value.start_count += 1;
                        value.clone()
                    };
                    debug!(
                        destination = %self.destination.name,
                        start_count = snapshot.start_count,
                        "set start count"
                    );
                    self.store.update_scheduler_value(&snapshot).await?;
                }
            }
            self.wait_for(retry_frequency).await;
        }
        self.select(next, true).await?;
        Ok(result)
    }

    /// Tracks a connection starting or finishing on the transfer's host.
    ///
    /// On a successful terminal transfer on the current host the ring jumps
    /// back to its head when the policy is NextAndRetry. Returns `true` when
    /// the connection counter went negative, which callers must treat as an
    /// emergency restart condition.
    pub async fn update(&mut self, transfer: &DataTransfer, start: bool) -> Result<bool> {
        self.connections += if start { 1 } else { -1 };
        match self.element_index(transfer.host_name.as_deref()) {
            Some(index) => {
                self.hosts[index].update_count(start);
                if transfer.status == TransferStatus::Done && self.is_fresh(transfer) {
                    info!(destination = %transfer.destination, "successful transfer");
                    let target = if self.next_and_retry { 0 } else { index };
                    let snapshot = {
                        let mut value = self.value.lock();
                        value.host_name = Some(self.hosts[target].host.name.clone());
                        value.start_count = 1;
                        value.clone()
                    };
                    self.store.update_scheduler_value(&snapshot).await?;
                    self.select(target, true).await?;
                }
            }
            None => warn!(
                destination = %transfer.destination,
                host = ?transfer.host_name,
                "host element lost"
            ),
        }
        if self.connections < 0 {
            warn!(
                destination = %self.destination.name,
                connections = self.connections,
                "emergency restart required"
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// Forces the ring back to its head; reports whether a change occurred.
    pub async fn to_be_reset(&mut self) -> Result<bool> {
        let snapshot = {
            let mut value = self.value.lock();
            value.reset_time = Some(Utc::now());
            value.clone()
        };
        self.store.update_scheduler_value(&snapshot).await?;
        if self.current != 0 {
            self.select(0, false).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Operator-readable rendering of the ring state.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for (i, element) in self.hosts.iter().enumerate() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&element.host.name);
            out.push('(');
            out.push_str(&element.to_string());
            out.push(')');
            if i == self.current {
                out.push('*');
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memstore::MemStore;
    use crate::testsupport::{destination, host, transfer};

    async fn build(
        store: Arc<MemStore>,
        dest: Destination,
    ) -> (HostProvider, Arc<Mutex<SchedulerValue>>) {
        let value = Arc::new(Mutex::new(SchedulerValue::new(&dest.name)));
        let provider = HostProvider::new(
            dest,
            value.clone(),
            store,
            CancellationToken::new(),
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();
        (provider, value)
    }

    fn fresh_failure(provider: &HostProvider, dest: &str) -> DataTransfer {
        let mut t = transfer(1, dest, "target", 50);
        t.host_name = Some(provider.hosts[provider.current].host.name.clone());
        t.retry_time = Some(Utc::now() + chrono::Duration::seconds(10));
        t
    }

    #[tokio::test]
    async fn construction_fails_without_hosts() {
        let store = Arc::new(MemStore::new());
        let dest = destination("empty");
        store.add_destination(dest.clone());
        let value = Arc::new(Mutex::new(SchedulerValue::new("empty")));
        let result = HostProvider::new(
            dest,
            value,
            store,
            CancellationToken::new(),
            Arc::new(AtomicBool::new(false)),
        )
        .await;
        assert!(matches!(
            result,
            Err(SchedulerError::NoHostAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn retries_consume_budget_then_fail_over() {
        // Ring [h1(retry=2), h2(retry=1)]: two failures on h1 exhaust its
        // budget, the next call moves to h2.
        let store = Arc::new(MemStore::new());
        let dest = destination("x");
        store.add_destination(dest.clone());
        store.attach_host(&dest.name, host("h1", 2, Duration::ZERO));
        store.attach_host(&dest.name, host("h2", 1, Duration::ZERO));
        let (mut provider, _) = build(store, dest).await;
        assert_eq!(provider.host().unwrap().name, "h1");

        let t = fresh_failure(&provider, "x");
        assert!(provider.next(&t).await.unwrap());
        assert_eq!(provider.host().unwrap().name, "h1");

        let t = fresh_failure(&provider, "x");
        assert!(provider.next(&t).await.unwrap());
        assert_eq!(provider.host().unwrap().name, "h2");
    }

    #[tokio::test]
    async fn stale_transfer_does_not_advance_the_ring() {
        let store = Arc::new(MemStore::new());
        let dest = destination("x");
        store.add_destination(dest.clone());
        store.attach_host(&dest.name, host("h1", 1, Duration::ZERO));
        store.attach_host(&dest.name, host("h2", 1, Duration::ZERO));
        let (mut provider, _) = build(store, dest).await;

        let mut t = fresh_failure(&provider, "x");
        t.retry_time = Some(Utc::now() - chrono::Duration::hours(1));
        assert!(provider.next(&t).await.unwrap());
        assert_eq!(provider.host().unwrap().name, "h1");
    }

    #[tokio::test]
    async fn full_traversal_holds_destination_when_budget_exhausted() {
        let store = Arc::new(MemStore::new());
        let mut dest = destination("x");
        dest.retry_count = 1;
        store.add_destination(dest.clone());
        store.attach_host(&dest.name, host("h1", 1, Duration::ZERO));
        let (mut provider, value) = build(store.clone(), dest).await;
        // Construction persisted start_count = 1, which is already at the
        // destination limit; the next full traversal holds the destination.
        assert_eq!(value.lock().start_count, 1);

        let t = fresh_failure(&provider, "x");
        assert!(!provider.next(&t).await.unwrap());
        let held = store.destination("x").await.unwrap();
        assert_eq!(held.status, DestinationStatus::Hold);
    }

    #[tokio::test]
    async fn full_traversal_increments_start_count_within_budget() {
        let store = Arc::new(MemStore::new());
        let mut dest = destination("x");
        dest.retry_count = 5;
        store.add_destination(dest.clone());
        store.attach_host(&dest.name, host("h1", 1, Duration::ZERO));
        store.attach_host(&dest.name, host("h2", 1, Duration::ZERO));
        let (mut provider, value) = build(store, dest).await;

        let t = fresh_failure(&provider, "x");
        assert!(provider.next(&t).await.unwrap());
        assert_eq!(provider.host().unwrap().name, "h2");
        let t = fresh_failure(&provider, "x");
        assert!(provider.next(&t).await.unwrap());
        assert_eq!(provider.host().unwrap().name, "h1");
        assert_eq!(value.lock().start_count, 2);
    }

    #[tokio::test]
    async fn success_resets_ring_head_with_next_and_retry() {
        let store = Arc::new(MemStore::new());
        let dest = destination("x");
        store.add_destination(dest.clone());
        store.attach_host(&dest.name, host("h1", 1, Duration::ZERO));
        store.attach_host(&dest.name, host("h2", 1, Duration::ZERO));
        let (mut provider, value) = build(store, dest).await;

        let t = fresh_failure(&provider, "x");
        provider.next(&t).await.unwrap();
        assert_eq!(provider.host().unwrap().name, "h2");

        let mut done = fresh_failure(&provider, "x");
        done.status = TransferStatus::Exec;
        provider.update(&done, true).await.unwrap();
        done.status = TransferStatus::Done;
        let emergency = provider.update(&done, false).await.unwrap();
        assert!(!emergency);
        assert_eq!(provider.host().unwrap().name, "h1");
        assert_eq!(value.lock().start_count, 1);
    }

    #[tokio::test]
    async fn negative_connection_counter_is_an_emergency() {
        let store = Arc::new(MemStore::new());
        let dest = destination("x");
        store.add_destination(dest.clone());
        store.attach_host(&dest.name, host("h1", 1, Duration::ZERO));
        let (mut provider, _) = build(store, dest).await;

        let t = fresh_failure(&provider, "x");
        let emergency = provider.update(&t, false).await.unwrap();
        assert!(emergency);
        assert_eq!(provider.connection_count(), -1);
    }

    #[tokio::test]
    async fn availability_honors_both_caps() {
        let store = Arc::new(MemStore::new());
        let mut dest = destination("x");
        dest.max_connections = 1;
        store.add_destination(dest.clone());
        let mut h = host("h1", 1, Duration::ZERO);
        h.max_connections = 2;
        store.attach_host(&dest.name, h);
        let (mut provider, _) = build(store, dest).await;
        assert!(provider.available());

        let mut t = fresh_failure(&provider, "x");
        t.status = TransferStatus::Exec;
        provider.update(&t, true).await.unwrap();
        // Host would allow a second connection but the destination cap is 1.
        assert!(!provider.available());
    }

    #[tokio::test]
    async fn reset_moves_back_to_ring_head() {
        let store = Arc::new(MemStore::new());
        let dest = destination("x");
        store.add_destination(dest.clone());
        store.attach_host(&dest.name, host("h1", 1, Duration::ZERO));
        store.attach_host(&dest.name, host("h2", 1, Duration::ZERO));
        let (mut provider, _) = build(store, dest).await;

        let t = fresh_failure(&provider, "x");
        provider.next(&t).await.unwrap();
        assert_eq!(provider.host().unwrap().name, "h2");
        assert!(provider.to_be_reset().await.unwrap());
        assert_eq!(provider.host().unwrap().name, "h1");
        assert!(!provider.to_be_reset().await.unwrap());
    }

    #[tokio::test]
    async fn inactive_current_host_yields_no_host() {
        let store = Arc::new(MemStore::new());
        let dest = destination("x");
        store.add_destination(dest.clone());
        let mut h = host("h1", 1, Duration::ZERO);
        h.active = false;
        store.attach_host(&dest.name, h);
        let (provider, _) = build(store, dest).await;
        assert!(matches!(
            provider.host(),
            Err(SchedulerError::NoHostAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn describe_marks_the_current_element() {
        let store = Arc::new(MemStore::new());
        let dest = destination("x");
        store.add_destination(dest.clone());
        store.attach_host(&dest.name, host("h1", 2, Duration::ZERO));
        store.attach_host(&dest.name, host("h2", 1, Duration::ZERO));
        let (provider, _) = build(store, dest).await;
        let text = provider.describe();
        assert!(text.contains("h1("));
        assert!(text.contains(")*"));
        assert!(text.contains("h2("));
    }
}
