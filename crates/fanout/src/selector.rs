//! Selection and ordering of transfer servers ("movers") for a transfer
//! group, honoring cluster weighting and forced-mover overrides.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngExt;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, warn};

use crate::error::{Result, SchedulerError};
use crate::model::{Host, HostKind, TransferGroup, TransferServer};
use crate::orchestrator::DownloadCounters;
use crate::services::{MoverControl, Persistence};

/// Outcome of a full group/volume/server resolution.
#[derive(Debug, Clone)]
pub struct ServerSelection {
    pub group: TransferGroup,
    pub file_system: u32,
    /// Active, connected movers, rotation applied, most suitable first.
    pub servers: Vec<TransferServer>,
}

/// Comparison operator of one mover-list line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupMatch {
    Equals,
    Differs,
    Prefix,
    Suffix,
}

impl GroupMatch {
    fn matches(self, group: &str, pattern: &str) -> bool {
        match self {
            Self::Equals => group == pattern,
            Self::Differs => group != pattern,
            Self::Prefix => group.starts_with(pattern),
            Self::Suffix => group.ends_with(pattern),
        }
    }
}

/// Selects, orders and filters movers for transfer groups.
///
/// Rotation and volume allocation use generators seeded per caller/group so
/// successive calls from the same caller stay well distributed without a
/// shared global sequence.
pub struct TransferServerSelector {
    store: Arc<dyn Persistence>,
    mover: Arc<dyn MoverControl>,
    counters: Arc<DownloadCounters>,
    default_group: Option<String>,
    rotation: Mutex<HashMap<String, StdRng>>,
    volumes: Mutex<HashMap<String, StdRng>>,
}

fn seed_for(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

impl TransferServerSelector {
    pub fn new(
        store: Arc<dyn Persistence>,
        mover: Arc<dyn MoverControl>,
        counters: Arc<DownloadCounters>,
        default_group: Option<String>,
    ) -> Self {
        Self {
            store,
            mover,
            counters,
            default_group,
            rotation: Mutex::new(HashMap::new()),
            volumes: Mutex::new(HashMap::new()),
        }
    }

    /// A group is usable when it is active and at least one of its movers is
    /// active and currently connected.
    pub async fn group_is_available(&self, group: &TransferGroup) -> Result<bool> {
        if !group.active {
            return Ok(false);
        }
        for server in self.store.transfer_servers(&group.name).await? {
            if server.active && self.mover.is_connected(&server.name).await {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Replaces a clustered group with a weighted-random available sibling.
    ///
    /// The draw is uniform over `[0, total_weight)`; groups are walked
    /// accumulating weight and the first group whose cumulative weight
    /// exceeds the draw wins. The selected sibling is re-validated and the
    /// original group is kept when the check fails.
    pub async fn cluster_fallback(&self, original: TransferGroup) -> Result<TransferGroup> {
        let Some(cluster) = original.cluster_name.clone() else {
            return Ok(original);
        };
        if original.cluster_weight.is_none() {
            return Ok(original);
        }
        let groups = self.store.transfer_groups().await?;
        let mut siblings = Vec::new();
        let mut total = 0u64;
        for group in groups {
            if group.cluster_name.as_deref() != Some(cluster.as_str()) {
                continue;
            }
            let Some(weight) = group.cluster_weight else {
                continue;
            };
            if weight == 0 || !self.group_is_available(&group).await? {
                continue;
            }
            total += u64::from(weight);
            siblings.push((group, total));
        }
        if total == 0 {
            return Ok(original);
        }
        let draw = rand::rng().random_range(0..total);
        for (group, cumulative) in siblings {
            if draw < cumulative {
                if group.name != original.name {
                    debug!(
                        group = %group.name,
                        cluster = %cluster,
                        "choosing sibling TransferGroup from cluster"
                    );
                    // Availability was checked while weighting, but movers may
                    // have dropped off since; keep the original on a stale pick.
                    if !self.group_is_available(&group).await? {
                        warn!(group = %group.name, "selected sibling no longer available");
                        return Ok(original);
                    }
                }
                return Ok(group);
            }
        }
        Ok(original)
    }

    /// Allocates a volume index for a group, uniform over
    /// `[0, volume_count)`, from a generator cached per group.
    pub fn allocate_volume(&self, group: &TransferGroup) -> u32 {
        if group.volume_count <= 1 {
            return 0;
        }
        let mut volumes = self.volumes.lock();
        let rng = volumes
            .entry(group.name.clone())
            .or_insert_with(|| StdRng::seed_from_u64(seed_for(&group.name)));
        rng.random_range(0..group.volume_count)
    }

    /// Stable caller-based rotation index into a server list of `size`.
    fn start_index(&self, caller: &str, group: &str, size: usize) -> usize {
        let key = format!("{caller}.{group}");
        let mut rotation = self.rotation.lock();
        let rng = rotation
            .entry(key)
            .or_insert_with_key(|key| StdRng::seed_from_u64(seed_for(key)));
        rng.random_range(0..size)
    }

    /// Returns the active, connected movers of a group, rotation applied.
    ///
    /// When a volume index is supplied, servers are ordered by increasing
    /// in-flight download count on that volume. A preferred server, when
    /// available, is always moved to the front.
    pub async fn select_servers(
        &self,
        caller: &str,
        preferred: Option<&TransferServer>,
        group: &TransferGroup,
        file_system: Option<u32>,
    ) -> Result<Vec<TransferServer>> {
        let declared = self.store.transfer_servers(&group.name).await?;
        if declared.is_empty() {
            return Err(SchedulerError::no_server(format!(
                "no DataMover declared for TransferGroup {}",
                group.name
            )));
        }
        let start = self.start_index(caller, &group.name, declared.len());
        let mut active = Vec::new();
        let mut preferred_found = false;
        for i in 0..declared.len() {
            let server = &declared[(start + i) % declared.len()];
            if !server.active || !self.mover.is_connected(&server.name).await {
                continue;
            }
            if let Some(wanted) = preferred
                && wanted.name == server.name
            {
                // Kept aside, reinserted at the top below.
                preferred_found = true;
                continue;
            }
            active.push(server.clone());
        }
        if let Some(volume) = file_system {
            active.sort_by_key(|server| {
                self.counters
                    .in_flight(&group.name, &server.name, volume)
            });
        }
        if preferred_found
            && let Some(wanted) = preferred
        {
            active.insert(0, wanted.clone());
        }
        debug!(
            caller,
            group = %group.name,
            servers = active.len(),
            "selected DataMovers"
        );
        Ok(active)
    }

    /// Resolves a group, volume and server list for a transfer.
    ///
    /// The group comes from, in order: the explicit `group_name`, the
    /// primary host (or the destination's dissemination hosts), the
    /// destination's default group, the configured default. A forced-mover
    /// spec on the primary host short-circuits everything else.
    pub async fn resolve(
        &self,
        caller: &str,
        allocated_file_system: Option<u32>,
        group_name: Option<&str>,
        destination: &str,
        primary_host: Option<&Host>,
    ) -> Result<ServerSelection> {
        // Without a pre-allocated volume the cluster may be rebalanced.
        let mut check_cluster = allocated_file_system.is_none();
        let mut group: TransferGroup;
        if let Some(name) = group_name.filter(|_| primary_host.is_none()) {
            group = self
                .store
                .transfer_group(name)
                .await?
                .ok_or_else(|| SchedulerError::GroupNotAvailable { name: name.into() })?;
            if !self.group_is_available(&group).await? {
                warn!(group = %name, "forcing cluster checking, group not available");
                check_cluster = true;
            }
        } else {
            let hosts = match primary_host {
                Some(host) => vec![host.clone()],
                None => {
                    self.store
                        .destination_hosts(destination, HostKind::Dissemination)
                        .await?
                }
            };
            if hosts.is_empty() {
                group = self.fallback_group(destination).await?;
            } else {
                let primary = &hosts[0];
                let group_of_primary = primary.transfer_group.as_deref().ok_or_else(|| {
                    SchedulerError::no_server(format!(
                        "no TransferGroup defined for Host {}",
                        primary.nickname
                    ))
                })?;
                group = self
                    .store
                    .transfer_group(group_of_primary)
                    .await?
                    .ok_or_else(|| SchedulerError::GroupNotAvailable {
                        name: group_of_primary.into(),
                    })?;
                if let Some(spec) = primary.mover_list.as_deref() {
                    match self.select_single(&group.name, None, spec).await {
                        Ok(Some(server)) => {
                            let forced_group = self
                                .store
                                .transfer_group(&server.transfer_group)
                                .await?
                                .ok_or_else(|| SchedulerError::GroupNotAvailable {
                                    name: server.transfer_group.clone(),
                                })?;
                            let file_system = match allocated_file_system {
                                Some(fs) => fs,
                                None => self.allocate_volume(&forced_group),
                            };
                            debug!(
                                server = %server.name,
                                group = %forced_group.name,
                                "forcing usage of mandatory DataMover"
                            );
                            return Ok(ServerSelection {
                                group: forced_group,
                                file_system,
                                servers: vec![server],
                            });
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "could not find mandatory DataMover"),
                    }
                }
            }
            check_cluster = true;
        }
        if check_cluster {
            group = self.cluster_fallback(group).await?;
        }
        if !self.group_is_available(&group).await? {
            return Err(SchedulerError::GroupNotAvailable {
                name: group.name.clone(),
            });
        }
        let file_system = match allocated_file_system {
            Some(fs) => fs,
            None => self.allocate_volume(&group),
        };
        let servers = self
            .select_servers(caller, None, &group, Some(file_system))
            .await?;
        if servers.is_empty() {
            return Err(SchedulerError::no_server(format!(
                "no TransferServer(s) available for TransferGroup {}",
                group.name
            )));
        }
        Ok(ServerSelection {
            group,
            file_system,
            servers,
        })
    }

    async fn fallback_group(&self, destination: &str) -> Result<TransferGroup> {
        let record = self.store.destination(destination).await?;
        let name = record
            .transfer_group
            .or_else(|| self.default_group.clone())
            .ok_or_else(|| {
                SchedulerError::no_server(format!(
                    "no dissemination host(s) defined for {destination}"
                ))
            })?;
        self.store
            .transfer_group(&name)
            .await?
            .ok_or(SchedulerError::GroupNotAvailable { name })
    }

    /// Picks one mover out of a textual mover-list specification.
    ///
    /// Each line is `(<op> <groupPattern>) name1,name2,...` with `<op>` one
    /// of `==`, `!=`, `.=` (prefix) and `=.` (suffix); a line without a
    /// condition always applies. The first matching line supplies the
    /// candidates, which are tried in random order without replacement until
    /// one is active, in an active group, and connected. Returns the
    /// original mover unchanged when no candidate qualifies.
    pub async fn select_single(
        &self,
        group_name: &str,
        original: Option<TransferServer>,
        mover_list: &str,
    ) -> Result<Option<TransferServer>> {
        let mut candidates = Vec::new();
        for line in mover_list.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (condition, names) = parse_mover_line(line)?;
            let applies = match condition {
                Some((op, pattern)) => op.matches(group_name, &pattern),
                None => true,
            };
            if applies {
                candidates = names;
                break;
            }
        }
        while !candidates.is_empty() {
            let picked =
                candidates.swap_remove(rand::rng().random_range(0..candidates.len()));
            let servers = match self.find_server(&picked).await? {
                Some(server) => server,
                None => continue,
            };
            let group = self.store.transfer_group(&servers.transfer_group).await?;
            let group_ok = match group {
                Some(ref g) => self.group_is_available(g).await?,
                None => false,
            };
            if servers.active && group_ok && self.mover.is_connected(&servers.name).await {
                return Ok(Some(servers));
            }
        }
        Ok(original)
    }

    async fn find_server(&self, name: &str) -> Result<Option<TransferServer>> {
        for group in self.store.transfer_groups().await? {
            for server in self.store.transfer_servers(&group.name).await? {
                if server.name == name {
                    return Ok(Some(server));
                }
            }
        }
        Ok(None)
    }
}

fn parse_mover_line(line: &str) -> Result<(Option<(GroupMatch, String)>, Vec<String>)> {
    let (condition, rest) = if let Some(stripped) = line.strip_prefix('(') {
        let end = stripped.find(')').ok_or_else(|| {
            SchedulerError::invalid_mover_list(format!("unterminated condition in '{line}'"))
        })?;
        let inside = stripped[..end].trim();
        let (op, pattern) = parse_condition(inside)?;
        (Some((op, pattern)), stripped[end + 1..].trim())
    } else {
        (None, line)
    };
    let mut names = Vec::new();
    for token in rest.split([';', ',', ' ']) {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if !token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        {
            return Err(SchedulerError::invalid_mover_list(format!(
                "invalid DataMover name '{token}'"
            )));
        }
        names.push(token.to_owned());
    }
    Ok((condition, names))
}

fn parse_condition(inside: &str) -> Result<(GroupMatch, String)> {
    let (op, pattern) = if let Some(rest) = inside.strip_prefix("==") {
        (GroupMatch::Equals, rest)
    } else if let Some(rest) = inside.strip_prefix("!=") {
        (GroupMatch::Differs, rest)
    } else if let Some(rest) = inside.strip_prefix(".=") {
        (GroupMatch::Prefix, rest)
    } else if let Some(rest) = inside.strip_prefix("=.") {
        (GroupMatch::Suffix, rest)
    } else {
        return Err(SchedulerError::invalid_mover_list(format!(
            "unknown operator in '({inside})'"
        )));
    };
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Err(SchedulerError::invalid_mover_list(format!(
            "empty group pattern in '({inside})'"
        )));
    }
    Ok((op, pattern.to_owned()))
}
