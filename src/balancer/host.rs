//! Upstream hosts, host sets, and the priority topology
//!
//! A [`Host`] is an upstream endpoint with an integer weight, a locality
//! tag, and live atomic counters the balancer reads. Hosts are shared as
//! `Arc<Host>` between the topology, the precomputed hashing structures,
//! and in-flight requests.
//!
//! The [`PrioritySet`] is the control-plane view of the upstream topology:
//! one [`HostSet`] per priority (low index = preferred), each with views of
//! all hosts, healthy hosts, hosts grouped by locality, and optional
//! locality weights. Topology changes go through
//! [`PrioritySet::update_hosts`], which notifies registered callbacks so
//! the balancer can rebuild its snapshot.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Geographic or topological grouping of hosts
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locality {
    /// Region, e.g. `"us-east-1"`
    #[serde(default)]
    pub region: String,
    /// Zone within the region
    #[serde(default)]
    pub zone: String,
    /// Finer-grained grouping within the zone
    #[serde(default)]
    pub sub_zone: String,
}

/// Cluster-wide live counters shared by every host of the cluster
#[derive(Debug, Default)]
pub struct ClusterStats {
    upstream_rq_active: AtomicU32,
}

impl ClusterStats {
    /// Active requests across the whole cluster
    #[must_use]
    pub fn upstream_rq_active(&self) -> u32 {
        self.upstream_rq_active.load(Ordering::Relaxed)
    }
}

/// Per-host live counters
#[derive(Debug, Default)]
pub struct HostStats {
    rq_active: AtomicU32,
}

impl HostStats {
    /// Active requests on this host
    #[must_use]
    pub fn rq_active(&self) -> u32 {
        self.rq_active.load(Ordering::Relaxed)
    }
}

/// An upstream endpoint
#[derive(Debug)]
pub struct Host {
    address: SocketAddr,
    weight: u32,
    locality: Locality,
    stats: HostStats,
    cluster_stats: Arc<ClusterStats>,
}

impl Host {
    /// Create a host with the given address and weight
    ///
    /// Host weights are at least 1; locality weights are the only weights
    /// allowed to be zero.
    #[must_use]
    pub fn new(address: SocketAddr, weight: u32, cluster_stats: Arc<ClusterStats>) -> Self {
        Self {
            address,
            weight: weight.max(1),
            locality: Locality::default(),
            stats: HostStats::default(),
            cluster_stats,
        }
    }

    /// Set the locality tag
    #[must_use]
    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = locality;
        self
    }

    /// Endpoint address
    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    /// Configured load-balancing weight
    #[must_use]
    pub const fn weight(&self) -> u32 {
        self.weight
    }

    /// Locality tag
    #[must_use]
    pub const fn locality(&self) -> &Locality {
        &self.locality
    }

    /// Live counters for this host
    #[must_use]
    pub const fn stats(&self) -> &HostStats {
        &self.stats
    }

    /// Cluster-wide counters this host contributes to
    #[must_use]
    pub fn cluster(&self) -> &ClusterStats {
        &self.cluster_stats
    }

    /// Account one request against this host and its cluster
    ///
    /// The returned guard decrements both counters on drop.
    #[must_use]
    pub fn start_request(self: &Arc<Self>) -> ActiveRequestGuard {
        self.stats.rq_active.fetch_add(1, Ordering::Relaxed);
        self.cluster_stats
            .upstream_rq_active
            .fetch_add(1, Ordering::Relaxed);
        ActiveRequestGuard {
            host: Arc::clone(self),
        }
    }
}

/// RAII guard for one in-flight request on a host
#[derive(Debug)]
pub struct ActiveRequestGuard {
    host: Arc<Host>,
}

impl std::ops::Deref for ActiveRequestGuard {
    type Target = Host;

    fn deref(&self) -> &Self::Target {
        &self.host
    }
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.host.stats.rq_active.fetch_sub(1, Ordering::Relaxed);
        self.host
            .cluster_stats
            .upstream_rq_active
            .fetch_sub(1, Ordering::Relaxed);
    }
}

/// Hosts of one priority, with health and locality views
#[derive(Debug, Default, Clone)]
pub struct HostSet {
    /// All hosts of this priority
    pub hosts: Vec<Arc<Host>>,
    /// Hosts currently passing health checks
    pub healthy_hosts: Vec<Arc<Host>>,
    /// Hosts in degraded health, servable only when healthy capacity runs out
    pub degraded_hosts: Vec<Arc<Host>>,
    /// All hosts grouped by locality
    pub hosts_per_locality: Vec<Vec<Arc<Host>>>,
    /// Healthy hosts grouped by locality, same locality order
    pub healthy_hosts_per_locality: Vec<Vec<Arc<Host>>>,
    /// Optional per-locality weights, same locality order
    pub locality_weights: Option<Vec<u32>>,
}

impl HostSet {
    /// A host set where every host is healthy and ungrouped
    #[must_use]
    pub fn all_healthy(hosts: Vec<Arc<Host>>) -> Self {
        Self {
            healthy_hosts: hosts.clone(),
            hosts,
            ..Self::default()
        }
    }
}

/// Callback invoked with the priority that changed
pub type PriorityUpdateCb = Box<dyn Fn(u32) + Send + Sync>;

/// Control-plane view of the upstream topology, one host set per priority
#[derive(Default)]
pub struct PrioritySet {
    host_sets: RwLock<Vec<Arc<HostSet>>>,
    callbacks: Mutex<Vec<PriorityUpdateCb>>,
}

impl PrioritySet {
    /// Create an empty priority set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the host sets, indexed by priority
    #[must_use]
    pub fn host_sets(&self) -> Vec<Arc<HostSet>> {
        self.host_sets.read().clone()
    }

    /// Replace the host set of one priority and notify callbacks
    ///
    /// Gaps up to `priority` are filled with empty host sets.
    pub fn update_hosts(&self, priority: u32, host_set: HostSet) {
        {
            let mut sets = self.host_sets.write();
            let index = priority as usize;
            while sets.len() <= index {
                sets.push(Arc::new(HostSet::default()));
            }
            sets[index] = Arc::new(host_set);
        }
        for cb in self.callbacks.lock().iter() {
            cb(priority);
        }
    }

    /// Register a callback invoked after every topology change
    pub fn add_priority_update_cb(&self, cb: PriorityUpdateCb) {
        self.callbacks.lock().push(cb);
    }
}

impl std::fmt::Debug for PrioritySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrioritySet")
            .field("priorities", &self.host_sets.read().len())
            .field("callbacks", &self.callbacks.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(addr: &str, weight: u32) -> Arc<Host> {
        Arc::new(Host::new(
            addr.parse().unwrap(),
            weight,
            Arc::new(ClusterStats::default()),
        ))
    }

    #[test]
    fn test_request_guard_tracks_host_and_cluster() {
        let cluster = Arc::new(ClusterStats::default());
        let a = Arc::new(Host::new("10.0.0.1:80".parse().unwrap(), 1, cluster.clone()));
        let b = Arc::new(Host::new("10.0.0.2:80".parse().unwrap(), 1, cluster.clone()));

        let g1 = a.start_request();
        let g2 = a.start_request();
        let g3 = b.start_request();
        assert_eq!(a.stats().rq_active(), 2);
        assert_eq!(b.stats().rq_active(), 1);
        assert_eq!(cluster.upstream_rq_active(), 3);

        drop(g2);
        assert_eq!(a.stats().rq_active(), 1);
        assert_eq!(cluster.upstream_rq_active(), 2);
        drop((g1, g3));
        assert_eq!(cluster.upstream_rq_active(), 0);
    }

    #[test]
    fn test_priority_set_update_notifies_callbacks() {
        let set = PrioritySet::new();
        let seen = Arc::new(AtomicU32::new(0));
        let seen_cb = Arc::clone(&seen);
        set.add_priority_update_cb(Box::new(move |p| {
            seen_cb.store(p + 1, Ordering::Relaxed);
        }));

        set.update_hosts(1, HostSet::all_healthy(vec![host("10.0.0.1:80", 1)]));
        assert_eq!(seen.load(Ordering::Relaxed), 2);

        let sets = set.host_sets();
        assert_eq!(sets.len(), 2);
        assert!(sets[0].hosts.is_empty());
        assert_eq!(sets[1].hosts.len(), 1);
    }
}
