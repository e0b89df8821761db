//! Thread-aware hash load balancer: snapshot build, handoff, host choice
//!
//! The control thread owns a [`ThreadAwareBalancer`]. Every topology change
//! triggers [`ThreadAwareBalancer::refresh`], which normalizes weights,
//! asks the configured [`LoadBalancerBuilder`] for a per-priority hashing
//! structure, and installs the result in the shared
//! [`LoadBalancerFactory`] under its writer lock as one atomic transaction.
//!
//! Worker threads call [`LoadBalancerFactory::create`] once per thread (or
//! per request batch) to obtain a [`WorkerBalancer`]; the worker balancer
//! binds to the snapshot observed at creation and keeps it for its whole
//! lifetime. `choose_host` is synchronous, lock-free, and never fails; it
//! answers "no host" instead.
//!
//! ```text
//! PrioritySet change -> refresh() -> normalize -> create_load_balancer()
//!                                         |
//!                              factory writer lock: swap snapshot
//!                                         |
//! worker: factory.create() -> WorkerBalancer -> choose_host(context)
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use http::HeaderMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::BalancerError;

use super::affinity::HashPolicy;
use super::host::{Host, PrioritySet};
use super::priority::{
    choose_priority, recalculate_priority_loads, DEFAULT_OVERPROVISIONING_FACTOR,
    DEFAULT_PANIC_THRESHOLD_PERCENT,
};
use super::weights::{normalize_weights, NormalizedHostWeights};

/// A precomputed hashing structure answering host lookups
///
/// Implementations must be synchronous: a call returns a host decision
/// immediately, never a deferred handle. `attempt` is 0 for the first try
/// and increments across the retry loop of
/// [`WorkerBalancer::choose_host`], letting implementations derive an
/// alternate position from the same hash.
pub trait HashingLoadBalancer: Send + Sync + std::fmt::Debug {
    /// Deterministically map `(hash, attempt)` to a host, if any exists
    fn choose_host(&self, hash: u64, attempt: u32) -> Option<Arc<Host>>;
}

/// Factory seam producing one hashing structure per priority
///
/// `refresh` hands the normalized weight vector of a priority, plus the
/// smallest and largest normalized weights, to this builder. Ring-hash,
/// maglev, and the bounded-load wrapper implement it.
pub trait LoadBalancerBuilder: Send + Sync {
    /// Build the hashing structure for one priority
    ///
    /// # Errors
    ///
    /// Returns a [`BalancerError`] when the configuration is inconsistent;
    /// the snapshot under construction is discarded.
    fn create_load_balancer(
        &self,
        weights: NormalizedHostWeights,
        min_normalized_weight: f64,
        max_normalized_weight: f64,
    ) -> Result<Box<dyn HashingLoadBalancer>, BalancerError>;
}

/// Downstream stream metadata visible to hash policies
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// Peer address of the downstream connection
    pub downstream_remote_address: SocketAddr,
    /// Local address the downstream connected to
    pub downstream_local_address: SocketAddr,
}

/// Deferred mutation of the response headers
pub type HeadersModifier = Box<dyn FnOnce(&mut HeaderMap) + Send>;

/// Per-request view the balancer consults while choosing a host
///
/// All methods have neutral defaults so simple callers only override what
/// they carry.
pub trait LoadBalancerContext {
    /// Downstream request headers, when the request is HTTP
    fn downstream_headers(&self) -> Option<&HeaderMap> {
        None
    }

    /// Stream metadata, when available
    fn stream_info(&self) -> Option<&StreamInfo> {
        None
    }

    /// Hash key computed upstream of the balancer, if any
    fn compute_hash_key(&self) -> Option<u64> {
        None
    }

    /// How many times a rejected host may be retried
    fn host_selection_retry_count(&self) -> u32 {
        0
    }

    /// Veto a candidate host; the final attempt ignores the veto
    fn should_select_another_host(&self, _host: &Host) -> bool {
        false
    }

    /// Install a response-headers modifier (session-affinity cookies)
    fn set_headers_modifier(&mut self, _modifier: HeadersModifier) {}
}

/// Balancer counters
#[derive(Debug, Default)]
pub struct BalancerStats {
    lb_healthy_panic: AtomicU64,
}

impl BalancerStats {
    /// Requests served by a priority that was in panic mode
    #[must_use]
    pub fn lb_healthy_panic(&self) -> u64 {
        self.lb_healthy_panic.load(Ordering::Relaxed)
    }
}

/// Immutable per-priority record of one snapshot
struct PerPriorityState {
    panic: bool,
    lb: Box<dyn HashingLoadBalancer>,
}

/// One fully built snapshot, shared read-only with worker balancers
struct SnapshotState {
    per_priority: Arc<Vec<PerPriorityState>>,
    healthy_load: Arc<Vec<u32>>,
    degraded_load: Arc<Vec<u32>>,
}

/// Shared handoff point between the control thread and the workers
///
/// The writer lock orders snapshot installs; workers hold it only long
/// enough to clone shared references.
pub struct LoadBalancerFactory {
    state: RwLock<Option<SnapshotState>>,
    stats: Arc<BalancerStats>,
    hash_policy: Option<Arc<dyn HashPolicy>>,
}

impl LoadBalancerFactory {
    fn new(hash_policy: Option<Arc<dyn HashPolicy>>) -> Self {
        Self {
            state: RwLock::new(None),
            stats: Arc::new(BalancerStats::default()),
            hash_policy,
        }
    }

    /// Create a worker balancer bound to the current snapshot
    ///
    /// A balancer created before the first refresh answers "no host" until
    /// its owner creates a fresh one.
    #[must_use]
    pub fn create(&self) -> WorkerBalancer {
        let state = self.state.read();
        match state.as_ref() {
            Some(s) => WorkerBalancer {
                per_priority_state: Some(Arc::clone(&s.per_priority)),
                healthy_load: Arc::clone(&s.healthy_load),
                degraded_load: Arc::clone(&s.degraded_load),
                stats: Arc::clone(&self.stats),
                hash_policy: self.hash_policy.clone(),
            },
            None => WorkerBalancer {
                per_priority_state: None,
                healthy_load: Arc::new(Vec::new()),
                degraded_load: Arc::new(Vec::new()),
                stats: Arc::clone(&self.stats),
                hash_policy: self.hash_policy.clone(),
            },
        }
    }

    /// Balancer counters
    #[must_use]
    pub fn stats(&self) -> &BalancerStats {
        &self.stats
    }
}

/// A data-plane balancer bound to the snapshot observed at creation
pub struct WorkerBalancer {
    per_priority_state: Option<Arc<Vec<PerPriorityState>>>,
    healthy_load: Arc<Vec<u32>>,
    degraded_load: Arc<Vec<u32>>,
    stats: Arc<BalancerStats>,
    hash_policy: Option<Arc<dyn HashPolicy>>,
}

impl WorkerBalancer {
    /// Choose an upstream host for one request
    ///
    /// Fully synchronous. Returns `None` when no snapshot has been
    /// published, when the priority's hashing structure is empty, or when
    /// the chosen structure yields nothing. With no hash available from
    /// either the hash policy or the context, a fresh random value is used;
    /// consistent hashing silently degenerates to random balancing in that
    /// case.
    pub fn choose_host(&self, context: &mut dyn LoadBalancerContext) -> Option<Arc<Host>> {
        let per_priority = self.per_priority_state.as_ref()?;

        // The hash policy wins over the context's own key.
        let hash = match &self.hash_policy {
            Some(policy) => policy.generate_hash(context),
            None => context.compute_hash_key(),
        };
        let h = hash.unwrap_or_else(rand::random);

        let (priority, _) = choose_priority(h, &self.healthy_load, &self.degraded_load);
        let state = per_priority.get(priority)?;
        if state.panic {
            self.stats.lb_healthy_panic.fetch_add(1, Ordering::Relaxed);
        }

        let max_attempts = context.host_selection_retry_count() + 1;
        let mut host = None;
        for attempt in 0..max_attempts {
            host = state.lb.choose_host(h, attempt);
            match &host {
                None => return None,
                Some(candidate) => {
                    if !context.should_select_another_host(candidate) {
                        return host;
                    }
                }
            }
        }
        host
    }
}

/// Control-plane owner of the snapshot pipeline
pub struct ThreadAwareBalancer {
    priority_set: Arc<PrioritySet>,
    factory: Arc<LoadBalancerFactory>,
    builder: Box<dyn LoadBalancerBuilder>,
    locality_weighted_balancing: bool,
    overprovisioning_factor: u32,
    panic_threshold_percent: u32,
}

impl ThreadAwareBalancer {
    /// Create a balancer over `priority_set` using `builder` per priority
    #[must_use]
    pub fn new(
        priority_set: Arc<PrioritySet>,
        builder: Box<dyn LoadBalancerBuilder>,
        hash_policy: Option<Arc<dyn HashPolicy>>,
        locality_weighted_balancing: bool,
    ) -> Self {
        Self {
            priority_set,
            factory: Arc::new(LoadBalancerFactory::new(hash_policy)),
            builder,
            locality_weighted_balancing,
            overprovisioning_factor: DEFAULT_OVERPROVISIONING_FACTOR,
            panic_threshold_percent: DEFAULT_PANIC_THRESHOLD_PERCENT,
        }
    }

    /// Register for topology changes and build the first snapshot
    ///
    /// # Errors
    ///
    /// Propagates the first snapshot's build error; later refresh errors
    /// triggered by topology callbacks are logged and leave the previous
    /// snapshot active.
    pub fn initialize(self: &Arc<Self>) -> Result<(), BalancerError> {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.priority_set
            .add_priority_update_cb(Box::new(move |_priority| {
                if let Some(balancer) = weak.upgrade() {
                    if let Err(error) = balancer.refresh() {
                        warn!(%error, "load balancer snapshot rebuild failed");
                    }
                }
            }));
        self.refresh()
    }

    /// Rebuild the snapshot from the current topology and install it
    ///
    /// # Errors
    ///
    /// Returns weight-normalization or builder errors; the snapshot under
    /// construction is discarded and the published one stays active.
    pub fn refresh(&self) -> Result<(), BalancerError> {
        let host_sets = self.priority_set.host_sets();
        let (loads, panic_flags) = recalculate_priority_loads(
            &host_sets,
            self.overprovisioning_factor,
            self.panic_threshold_percent,
        );

        let mut per_priority = Vec::with_capacity(host_sets.len());
        for (priority, host_set) in host_sets.iter().enumerate() {
            let in_panic = panic_flags[priority];
            let (weights, min, max) =
                normalize_weights(host_set, in_panic, self.locality_weighted_balancing)?;
            let lb = self.builder.create_load_balancer(weights, min, max)?;
            per_priority.push(PerPriorityState {
                panic: in_panic,
                lb,
            });
        }

        debug!(
            priorities = per_priority.len(),
            "installing load balancer snapshot"
        );
        let mut state = self.factory.state.write();
        *state = Some(SnapshotState {
            per_priority: Arc::new(per_priority),
            healthy_load: Arc::new(loads.healthy),
            degraded_load: Arc::new(loads.degraded),
        });
        Ok(())
    }

    /// The factory workers obtain their balancers from
    #[must_use]
    pub fn factory(&self) -> Arc<LoadBalancerFactory> {
        Arc::clone(&self.factory)
    }
}
