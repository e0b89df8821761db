//! Thread-aware hash load balancing subsystem
//!
//! Precomputes, on the control thread, a sharable read-only snapshot from a
//! priority/locality/host topology, and serves per-request `choose_host`
//! queries from many worker threads with no mutation of shared state.
//!
//! # Data Flow
//! ```text
//! PrioritySet change
//!     -> weights.rs (normalize host and locality weights)
//!     -> ring.rs / maglev.rs (precompute hashing structure per priority)
//!     -> bounded.rs (optional per-host load ceiling)
//!     -> thread_aware.rs (atomic snapshot install under the writer lock)
//!
//! Worker: factory.create() -> WorkerBalancer
//!     -> affinity.rs (hash policy, session cookie)
//!     -> priority.rs (map hash to a priority)
//!     -> choose_host -> Arc<Host> or none
//! ```
//!
//! # Design Decisions
//! - Snapshots are immutable after publication; a topology change rebuilds
//!   the whole snapshot rather than patching it
//! - Worker balancers bind to the snapshot observed at creation
//! - All host choice is synchronous; there are no suspension points

pub mod affinity;
pub mod bounded;
pub mod host;
pub mod maglev;
pub mod priority;
pub mod ring;
pub mod thread_aware;
pub mod weights;

pub use affinity::{CookieAttribute, CookieHashPolicy, HashPolicy};
pub use bounded::{BoundedLoadBalancer, BoundedLoadBuilder};
pub use host::{ActiveRequestGuard, ClusterStats, Host, HostSet, HostStats, Locality, PrioritySet};
pub use maglev::{MaglevBalancer, MaglevConfig};
pub use priority::{choose_priority, HostAvailability, PriorityLoads};
pub use ring::{RingHashBalancer, RingHashConfig};
pub use thread_aware::{
    BalancerStats, HashingLoadBalancer, HeadersModifier, LoadBalancerBuilder,
    LoadBalancerContext, LoadBalancerFactory, StreamInfo, ThreadAwareBalancer, WorkerBalancer,
};
pub use weights::{normalize_weights, NormalizedHostWeights};
