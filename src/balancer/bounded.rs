//! Bounded-load consistent hashing
//!
//! Wraps another hashing structure and enforces a per-host ceiling on
//! active requests: `hash_balance_factor / 100` times the host's fair share
//! of the cluster-wide active-request count. A request whose primary host
//! is over its ceiling probes alternate hosts via a random walk seeded by
//! the request hash, so the same hash always probes the same sequence. If
//! every host is over its ceiling, the least-overloaded one serves.
//!
//! The walk uses a Mersenne-Twister PRNG and a rejection-sampling uniform
//! integer routine, both of which produce identical sequences for the same
//! seed on every platform. Library-provided uniform distributions are not
//! used; they are free to differ between platforms and versions.
//!
//! Host counters are read without synchronization against the requests
//! updating them; the ceiling is a hint, and slightly stale reads are
//! acceptable.

use std::collections::HashMap;
use std::sync::Arc;

use rand_mt::Mt;
use tracing::debug;

use crate::error::BalancerError;

use super::host::Host;
use super::thread_aware::{HashingLoadBalancer, LoadBalancerBuilder};
use super::weights::NormalizedHostWeights;

/// Builder wrapping another builder's structures with load bounds
pub struct BoundedLoadBuilder {
    hash_balance_factor: u32,
    inner: Box<dyn LoadBalancerBuilder>,
}

impl BoundedLoadBuilder {
    /// Bound the structures built by `inner` at
    /// `hash_balance_factor / 100` times the mean load
    ///
    /// A factor of 150 allows each host 1.5 times its fair share; very
    /// large factors degenerate to the plain wrapped hashing.
    #[must_use]
    pub fn new(hash_balance_factor: u32, inner: Box<dyn LoadBalancerBuilder>) -> Self {
        Self {
            hash_balance_factor,
            inner,
        }
    }
}

impl LoadBalancerBuilder for BoundedLoadBuilder {
    fn create_load_balancer(
        &self,
        weights: NormalizedHostWeights,
        min_normalized_weight: f64,
        max_normalized_weight: f64,
    ) -> Result<Box<dyn HashingLoadBalancer>, BalancerError> {
        let inner = self.inner.create_load_balancer(
            weights.clone(),
            min_normalized_weight,
            max_normalized_weight,
        )?;
        Ok(Box::new(BoundedLoadBalancer::new(
            inner,
            weights,
            self.hash_balance_factor,
        )))
    }
}

/// Generate a uniform integer in `[0, k)` by rejection sampling
///
/// Matches the portable routine the probe sequence is specified against:
/// divide by `(max + 1) / k` and reject results at or above `k`.
fn uniform_int(rng: &mut Mt, k: u32) -> u32 {
    let divisor = (u64::from(u32::MAX) + 1) / u64::from(k);
    let mut x = k;
    while x >= k {
        x = (u64::from(rng.next_u32()) / divisor) as u32;
    }
    x
}

/// Hashing structure enforcing per-host active-request ceilings
#[derive(Debug)]
pub struct BoundedLoadBalancer {
    hashing_lb: Box<dyn HashingLoadBalancer>,
    normalized_host_weights: NormalizedHostWeights,
    /// Normalized weight by host identity, for the primary's ceiling check
    weights_by_host: HashMap<usize, f64>,
    hash_balance_factor: u32,
}

impl BoundedLoadBalancer {
    /// Wrap `hashing_lb` with load bounds over `weights`
    #[must_use]
    pub fn new(
        hashing_lb: Box<dyn HashingLoadBalancer>,
        weights: NormalizedHostWeights,
        hash_balance_factor: u32,
    ) -> Self {
        let weights_by_host = weights
            .iter()
            .map(|(host, weight)| (Arc::as_ptr(host) as usize, *weight))
            .collect();
        Self {
            hashing_lb,
            normalized_host_weights: weights,
            weights_by_host,
            hash_balance_factor,
        }
    }

    /// Ratio of a host's active requests to its allowed slots
    ///
    /// `overload_factor > 1.0` means the host is over its ceiling; the
    /// boundary itself still admits the host.
    fn host_overload_factor(&self, host: &Host, weight: f64) -> f64 {
        let overall_active = host.cluster().upstream_rq_active();
        let host_active = host.stats().rq_active();

        let total_slots =
            (u64::from(overall_active) + 1) * u64::from(self.hash_balance_factor) + 99;
        let total_slots = total_slots / 100;
        let slots = ((total_slots as f64 * weight).ceil() as u64).max(1);

        if u64::from(host_active) > slots {
            debug!(
                host = %host.address(),
                overall_active,
                weight,
                host_active,
                slots,
                "host over its bounded-load ceiling"
            );
        }
        host_active as f64 / slots as f64
    }
}

impl HashingLoadBalancer for BoundedLoadBalancer {
    fn choose_host(&self, hash: u64, attempt: u32) -> Option<Arc<Host>> {
        if self.normalized_host_weights.is_empty() {
            return None;
        }

        let primary = self.hashing_lb.choose_host(hash, attempt)?;
        let weight = self
            .weights_by_host
            .get(&(Arc::as_ptr(&primary) as usize))
            .copied()
            .unwrap_or(0.0);
        let mut overload_factor = self.host_overload_factor(&primary, weight);
        if overload_factor <= 1.0 {
            return Some(primary);
        }

        // Probe alternates in a random order instead of walking the ring,
        // which avoids cascading overflow onto the next host. The sequence
        // is seeded by the hash, so the same request always probes the same
        // order.
        let num_hosts = self.normalized_host_weights.len();
        let mut host_index: Vec<u32> = (0..num_hosts as u32).collect();
        let mut rng = Mt::new(hash as u32);

        let mut least_overloaded = Arc::clone(&primary);
        let mut least_overload_factor = overload_factor;
        for i in 0..num_hosts {
            let j = uniform_int(&mut rng, (num_hosts - i) as u32) as usize;
            host_index.swap(i, i + j);

            let k = host_index[i] as usize;
            let (alt_host, alt_weight) = &self.normalized_host_weights[k];
            if Arc::ptr_eq(alt_host, &primary) {
                continue;
            }

            overload_factor = self.host_overload_factor(alt_host, *alt_weight);
            if overload_factor <= 1.0 {
                return Some(Arc::clone(alt_host));
            }
            if least_overload_factor > overload_factor {
                least_overloaded = Arc::clone(alt_host);
                least_overload_factor = overload_factor;
            }
        }

        Some(least_overloaded)
    }
}
