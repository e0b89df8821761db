//! Ring-hash (ketama-style) consistent hashing
//!
//! Each host is hashed onto a ring a number of times proportional to its
//! normalized weight; a request hash resolves to the first ring entry at or
//! after it, wrapping around. The ring is sized so that even the host with
//! the smallest weight lands at least `minimum_ring_size` worth of entries
//! when it is the only host, capped by `maximum_ring_size`.
//!
//! Entry hashes are xxHash64 over `"<address>_<i>"`. Retry attempts remix
//! the request hash with the attempt counter so the walk visits alternate
//! positions deterministically.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use xxhash_rust::xxh64::xxh64;

use crate::error::BalancerError;

use super::host::Host;
use super::thread_aware::{HashingLoadBalancer, LoadBalancerBuilder};
use super::weights::NormalizedHostWeights;

const DEFAULT_MINIMUM_RING_SIZE: u64 = 1024;
const DEFAULT_MAXIMUM_RING_SIZE: u64 = 8 * 1024 * 1024;

fn default_minimum_ring_size() -> u64 {
    DEFAULT_MINIMUM_RING_SIZE
}

fn default_maximum_ring_size() -> u64 {
    DEFAULT_MAXIMUM_RING_SIZE
}

/// Ring-hash configuration; doubles as the per-priority builder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingHashConfig {
    /// Lower bound on the ring entry count
    #[serde(default = "default_minimum_ring_size")]
    pub minimum_ring_size: u64,

    /// Upper bound on the ring entry count
    #[serde(default = "default_maximum_ring_size")]
    pub maximum_ring_size: u64,
}

impl Default for RingHashConfig {
    fn default() -> Self {
        Self {
            minimum_ring_size: DEFAULT_MINIMUM_RING_SIZE,
            maximum_ring_size: DEFAULT_MAXIMUM_RING_SIZE,
        }
    }
}

impl LoadBalancerBuilder for RingHashConfig {
    fn create_load_balancer(
        &self,
        weights: NormalizedHostWeights,
        min_normalized_weight: f64,
        _max_normalized_weight: f64,
    ) -> Result<Box<dyn HashingLoadBalancer>, BalancerError> {
        if self.minimum_ring_size > self.maximum_ring_size {
            return Err(BalancerError::InvalidRingSize {
                minimum: self.minimum_ring_size,
                maximum: self.maximum_ring_size,
            });
        }
        Ok(Box::new(RingHashBalancer::build(
            &weights,
            min_normalized_weight,
            self.minimum_ring_size,
            self.maximum_ring_size,
        )))
    }
}

#[derive(Debug)]
struct RingEntry {
    hash: u64,
    host: Arc<Host>,
}

/// Immutable hash ring for one priority
#[derive(Debug)]
pub struct RingHashBalancer {
    ring: Vec<RingEntry>,
}

impl RingHashBalancer {
    /// Build a ring from normalized weights
    #[must_use]
    pub fn build(
        weights: &NormalizedHostWeights,
        min_normalized_weight: f64,
        minimum_ring_size: u64,
        maximum_ring_size: u64,
    ) -> Self {
        if weights.is_empty() {
            return Self { ring: Vec::new() };
        }

        // Scale the ring so the smallest-weighted host still gets a whole
        // number of entries, without exceeding the configured maximum.
        let scale = ((min_normalized_weight * minimum_ring_size as f64).ceil()
            / min_normalized_weight)
            .min(maximum_ring_size as f64);

        let mut ring = Vec::with_capacity(scale.ceil() as usize);
        let mut current_hashes = 0.0_f64;
        let mut target_hashes = 0.0_f64;
        for (host, weight) in weights {
            let address = host.address().to_string();
            target_hashes += scale * weight;
            let mut i = 0u64;
            while current_hashes < target_hashes {
                let entry_key = format!("{address}_{i}");
                ring.push(RingEntry {
                    hash: xxh64(entry_key.as_bytes(), 0),
                    host: Arc::clone(host),
                });
                i += 1;
                current_hashes += 1.0;
            }
        }
        ring.sort_by_key(|entry| entry.hash);

        debug!(
            hosts = weights.len(),
            entries = ring.len(),
            "hash ring built"
        );
        Self { ring }
    }

    /// Number of ring entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// True when the ring carries no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

/// Derive the lookup position for a retry attempt
pub(crate) fn remix_for_attempt(hash: u64, attempt: u32) -> u64 {
    if attempt == 0 {
        hash
    } else {
        xxh64(&attempt.to_le_bytes(), hash)
    }
}

impl HashingLoadBalancer for RingHashBalancer {
    fn choose_host(&self, hash: u64, attempt: u32) -> Option<Arc<Host>> {
        if self.ring.is_empty() {
            return None;
        }
        let h = remix_for_attempt(hash, attempt);
        let position = self.ring.partition_point(|entry| entry.hash < h) % self.ring.len();
        Some(Arc::clone(&self.ring[position].host))
    }
}
