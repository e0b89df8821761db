//! Maglev consistent hashing table
//!
//! Builds the fixed-size lookup table from the maglev paper: every host
//! owns a permutation of the table positions derived from two hashes of
//! its address, and hosts take turns claiming their next free position
//! until the table is full. Host weights throttle the turn-taking: a host
//! at half the maximum normalized weight claims a position every other
//! round. Lookup is a single modulo.
//!
//! The table size must be prime for the permutations to cover every slot.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use xxhash_rust::xxh64::xxh64;

use crate::error::BalancerError;

use super::host::Host;
use super::ring::remix_for_attempt;
use super::thread_aware::{HashingLoadBalancer, LoadBalancerBuilder};
use super::weights::NormalizedHostWeights;

/// Default table size, the prime used by the maglev paper
pub const DEFAULT_TABLE_SIZE: u64 = 65537;

fn default_table_size() -> u64 {
    DEFAULT_TABLE_SIZE
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3u64;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

/// Maglev configuration; doubles as the per-priority builder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaglevConfig {
    /// Number of table slots; must be prime
    #[serde(default = "default_table_size")]
    pub table_size: u64,
}

impl Default for MaglevConfig {
    fn default() -> Self {
        Self {
            table_size: DEFAULT_TABLE_SIZE,
        }
    }
}

impl LoadBalancerBuilder for MaglevConfig {
    fn create_load_balancer(
        &self,
        weights: NormalizedHostWeights,
        _min_normalized_weight: f64,
        max_normalized_weight: f64,
    ) -> Result<Box<dyn HashingLoadBalancer>, BalancerError> {
        if !is_prime(self.table_size) {
            return Err(BalancerError::InvalidTableSize(self.table_size));
        }
        Ok(Box::new(MaglevBalancer::build(
            &weights,
            max_normalized_weight,
            self.table_size,
        )))
    }
}

struct TableBuildEntry {
    host: Arc<Host>,
    offset: u64,
    skip: u64,
    weight: f64,
    target_weight: f64,
    next: u64,
}

/// Immutable maglev lookup table for one priority
#[derive(Debug)]
pub struct MaglevBalancer {
    table: Vec<Arc<Host>>,
}

impl MaglevBalancer {
    /// Populate the table from normalized weights
    #[must_use]
    pub fn build(
        weights: &NormalizedHostWeights,
        max_normalized_weight: f64,
        table_size: u64,
    ) -> Self {
        if weights.is_empty() || max_normalized_weight <= 0.0 {
            return Self { table: Vec::new() };
        }

        let mut entries: Vec<TableBuildEntry> = weights
            .iter()
            .map(|(host, weight)| {
                let address = host.address().to_string();
                TableBuildEntry {
                    host: Arc::clone(host),
                    offset: xxh64(address.as_bytes(), 0) % table_size,
                    skip: xxh64(address.as_bytes(), 1) % (table_size - 1) + 1,
                    weight: *weight,
                    target_weight: 0.0,
                    next: 0,
                }
            })
            .collect();

        let size = table_size as usize;
        let mut table: Vec<Option<Arc<Host>>> = vec![None; size];
        let mut filled = 0usize;
        while filled < size {
            for entry in &mut entries {
                if filled == size {
                    break;
                }
                // Weighted turn-taking: a host claims a slot only once its
                // accumulated weight reaches the maximum normalized weight.
                entry.target_weight += entry.weight;
                if entry.target_weight < max_normalized_weight {
                    continue;
                }
                entry.target_weight -= max_normalized_weight;

                let mut position = ((entry.offset + entry.skip * entry.next) % table_size) as usize;
                while table[position].is_some() {
                    entry.next += 1;
                    position = ((entry.offset + entry.skip * entry.next) % table_size) as usize;
                }
                table[position] = Some(Arc::clone(&entry.host));
                entry.next += 1;
                filled += 1;
            }
        }

        debug!(
            hosts = weights.len(),
            table_size, "maglev table populated"
        );
        Self {
            table: table.into_iter().map(|slot| slot.expect("table full")).collect(),
        }
    }

    /// Number of table slots
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// True when the table carries no slots
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl HashingLoadBalancer for MaglevBalancer {
    fn choose_host(&self, hash: u64, attempt: u32) -> Option<Arc<Host>> {
        if self.table.is_empty() {
            return None;
        }
        let h = remix_for_attempt(hash, attempt);
        let slot = (h % self.table.len() as u64) as usize;
        Some(Arc::clone(&self.table[slot]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::host::ClusterStats;
    use std::collections::HashMap;

    fn weighted_hosts(weights: &[(u32, &str)]) -> NormalizedHostWeights {
        let cluster = Arc::new(ClusterStats::default());
        let total: f64 = weights.iter().map(|(w, _)| f64::from(*w)).sum();
        weights
            .iter()
            .map(|(w, addr)| {
                (
                    Arc::new(Host::new(addr.parse().unwrap(), *w, cluster.clone())),
                    f64::from(*w) / total,
                )
            })
            .collect()
    }

    #[test]
    fn test_is_prime() {
        assert!(is_prime(2));
        assert!(is_prime(65537));
        assert!(!is_prime(1));
        assert!(!is_prime(65536));
        assert!(!is_prime(100));
    }

    #[test]
    fn test_non_prime_table_size_rejected() {
        let config = MaglevConfig { table_size: 100 };
        let err = config
            .create_load_balancer(NormalizedHostWeights::new(), 1.0, 0.0)
            .unwrap_err();
        assert!(matches!(err, BalancerError::InvalidTableSize(100)));
    }

    #[test]
    fn test_empty_weights_build_empty_table() {
        let table = MaglevBalancer::build(&NormalizedHostWeights::new(), 0.0, 65537);
        assert!(table.is_empty());
        assert!(table.choose_host(1, 0).is_none());
    }

    #[test]
    fn test_table_is_full_and_deterministic() {
        let weights = weighted_hosts(&[(1, "10.0.0.1:80"), (1, "10.0.0.2:80")]);
        let table = MaglevBalancer::build(&weights, 0.5, 251);
        assert_eq!(table.len(), 251);
        let first = table.choose_host(12345, 0).unwrap();
        let again = table.choose_host(12345, 0).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn test_equal_weights_split_table_evenly() {
        let weights = weighted_hosts(&[(1, "10.0.0.1:80"), (1, "10.0.0.2:80")]);
        let table = MaglevBalancer::build(&weights, 0.5, 251);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for slot in 0..251u64 {
            let host = table.choose_host(slot, 0).unwrap();
            *counts.entry(host.address().to_string()).or_default() += 1;
        }
        let a = counts["10.0.0.1:80"];
        let b = counts["10.0.0.2:80"];
        assert!(a.abs_diff(b) <= 1, "a={a} b={b}");
    }

    #[test]
    fn test_weighted_hosts_get_proportional_slots() {
        let weights = weighted_hosts(&[(3, "10.0.0.1:80"), (1, "10.0.0.2:80")]);
        let table = MaglevBalancer::build(&weights, 0.75, 251);
        let mut heavy = 0usize;
        for slot in 0..251u64 {
            if table.choose_host(slot, 0).unwrap().address() == "10.0.0.1:80".parse().unwrap() {
                heavy += 1;
            }
        }
        // Roughly three quarters of the table.
        assert!(heavy > 160 && heavy < 215, "heavy={heavy}");
    }
}
