//! Host weight normalization
//!
//! Before a hashing structure is built, the hosts of a priority are flattened
//! into an ordered vector of `(host, weight)` pairs whose weights sum to 1.0.
//! Two paths exist:
//!
//! - **Flat**: locality-weighted balancing disabled or no locality weights
//!   configured. Host weights are normalized directly over the flat host
//!   list (all hosts in panic mode, healthy hosts otherwise).
//! - **Locality**: locality weights are normalized first; each host's weight
//!   is then normalized within its locality and scaled by the locality's
//!   share. A zero-weight locality contributes no hosts at all; if every
//!   locality weighs zero the result is empty and the priority's balancer
//!   always answers "no host".
//!
//! Weight sums are accumulated in u64 and rejected above `u32::MAX`.

use std::sync::Arc;

use crate::error::BalancerError;

use super::host::{Host, HostSet};

/// Ordered `(host, weight)` pairs; weights sum to 1.0 when non-empty
pub type NormalizedHostWeights = Vec<(Arc<Host>, f64)>;

fn normalize_host_weights(
    hosts: &[Arc<Host>],
    normalized_locality_weight: f64,
    out: &mut NormalizedHostWeights,
    min_normalized_weight: &mut f64,
    max_normalized_weight: &mut f64,
) -> Result<(), BalancerError> {
    // The sum must stay within u32 range; accumulate in u64 to detect it.
    let mut sum: u64 = 0;
    for host in hosts {
        sum += u64::from(host.weight());
        if sum > u64::from(u32::MAX) {
            return Err(BalancerError::host_weight_overflow());
        }
    }

    for host in hosts {
        let weight = f64::from(host.weight()) * normalized_locality_weight / sum as f64;
        out.push((Arc::clone(host), weight));
        *min_normalized_weight = min_normalized_weight.min(weight);
        *max_normalized_weight = max_normalized_weight.max(weight);
    }
    Ok(())
}

fn normalize_locality_weights(
    hosts_per_locality: &[Vec<Arc<Host>>],
    locality_weights: &[u32],
    out: &mut NormalizedHostWeights,
    min_normalized_weight: &mut f64,
    max_normalized_weight: &mut f64,
) -> Result<(), BalancerError> {
    if locality_weights.len() != hosts_per_locality.len() {
        return Err(BalancerError::MismatchedLocalityWeights {
            weights: locality_weights.len(),
            localities: hosts_per_locality.len(),
        });
    }

    let mut sum: u64 = 0;
    for weight in locality_weights {
        sum += u64::from(*weight);
        if sum > u64::from(u32::MAX) {
            return Err(BalancerError::locality_weight_overflow());
        }
    }

    // Locality weights (unlike host weights) may be 0. If all of them are,
    // the priority produces an empty balancer.
    if sum == 0 {
        return Ok(());
    }

    for (i, &locality_weight) in locality_weights.iter().enumerate() {
        if locality_weight != 0 {
            let normalized_locality_weight = f64::from(locality_weight) / sum as f64;
            normalize_host_weights(
                &hosts_per_locality[i],
                normalized_locality_weight,
                out,
                min_normalized_weight,
                max_normalized_weight,
            )?;
        }
    }
    Ok(())
}

/// Normalize a priority's host weights into a vector summing to 1.0
///
/// Returns the vector together with the minimum and maximum normalized
/// weights observed (1.0 and 0.0 respectively when the vector is empty).
///
/// # Errors
///
/// Returns [`BalancerError::WeightOverflow`] when a weight sum exceeds
/// `u32::MAX` and [`BalancerError::MismatchedLocalityWeights`] when the
/// locality weight vector does not line up with the locality groups.
pub fn normalize_weights(
    host_set: &HostSet,
    in_panic: bool,
    locality_weighted_balancing: bool,
) -> Result<(NormalizedHostWeights, f64, f64), BalancerError> {
    let mut out = NormalizedHostWeights::new();
    let mut min_normalized_weight = 1.0;
    let mut max_normalized_weight = 0.0;

    let locality_weights = host_set.locality_weights.as_deref().unwrap_or(&[]);
    if !locality_weighted_balancing || locality_weights.is_empty() {
        let hosts = if in_panic {
            &host_set.hosts
        } else {
            &host_set.healthy_hosts
        };
        if !hosts.is_empty() {
            normalize_host_weights(
                hosts,
                1.0,
                &mut out,
                &mut min_normalized_weight,
                &mut max_normalized_weight,
            )?;
        }
    } else {
        let hosts_per_locality = if in_panic {
            &host_set.hosts_per_locality
        } else {
            &host_set.healthy_hosts_per_locality
        };
        normalize_locality_weights(
            hosts_per_locality,
            locality_weights,
            &mut out,
            &mut min_normalized_weight,
            &mut max_normalized_weight,
        )?;
    }
    Ok((out, min_normalized_weight, max_normalized_weight))
}
