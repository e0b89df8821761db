//! Priority-load vectors and priority selection
//!
//! Each priority advertises how much of the traffic it should absorb via
//! two load vectors, `healthy` and `degraded`, whose combined entries sum
//! to 100. Healthy capacity of the preferred priorities is consumed first;
//! degraded capacity only picks up what no healthy priority could take.
//!
//! [`choose_priority`] maps a request hash onto those vectors: the hash's
//! low-order bits become a point in `1..=100`, and the first priority whose
//! cumulative load covers the point wins. A priority whose healthy fraction
//! dropped below the panic threshold raises its panic flag and serves from
//! all of its hosts instead of only the healthy ones.

use std::sync::Arc;

use super::host::HostSet;

/// Healthy fraction below which a priority panics, in percent
pub const DEFAULT_PANIC_THRESHOLD_PERCENT: u32 = 50;

/// Extra capacity credited to healthy hosts, in percent
pub const DEFAULT_OVERPROVISIONING_FACTOR: u32 = 140;

/// Which availability band a priority was chosen from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAvailability {
    /// Chosen from healthy capacity
    Healthy,
    /// Chosen from degraded capacity
    Degraded,
}

/// Per-priority traffic shares; `healthy` and `degraded` sum to 100 combined
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorityLoads {
    /// Share served from healthy hosts, per priority
    pub healthy: Vec<u32>,
    /// Share served from degraded hosts, per priority
    pub degraded: Vec<u32>,
}

/// Map a hash onto the priority-load vectors
///
/// The hash's low-order bits select a point in `1..=100`; the cumulative
/// healthy loads are scanned first, then the degraded loads. The vectors
/// always sum to 100 combined, so the fallback return is unreachable for
/// well-formed loads.
#[must_use]
pub fn choose_priority(
    hash: u64,
    healthy: &[u32],
    degraded: &[u32],
) -> (usize, HostAvailability) {
    let point = (hash % 100 + 1) as u32;
    let mut aggregate = 0u32;
    for (priority, load) in healthy.iter().enumerate() {
        aggregate += load;
        if point <= aggregate {
            return (priority, HostAvailability::Healthy);
        }
    }
    for (priority, load) in degraded.iter().enumerate() {
        aggregate += load;
        if point <= aggregate {
            return (priority, HostAvailability::Degraded);
        }
    }
    (0, HostAvailability::Healthy)
}

fn availability_percent(total: usize, count: usize, overprovisioning_factor: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    let scaled = (count as u64 * 100 * u64::from(overprovisioning_factor)) / (total as u64 * 100);
    scaled.min(100) as u32
}

/// Recompute the load vectors and panic flags for a topology
///
/// Returns the per-priority loads together with one panic flag per
/// priority. A priority panics when its raw healthy percentage (without
/// the overprovisioning credit) is below `panic_threshold_percent`; an
/// empty priority is exempt. When no priority has any availability at all,
/// the entire load collapses onto priority 0, which is then serving in
/// panic from all of its hosts.
#[must_use]
pub fn recalculate_priority_loads(
    host_sets: &[Arc<HostSet>],
    overprovisioning_factor: u32,
    panic_threshold_percent: u32,
) -> (PriorityLoads, Vec<bool>) {
    let count = host_sets.len();
    let mut healthy_availability = vec![0u32; count];
    let mut degraded_availability = vec![0u32; count];
    let mut panic_flags = vec![false; count];

    for (i, set) in host_sets.iter().enumerate() {
        let total = set.hosts.len();
        healthy_availability[i] =
            availability_percent(total, set.healthy_hosts.len(), overprovisioning_factor);
        // Degraded capacity never exceeds what healthy capacity left open.
        degraded_availability[i] =
            availability_percent(total, set.degraded_hosts.len(), overprovisioning_factor)
                .min(100 - healthy_availability[i]);

        let healthy_percent = if total == 0 {
            100
        } else {
            (set.healthy_hosts.len() * 100 / total) as u32
        };
        panic_flags[i] = healthy_percent < panic_threshold_percent;
    }

    let total_availability: u32 = healthy_availability
        .iter()
        .chain(degraded_availability.iter())
        .sum::<u32>()
        .min(100);

    let mut loads = PriorityLoads {
        healthy: vec![0; count],
        degraded: vec![0; count],
    };

    if total_availability == 0 {
        // Nothing is available anywhere; all traffic lands on the first
        // priority, which serves in panic mode from all of its hosts.
        if count > 0 {
            loads.healthy[0] = 100;
            panic_flags[0] = true;
        }
        return (loads, panic_flags);
    }

    let mut remaining = 100u32;
    for i in 0..count {
        let share =
            (u64::from(healthy_availability[i]) * 100 / u64::from(total_availability)) as u32;
        loads.healthy[i] = share.min(remaining);
        remaining -= loads.healthy[i];
    }
    for i in 0..count {
        let share =
            (u64::from(degraded_availability[i]) * 100 / u64::from(total_availability)) as u32;
        loads.degraded[i] = share.min(remaining);
        remaining -= loads.degraded[i];
    }

    // Rounding leftovers go to the first priority with any availability.
    if remaining > 0 {
        for i in 0..count {
            if healthy_availability[i] > 0 {
                loads.healthy[i] += remaining;
                remaining = 0;
                break;
            }
        }
        for i in 0..count {
            if remaining > 0 && degraded_availability[i] > 0 {
                loads.degraded[i] += remaining;
                remaining = 0;
            }
        }
    }
    debug_assert_eq!(
        loads.healthy.iter().chain(loads.degraded.iter()).sum::<u32>(),
        100
    );

    (loads, panic_flags)
}
