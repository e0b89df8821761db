//! Filter chain objects and their factory contexts
//!
//! A [`FilterChain`] is an owned, immutable description of the pipeline
//! applied to an accepted connection: transport-socket configuration, the
//! ordered network-filter factory list, a connect timeout, a stable name,
//! and an "added via API" flag. Chains are shared as `Arc<FilterChain>`;
//! the index holds one reference and every in-flight connection holds one,
//! so a chain outlives the snapshot that created it for exactly as long as
//! connections still use it.
//!
//! The per-chain [`FilterChainFactoryContext`] carries the draining flag.
//! It flips exactly once, when a snapshot replacement displaces the chain,
//! and connections consult it through [`FilterChain::drain_close`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::config::{FilterChainConfig, NetworkFilterConfig, TransportSocketConfig};

/// Per-chain factory context
///
/// Its lifetime bounds the connections that still hold the chain; dropping
/// the chain drops the context with it.
#[derive(Debug, Default)]
pub struct FilterChainFactoryContext {
    draining: AtomicBool,
}

impl FilterChainFactoryContext {
    /// Raise the draining flag; idempotent
    pub fn start_draining(&self) {
        self.draining.store(true, Ordering::Release);
    }

    /// Whether connections built from this context should drain and close
    #[must_use]
    pub fn drain_close(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }
}

/// An immutable network-filter pipeline selected per connection
#[derive(Debug)]
pub struct FilterChain {
    name: String,
    transport_socket: TransportSocketConfig,
    filters: Vec<NetworkFilterConfig>,
    transport_socket_connect_timeout: Duration,
    added_via_api: bool,
    factory_context: FilterChainFactoryContext,
}

impl FilterChain {
    /// Materialize a chain from its configuration
    #[must_use]
    pub fn from_config(config: &FilterChainConfig) -> Self {
        Self {
            name: config.name.clone(),
            transport_socket: config.transport_socket.clone(),
            filters: config.filters.clone(),
            transport_socket_connect_timeout: Duration::from_millis(
                config.transport_socket_connect_timeout_ms,
            ),
            added_via_api: config.added_via_api,
            factory_context: FilterChainFactoryContext::default(),
        }
    }

    /// Stable chain name; may be empty outside match-tree mode
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transport-socket factory configuration
    #[must_use]
    pub const fn transport_socket(&self) -> &TransportSocketConfig {
        &self.transport_socket
    }

    /// Ordered network-filter factory list
    #[must_use]
    pub fn network_filters(&self) -> &[NetworkFilterConfig] {
        &self.filters
    }

    /// Transport-socket connect timeout
    #[must_use]
    pub const fn transport_socket_connect_timeout(&self) -> Duration {
        self.transport_socket_connect_timeout
    }

    /// Whether the chain was added through the management API
    #[must_use]
    pub const fn added_via_api(&self) -> bool {
        self.added_via_api
    }

    /// Per-chain factory context
    #[must_use]
    pub const fn factory_context(&self) -> &FilterChainFactoryContext {
        &self.factory_context
    }

    /// Flip the chain into draining; connections consult [`Self::drain_close`]
    pub fn start_draining(&self) {
        self.factory_context.start_draining();
    }

    /// Whether the chain is draining
    #[must_use]
    pub fn drain_close(&self) -> bool {
        self.factory_context.drain_close()
    }
}
