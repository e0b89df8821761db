//! Hot-swappable filter-chain engine with lock-free lookup
//!
//! The engine owns the published generation of a listener's filter chains
//! behind an `ArcSwap`, so data-plane lookups are lock-free while the
//! control plane atomically replaces whole generations.
//!
//! ```text
//! Connection -> FilterChainEngine::find_filter_chain() -> ArcSwap::load()
//!                                                              |
//!                                                       (lock-free read)
//!
//! Reconfigure -> FilterChainEngine::reload() -> build with inheritance
//!                     -> drain displaced chains -> ArcSwap::store()
//! ```
//!
//! A reload builds the new generation against the current one, so chains
//! with unchanged predicates are adopted as-is. Chains the new generation
//! did not adopt flip to draining and move onto the engine's
//! `draining_filter_chains` list; they are destroyed once the last
//! connection holding them closes. The reload critical section (compare,
//! publish, record drains) runs under a single writer lock; a worker
//! either observes the old generation entirely or the new one entirely.
//!
//! # Example
//!
//! ```
//! use conn_dispatch::filter_chain::{FilterChainConfig, FilterChainEngine, FilterChainMatch};
//! use conn_dispatch::net::socket::ConnectionSocket;
//!
//! let chains = vec![FilterChainConfig {
//!     name: "https".into(),
//!     filter_chain_match: FilterChainMatch {
//!         destination_port: Some(443),
//!         ..FilterChainMatch::default()
//!     },
//!     ..FilterChainConfig::default()
//! }];
//! let engine = FilterChainEngine::new(&chains, None, None).unwrap();
//!
//! let socket = ConnectionSocket::new(
//!     "10.0.0.1:443".parse().unwrap(),
//!     "203.0.113.9:40000".parse().unwrap(),
//! );
//! assert_eq!(engine.find_filter_chain(&socket).unwrap().name(), "https");
//! ```

use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::FilterChainError;
use crate::net::socket::ConnectionSocket;

use super::chain::FilterChain;
use super::config::{FilterChainConfig, ListenerFilterChains};
use super::manager::FilterChainManager;
use super::match_tree::MatchTreeConfig;

/// Published filter-chain state with atomic generation replacement
pub struct FilterChainEngine {
    /// Current generation (lock-free reads via `ArcSwap`)
    current: ArcSwap<FilterChainManager>,

    /// Serializes the compare-publish-drain critical section
    install_lock: Mutex<()>,

    /// Chains displaced by a reload, kept until their connections close
    draining: RwLock<Vec<Arc<FilterChain>>>,
}

impl FilterChainEngine {
    /// Build and publish the first generation
    ///
    /// # Errors
    ///
    /// Returns the build-time [`FilterChainError`] taxonomy; nothing is
    /// published on failure.
    pub fn new(
        chains: &[FilterChainConfig],
        default_chain: Option<&FilterChainConfig>,
        match_tree: Option<&MatchTreeConfig>,
    ) -> Result<Self, FilterChainError> {
        let manager = FilterChainManager::new(chains, default_chain, match_tree)?;
        Ok(Self {
            current: ArcSwap::from_pointee(manager),
            install_lock: Mutex::new(()),
            draining: RwLock::new(Vec::new()),
        })
    }

    /// Build the first generation from a listener configuration
    ///
    /// # Errors
    ///
    /// Same as [`Self::new`].
    pub fn from_listener(config: &ListenerFilterChains) -> Result<Self, FilterChainError> {
        Self::new(
            &config.filter_chains,
            config.default_filter_chain.as_ref(),
            config.match_tree.as_ref(),
        )
    }

    /// Reload from a listener configuration
    ///
    /// # Errors
    ///
    /// Same as [`Self::reload`].
    pub fn reload_listener(&self, config: &ListenerFilterChains) -> Result<(), FilterChainError> {
        self.reload(
            &config.filter_chains,
            config.default_filter_chain.as_ref(),
            config.match_tree.as_ref(),
        )
    }

    /// Get the current generation (lock-free read)
    ///
    /// The returned guard keeps the generation alive, which is useful for
    /// batch dispatch where several lookups must observe one snapshot.
    pub fn load(&self) -> Guard<Arc<FilterChainManager>> {
        self.current.load()
    }

    /// Select the filter chain for an accepted connection
    ///
    /// Lock-free; safe to call from every worker thread. The returned
    /// `Arc` keeps the chain alive for the connection's lifetime even if a
    /// reload displaces it meanwhile.
    #[must_use]
    pub fn find_filter_chain(&self, socket: &ConnectionSocket) -> Option<Arc<FilterChain>> {
        self.current.load().find_filter_chain(socket).cloned()
    }

    /// Build a new generation against the current one and publish it
    ///
    /// Chains with byte-identical predicates are adopted from the current
    /// generation (object identity preserved); everything else is built
    /// fresh. Displaced chains start draining.
    ///
    /// # Errors
    ///
    /// On any build error the previously published generation remains
    /// active and no chain starts draining.
    pub fn reload(
        &self,
        chains: &[FilterChainConfig],
        default_chain: Option<&FilterChainConfig>,
        match_tree: Option<&MatchTreeConfig>,
    ) -> Result<(), FilterChainError> {
        let _install = self.install_lock.lock();
        let old = self.current.load_full();
        let new =
            FilterChainManager::new_with_origin(chains, default_chain, match_tree, &old)?;

        let mut displaced = Vec::new();
        for (chain_match, chain) in old.chains() {
            let adopted = new
                .chain_for_match(chain_match)
                .is_some_and(|c| Arc::ptr_eq(c, chain));
            if !adopted {
                displaced.push(Arc::clone(chain));
            }
        }
        if let Some(old_default) = old.default_filter_chain() {
            let adopted = new
                .default_filter_chain()
                .is_some_and(|c| Arc::ptr_eq(c, old_default));
            if !adopted {
                displaced.push(Arc::clone(old_default));
            }
        }

        info!(
            chains = new.len(),
            draining = displaced.len(),
            "installing filter chain generation"
        );

        {
            let mut draining = self.draining.write();
            for chain in displaced {
                chain.start_draining();
                debug!(chain = chain.name(), "filter chain draining");
                draining.push(chain);
            }
        }
        self.current.store(Arc::new(new));
        Ok(())
    }

    /// Snapshot of the chains currently draining (for metrics)
    #[must_use]
    pub fn draining_filter_chains(&self) -> Vec<Arc<FilterChain>> {
        self.draining.read().clone()
    }

    /// Drop draining chains that no connection references any longer
    ///
    /// Returns how many chains were destroyed.
    pub fn prune_drained(&self) -> usize {
        let mut draining = self.draining.write();
        let before = draining.len();
        draining.retain(|chain| Arc::strong_count(chain) > 1);
        before - draining.len()
    }
}

impl std::fmt::Debug for FilterChainEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChainEngine")
            .field("current", &self.current.load())
            .field("draining", &self.draining.read().len())
            .finish()
    }
}
