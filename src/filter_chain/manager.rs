//! Filter-chain manager: owns one immutable generation of filter chains
//!
//! A [`FilterChainManager`] is built once, on the control plane, from the
//! listener's filter-chain configuration. It validates every predicate,
//! rejects duplicate predicates naming both offenders, materializes the
//! nested index (or the match tree), and resolves the optional default
//! chain. After construction it is immutable; the
//! [`FilterChainEngine`](super::engine::FilterChainEngine) publishes
//! generations to the data plane.
//!
//! When a manager is built *from a parent generation*, every chain whose
//! match predicate is byte-identical to a parent chain reuses the parent's
//! chain object, with the same `Arc`, factory context, and warm state, so a
//! listener update does not tear down TLS contexts for unchanged chains.
//! The default chain is reused under the same rule (identical default
//! configuration).

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::FilterChainError;
use crate::net::socket::ConnectionSocket;

use super::chain::FilterChain;
use super::config::{FilterChainConfig, FilterChainMatch};
use super::index::{ChainIndex, ChainIndexBuilder};
use super::match_tree::MatchTreeConfig;

/// One immutable generation of filter chains for a listener
pub struct FilterChainManager {
    index: ChainIndex,
    match_tree: Option<MatchTreeConfig>,
    chains_by_name: HashMap<String, Arc<FilterChain>>,
    chains_by_match: HashMap<FilterChainMatch, Arc<FilterChain>>,
    default_chain: Option<Arc<FilterChain>>,
    default_chain_config: Option<FilterChainConfig>,
}

impl FilterChainManager {
    /// Build a first-generation manager
    ///
    /// # Errors
    ///
    /// Returns the build-time [`FilterChainError`] taxonomy: duplicate
    /// predicates, invalid CIDRs or wildcards, conflicting source types,
    /// and (in match-tree mode) name violations.
    pub fn new(
        chains: &[FilterChainConfig],
        default_chain: Option<&FilterChainConfig>,
        match_tree: Option<&MatchTreeConfig>,
    ) -> Result<Self, FilterChainError> {
        Self::build(chains, default_chain, match_tree, None)
    }

    /// Build a manager that inherits unchanged chains from a parent
    ///
    /// # Errors
    ///
    /// Same as [`Self::new`].
    pub fn new_with_origin(
        chains: &[FilterChainConfig],
        default_chain: Option<&FilterChainConfig>,
        match_tree: Option<&MatchTreeConfig>,
        origin: &Self,
    ) -> Result<Self, FilterChainError> {
        Self::build(chains, default_chain, match_tree, Some(origin))
    }

    fn build(
        chains: &[FilterChainConfig],
        default_chain: Option<&FilterChainConfig>,
        match_tree: Option<&MatchTreeConfig>,
        origin: Option<&Self>,
    ) -> Result<Self, FilterChainError> {
        let mut chains_by_name = HashMap::new();
        let mut chains_by_match: HashMap<FilterChainMatch, Arc<FilterChain>> = HashMap::new();
        let mut builder = ChainIndexBuilder::new();
        let mut reused = 0usize;

        for config in chains {
            config.filter_chain_match.validate(&config.name)?;

            // With a match tree the nested index is never populated, so the
            // duplicate-predicate check must run here; without one, the
            // index insertion below detects colliding paths itself.
            if match_tree.is_some() {
                if let Some(existing) = chains_by_match.get(&config.filter_chain_match) {
                    return Err(FilterChainError::duplicate(existing.name(), config.name.as_str()));
                }
            }

            let chain = match origin.and_then(|o| o.chain_for_match(&config.filter_chain_match)) {
                Some(parent_chain) => {
                    reused += 1;
                    Arc::clone(parent_chain)
                }
                None => Arc::new(FilterChain::from_config(config)),
            };

            if match_tree.is_some() {
                if config.name.is_empty() {
                    return Err(FilterChainError::ChainNameRequired);
                }
                if chains_by_name
                    .insert(config.name.clone(), Arc::clone(&chain))
                    .is_some()
                {
                    return Err(FilterChainError::DuplicateChainName(config.name.clone()));
                }
            } else {
                builder.add_chain(&config.filter_chain_match, &chain)?;
            }

            chains_by_match.insert(config.filter_chain_match.clone(), chain);
        }

        if let Some(tree) = match_tree {
            tree.validate_names(&|name: &str| chains_by_name.contains_key(name))?;
        }

        let default = match default_chain {
            Some(config) => {
                let reuse = origin.and_then(|o| {
                    (o.default_chain_config.as_ref() == Some(config))
                        .then(|| o.default_chain.clone())
                        .flatten()
                });
                Some(match reuse {
                    Some(chain) => chain,
                    None => Arc::new(FilterChain::from_config(config)),
                })
            }
            None => None,
        };

        debug!(
            chains = chains.len(),
            reused,
            match_tree = match_tree.is_some(),
            has_default = default.is_some(),
            "filter chain manager built"
        );

        Ok(Self {
            index: builder.freeze()?,
            match_tree: match_tree.cloned(),
            chains_by_name,
            chains_by_match,
            default_chain: default,
            default_chain_config: default_chain.cloned(),
        })
    }

    /// Select the filter chain for an accepted connection
    ///
    /// Returns the matched chain, the default chain when nothing matches,
    /// or `None` when there is no default either. Never fails.
    #[must_use]
    pub fn find_filter_chain(&self, socket: &ConnectionSocket) -> Option<&Arc<FilterChain>> {
        if let Some(tree) = &self.match_tree {
            if let Some(name) = tree.evaluate(socket) {
                if let Some(chain) = self.chains_by_name.get(name) {
                    return Some(chain);
                }
            }
            return self.default_chain.as_ref();
        }
        self.index.find(socket).or(self.default_chain.as_ref())
    }

    /// The chain registered for a byte-identical predicate, if any
    #[must_use]
    pub fn chain_for_match(&self, chain_match: &FilterChainMatch) -> Option<&Arc<FilterChain>> {
        self.chains_by_match.get(chain_match)
    }

    /// The fallback chain, if configured
    #[must_use]
    pub const fn default_filter_chain(&self) -> Option<&Arc<FilterChain>> {
        self.default_chain.as_ref()
    }

    /// Iterate all chains of this generation keyed by predicate
    pub fn chains(&self) -> impl Iterator<Item = (&FilterChainMatch, &Arc<FilterChain>)> {
        self.chains_by_match.iter()
    }

    /// Number of chains in this generation
    #[must_use]
    pub fn len(&self) -> usize {
        self.chains_by_match.len()
    }

    /// True when this generation carries no chains
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chains_by_match.is_empty()
    }
}

impl std::fmt::Debug for FilterChainManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChainManager")
            .field("chains", &self.chains_by_match.len())
            .field("match_tree", &self.match_tree.is_some())
            .field("has_default", &self.default_chain.is_some())
            .finish()
    }
}
