//! Filter-chain matching subsystem
//!
//! Given an accepted downstream connection, this subsystem selects the one
//! network-filter pipeline whose match criteria best fit the connection's
//! 5-tuple, SNI, transport protocol, and negotiated application protocol.
//! The match runs per connection on the hot accept path.
//!
//! # Data Flow
//! ```text
//! FilterChainConfig[] -> FilterChainManager (validate, index, freeze tries)
//!         -> FilterChainEngine (ArcSwap publish)
//!         -> find_filter_chain(socket) on worker threads
//!         -> Arc<FilterChain> handed to connection fan-out
//! ```
//!
//! # Design Decisions
//! - Generations are immutable after publication; a reload builds a new
//!   generation and swaps the shared reference atomically
//! - Unchanged predicates adopt the previous generation's chain objects, so
//!   TLS contexts and filter state stay warm across listener updates
//! - Displaced chains drain instead of closing their connections

pub mod chain;
pub mod config;
pub mod engine;
pub mod index;
pub mod manager;
pub mod match_tree;

pub use chain::{FilterChain, FilterChainFactoryContext};
pub use config::{
    FilterChainConfig, FilterChainMatch, ListenerFilterChains, NetworkFilterConfig,
    TransportSocketConfig,
};
pub use engine::FilterChainEngine;
pub use manager::FilterChainManager;
pub use match_tree::{MatchAction, MatchInput, MatchTreeConfig};
