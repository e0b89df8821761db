//! conn-dispatch: connection dispatch and upstream selection for a reverse proxy
//!
//! This crate provides the two hot-path engines at the core of a
//! layer-4/layer-7 reverse proxy:
//!
//! - **Filter-chain matching**: given an accepted downstream connection,
//!   select the network-filter pipeline whose criteria best fit the
//!   connection's 5-tuple, SNI, transport protocol, and ALPN.
//! - **Thread-aware hash load balancing**: precompute an immutable
//!   load-balancer snapshot from a priority/locality/host topology and
//!   answer per-request host queries from many worker threads, with
//!   consistent hashing and bounded-load overflow probing.
//!
//! # Architecture
//!
//! ```text
//! CIDR trie ─┐
//!            ├─► chain index ──► find_filter_chain ──► connection fan-out
//! Weight normalizer ─► LB snapshot ──► per-worker balancer ──► upstream host
//! ```
//!
//! Both engines follow one discipline: a control-plane writer periodically
//! rebuilds an immutable snapshot, and data-plane readers observe the
//! latest fully-formed snapshot through an atomic shared-reference
//! handoff. No lock is held across a data-plane lookup, and a reader never
//! observes a torn state.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use conn_dispatch::balancer::{
//!     ClusterStats, Host, HostSet, PrioritySet, RingHashConfig, ThreadAwareBalancer,
//! };
//! use conn_dispatch::filter_chain::{FilterChainConfig, FilterChainEngine, FilterChainMatch};
//! use conn_dispatch::net::socket::ConnectionSocket;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Filter-chain side: build and publish a generation.
//! let chains = vec![FilterChainConfig {
//!     name: "https".into(),
//!     filter_chain_match: FilterChainMatch {
//!         destination_port: Some(443),
//!         ..FilterChainMatch::default()
//!     },
//!     ..FilterChainConfig::default()
//! }];
//! let engine = FilterChainEngine::new(&chains, None, None)?;
//! let socket = ConnectionSocket::new(
//!     "10.0.0.1:443".parse()?,
//!     "203.0.113.9:40000".parse()?,
//! );
//! assert_eq!(engine.find_filter_chain(&socket).unwrap().name(), "https");
//!
//! // Balancer side: topology in, worker balancers out.
//! let cluster = Arc::new(ClusterStats::default());
//! let hosts = vec![
//!     Arc::new(Host::new("10.1.0.1:8080".parse()?, 3, cluster.clone())),
//!     Arc::new(Host::new("10.1.0.2:8080".parse()?, 1, cluster.clone())),
//! ];
//! let priority_set = Arc::new(PrioritySet::new());
//! priority_set.update_hosts(0, HostSet::all_healthy(hosts));
//! let balancer = Arc::new(ThreadAwareBalancer::new(
//!     priority_set,
//!     Box::new(RingHashConfig::default()),
//!     None,
//!     false,
//! ));
//! balancer.initialize()?;
//! let worker = balancer.factory().create();
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`balancer`]: Thread-aware hashing load balancer
//! - [`error`]: Error types
//! - [`filter_chain`]: Filter-chain index, lookup, and hot swap
//! - [`net`]: CIDR trie and connection metadata

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]

pub mod balancer;
pub mod error;
pub mod filter_chain;
pub mod net;

pub use balancer::{
    Host, HostSet, LoadBalancerContext, PrioritySet, ThreadAwareBalancer, WorkerBalancer,
};
pub use error::{BalancerError, DispatchError, FilterChainError};
pub use filter_chain::{
    FilterChain, FilterChainConfig, FilterChainEngine, FilterChainManager, FilterChainMatch,
};
pub use net::{CidrTrie, ConnectionSocket, SourceType};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
