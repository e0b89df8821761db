//! Network primitives shared by the dispatch engines
//!
//! This module provides:
//! - [`cidr`]: Longest-prefix-match trie over CIDR ranges
//! - [`socket`]: Read-only connection metadata consumed by filter-chain lookup

pub mod cidr;
pub mod socket;

pub use cidr::{parse_cidr, CidrTrie};
pub use socket::{ConnectionSocket, SourceType};
