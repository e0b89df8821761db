//! Longest-prefix-match trie over CIDR ranges
//!
//! The filter-chain index tests three of its dimensions (destination IP,
//! direct source IP, source IP) against sets of CIDR ranges. Each set is
//! frozen into an immutable binary trie after index construction; per
//! connection, `lookup` walks the address bits and returns the value stored
//! at the longest covering prefix.
//!
//! Lookups are O(address bit length) and allocation-free. A `0.0.0.0/0` or
//! `::/0` entry sits at the root of its family's sub-trie and therefore
//! matches every address of that family.
//!
//! # Example
//!
//! ```
//! use conn_dispatch::net::cidr::CidrTrie;
//! use std::net::IpAddr;
//!
//! let trie = CidrTrie::build(vec![
//!     ("10.0.0.0/8".parse().unwrap(), "wide"),
//!     ("10.1.2.0/24".parse().unwrap(), "narrow"),
//! ]);
//!
//! let ip: IpAddr = "10.1.2.5".parse().unwrap();
//! assert_eq!(trie.lookup(ip), Some(&"narrow"));
//!
//! let ip: IpAddr = "10.2.0.1".parse().unwrap();
//! assert_eq!(trie.lookup(ip), Some(&"wide"));
//!
//! let ip: IpAddr = "192.168.0.1".parse().unwrap();
//! assert_eq!(trie.lookup(ip), None);
//! ```

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::FilterChainError;

/// Parse a CIDR string, accepting a bare address as a full-length prefix
///
/// # Errors
///
/// Returns [`FilterChainError::InvalidCidr`] if the string is neither a
/// CIDR range nor a plain IP address.
pub fn parse_cidr(s: &str) -> Result<IpNet, FilterChainError> {
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok(net);
    }
    s.parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| FilterChainError::invalid_cidr(s))
}

const NO_NODE: u32 = u32::MAX;

/// One branch node of a family sub-trie
///
/// Child slots index into the arena; `NO_NODE` marks an absent child.
struct Node<V> {
    children: [u32; 2],
    value: Option<V>,
}

impl<V> Node<V> {
    const fn new() -> Self {
        Self {
            children: [NO_NODE, NO_NODE],
            value: None,
        }
    }
}

/// Bit-wise prefix trie for one address family
struct FamilyTrie<V> {
    nodes: Vec<Node<V>>,
}

impl<V> FamilyTrie<V> {
    fn new() -> Self {
        Self {
            nodes: vec![Node::new()],
        }
    }

    /// Insert a value at the node for `prefix_len` leading bits of `bits`.
    ///
    /// `bits` are the address bits left-aligned in a u128. Re-inserting the
    /// same prefix overwrites the previous value (last write wins).
    fn insert(&mut self, bits: u128, prefix_len: u8, value: V) {
        let mut idx = 0usize;
        for i in 0..prefix_len {
            let bit = ((bits >> (127 - i)) & 1) as usize;
            if self.nodes[idx].children[bit] == NO_NODE {
                self.nodes.push(Node::new());
                let new_idx = (self.nodes.len() - 1) as u32;
                self.nodes[idx].children[bit] = new_idx;
            }
            idx = self.nodes[idx].children[bit] as usize;
        }
        self.nodes[idx].value = Some(value);
    }

    /// Walk the address bits, remembering the deepest value seen.
    fn lookup(&self, bits: u128, addr_len: u8) -> Option<&V> {
        let mut idx = 0usize;
        let mut best = self.nodes[0].value.as_ref();
        for i in 0..addr_len {
            let bit = ((bits >> (127 - i)) & 1) as usize;
            let child = self.nodes[idx].children[bit];
            if child == NO_NODE {
                break;
            }
            idx = child as usize;
            if let Some(v) = self.nodes[idx].value.as_ref() {
                best = Some(v);
            }
        }
        best
    }

    fn is_empty(&self) -> bool {
        self.nodes.len() == 1 && self.nodes[0].value.is_none()
    }
}

/// Immutable longest-prefix-match trie over CIDR ranges
///
/// Built once on the control plane; IPv4 and IPv6 entries live in separate
/// sub-tries so prefix lengths never mix families.
pub struct CidrTrie<V> {
    v4: FamilyTrie<V>,
    v6: FamilyTrie<V>,
    len: usize,
}

impl<V> CidrTrie<V> {
    /// Build a trie from `(CIDR, value)` entries
    ///
    /// Entries with identical CIDRs resolve last-write-wins, which keeps
    /// rebuilds of the same configuration stable.
    #[must_use]
    pub fn build(entries: impl IntoIterator<Item = (IpNet, V)>) -> Self {
        let mut v4 = FamilyTrie::new();
        let mut v6 = FamilyTrie::new();
        let mut len = 0;
        for (net, value) in entries {
            match net {
                IpNet::V4(n) => {
                    let bits = u128::from(u32::from(n.network())) << 96;
                    v4.insert(bits, n.prefix_len(), value);
                }
                IpNet::V6(n) => {
                    v6.insert(u128::from(n.network()), n.prefix_len(), value);
                }
            }
            len += 1;
        }
        Self { v4, v6, len }
    }

    /// Create an empty trie; every lookup returns `None`
    #[must_use]
    pub fn empty() -> Self {
        Self::build(std::iter::empty())
    }

    /// Return the value of the longest prefix covering `addr`, if any
    #[must_use]
    pub fn lookup(&self, addr: IpAddr) -> Option<&V> {
        match addr {
            IpAddr::V4(a) => {
                let bits = u128::from(u32::from(a)) << 96;
                self.v4.lookup(bits, 32)
            }
            IpAddr::V6(a) => self.v6.lookup(u128::from(a), 128),
        }
    }

    /// Number of entries inserted at build time
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no entry was inserted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

impl<V> std::fmt::Debug for CidrTrie<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CidrTrie").field("entries", &self.len).finish()
    }
}
