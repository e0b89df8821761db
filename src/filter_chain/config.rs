//! Filter-chain configuration types
//!
//! Configuration is provided by the embedding server (typically parsed from
//! JSON) and handed to [`FilterChainManager`](crate::filter_chain::FilterChainManager)
//! for index construction. A [`FilterChainMatch`] is the conjunction of up to
//! nine optional dimensions; an absent dimension matches any connection.

use serde::{Deserialize, Serialize};

use crate::error::FilterChainError;
use crate::net::cidr::parse_cidr;
use crate::net::socket::SourceType;

use super::match_tree::MatchTreeConfig;

/// Match predicate selecting which connections a filter chain serves
///
/// All present dimensions must match (AND semantics). Two chains handed to
/// the same manager must not share a byte-identical predicate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterChainMatch {
    /// Destination port; absent or 0 matches any port
    #[serde(default)]
    pub destination_port: Option<u16>,

    /// Destination CIDR ranges; empty matches any destination
    #[serde(default)]
    pub destination_ranges: Vec<String>,

    /// Exact (`"foo.example.com"`) or leading-wildcard (`"*.example.com"`)
    /// server names; empty matches any SNI
    #[serde(default)]
    pub server_names: Vec<String>,

    /// Transport protocol (e.g. `"tls"`, `"raw_buffer"`); empty matches any
    #[serde(default)]
    pub transport_protocol: String,

    /// Application protocols (e.g. `"h2"`, `"http/1.1"`); empty matches any
    #[serde(default)]
    pub application_protocols: Vec<String>,

    /// Direct-source CIDR ranges; empty matches any immediate peer
    #[serde(default)]
    pub direct_source_ranges: Vec<String>,

    /// Connection source classification
    #[serde(default)]
    pub source_type: SourceType,

    /// Source CIDR ranges; empty matches any source address
    #[serde(default)]
    pub source_ranges: Vec<String>,

    /// Source ports; empty matches any source port
    #[serde(default)]
    pub source_ports: Vec<u16>,
}

impl FilterChainMatch {
    /// Validate the predicate in isolation
    ///
    /// Checks every CIDR string, every wildcard server name, and the
    /// source-type/source-IP exclusivity rule.
    ///
    /// # Errors
    ///
    /// Returns [`FilterChainError::InvalidCidr`],
    /// [`FilterChainError::InvalidWildcard`], or
    /// [`FilterChainError::ConflictingSourceType`].
    pub fn validate(&self, chain_name: &str) -> Result<(), FilterChainError> {
        for ranges in [
            &self.destination_ranges,
            &self.direct_source_ranges,
            &self.source_ranges,
        ] {
            for cidr in ranges {
                parse_cidr(cidr)?;
            }
        }
        for name in &self.server_names {
            validate_server_name(name)?;
        }
        if self.source_type != SourceType::Any && !self.source_ranges.is_empty() {
            return Err(FilterChainError::ConflictingSourceType {
                chain: chain_name.to_string(),
                source_type: self.source_type.to_string(),
            });
        }
        Ok(())
    }
}

/// Check a configured server name and reject malformed wildcards
///
/// Wildcards must be of the form `*.example.com`; a bare-TLD wildcard such
/// as `*.com` is rejected, as is a lone `*` or an inner wildcard.
///
/// # Errors
///
/// Returns [`FilterChainError::InvalidWildcard`].
pub fn validate_server_name(name: &str) -> Result<(), FilterChainError> {
    if let Some(rest) = name.strip_prefix("*.") {
        // "*.com" matches an entire TLD; require at least one more label.
        if rest.is_empty() || !rest.contains('.') || rest.starts_with('.') {
            return Err(FilterChainError::InvalidWildcard(name.to_string()));
        }
    } else if name.contains('*') {
        return Err(FilterChainError::InvalidWildcard(name.to_string()));
    }
    Ok(())
}

/// Canonical index key for a configured server name
///
/// `*.example.com` is stored as `.example.com`, sharing the map with exact
/// names; the leading dot is what distinguishes wildcard from exact entries.
#[must_use]
pub fn canonicalize_server_name(name: &str) -> String {
    name.strip_prefix('*').map_or_else(|| name.to_ascii_lowercase(), str::to_ascii_lowercase)
}

/// Whether a configured server name is a wildcard entry
#[must_use]
pub fn is_wildcard_server_name(name: &str) -> bool {
    name.starts_with("*.")
}

/// Transport-socket factory configuration carried by a filter chain
///
/// Opaque to the dispatch core; the embedding server interprets it when it
/// instantiates the transport socket for an accepted connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportSocketConfig {
    /// Factory name, e.g. `"raw_buffer"` or `"tls"`
    #[serde(default)]
    pub name: String,

    /// Factory-specific configuration
    #[serde(default)]
    pub typed_config: serde_json::Value,
}

/// One network filter factory entry in a chain's ordered pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkFilterConfig {
    /// Filter factory name
    pub name: String,

    /// Factory-specific configuration
    #[serde(default)]
    pub typed_config: serde_json::Value,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

/// Full configuration of one filter chain
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterChainConfig {
    /// Stable chain name; required (and unique) in match-tree mode
    #[serde(default)]
    pub name: String,

    /// Match predicate; the default predicate matches any connection
    #[serde(default)]
    pub filter_chain_match: FilterChainMatch,

    /// Transport-socket factory configuration
    #[serde(default)]
    pub transport_socket: TransportSocketConfig,

    /// Ordered network-filter factory list
    #[serde(default)]
    pub filters: Vec<NetworkFilterConfig>,

    /// Transport-socket connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub transport_socket_connect_timeout_ms: u64,

    /// Whether the chain was added through the management API rather than
    /// static configuration
    #[serde(default)]
    pub added_via_api: bool,
}

impl Default for NetworkFilterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            typed_config: serde_json::Value::Null,
        }
    }
}

/// Filter-chain configuration of one listener
///
/// This is the unit a reload consumes: the chains, the optional fallback
/// chain, and the optional match tree that replaces predicate lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListenerFilterChains {
    /// All filter chains of the listener
    #[serde(default)]
    pub filter_chains: Vec<FilterChainConfig>,

    /// Fallback chain used when nothing matches
    #[serde(default)]
    pub default_filter_chain: Option<FilterChainConfig>,

    /// Explicit decision tree; bypasses predicate lookup when present
    #[serde(default)]
    pub match_tree: Option<MatchTreeConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_validation() {
        assert!(validate_server_name("foo.example.com").is_ok());
        assert!(validate_server_name("*.example.com").is_ok());
        assert!(validate_server_name("*.com").is_err());
        assert!(validate_server_name("*").is_err());
        assert!(validate_server_name("foo.*.com").is_err());
        assert!(validate_server_name("*..example.com").is_err());
    }

    #[test]
    fn test_canonicalize_wildcard_to_leading_dot() {
        assert_eq!(canonicalize_server_name("*.example.com"), ".example.com");
        assert_eq!(canonicalize_server_name("Foo.Example.COM"), "foo.example.com");
    }

    #[test]
    fn test_conflicting_source_type_rejected() {
        let m = FilterChainMatch {
            source_type: SourceType::Local,
            source_ranges: vec!["10.0.0.0/8".into()],
            ..FilterChainMatch::default()
        };
        let err = m.validate("local-only").unwrap_err();
        assert!(matches!(err, FilterChainError::ConflictingSourceType { .. }));
    }

    #[test]
    fn test_invalid_cidr_rejected() {
        let m = FilterChainMatch {
            destination_ranges: vec!["10.0.0.0/40".into()],
            ..FilterChainMatch::default()
        };
        assert!(matches!(
            m.validate("bad"),
            Err(FilterChainError::InvalidCidr(_))
        ));
    }

    #[test]
    fn test_match_deserializes_with_defaults() {
        let m: FilterChainMatch = serde_json::from_str(r#"{"destination_port": 443}"#).unwrap();
        assert_eq!(m.destination_port, Some(443));
        assert!(m.server_names.is_empty());
        assert_eq!(m.source_type, SourceType::Any);
    }

    #[test]
    fn test_listener_config_deserializes_from_json() {
        let listener: ListenerFilterChains = serde_json::from_str(
            r#"{
                "filter_chains": [
                    {
                        "name": "https",
                        "filter_chain_match": {
                            "destination_port": 443,
                            "server_names": ["*.example.com"],
                            "transport_protocol": "tls"
                        },
                        "transport_socket": { "name": "tls" },
                        "filters": [ { "name": "tcp_proxy" } ]
                    }
                ],
                "default_filter_chain": { "name": "fallback" }
            }"#,
        )
        .unwrap();
        assert_eq!(listener.filter_chains.len(), 1);
        assert_eq!(listener.filter_chains[0].name, "https");
        assert_eq!(
            listener.filter_chains[0].transport_socket_connect_timeout_ms,
            10_000
        );
        assert_eq!(listener.default_filter_chain.as_ref().unwrap().name, "fallback");
        assert!(listener.match_tree.is_none());
    }

    #[test]
    fn test_identical_matches_compare_equal() {
        let a = FilterChainMatch {
            destination_port: Some(443),
            server_names: vec!["a.example.com".into()],
            ..FilterChainMatch::default()
        };
        let b = a.clone();
        assert_eq!(a, b);
    }
}
