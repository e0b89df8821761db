//! Explicit decision-tree filter-chain selection
//!
//! When the configuration supplies a match tree, per-connection lookup
//! bypasses the nested index entirely: the tree is evaluated against the
//! connection and yields a filter-chain *name*, which resolves through the
//! manager's name-indexed chain map. A tree that yields no name falls back
//! to the default chain.
//!
//! Trees are tagged enum-of-dict layers: every node names the connection
//! input it switches on, an exact-value map to the next layer, and an
//! optional `on_no_match` edge.
//!
//! # Example
//!
//! ```
//! use conn_dispatch::filter_chain::match_tree::{MatchAction, MatchTreeConfig};
//!
//! let tree: MatchTreeConfig = serde_json::from_str(
//!     r#"{
//!         "input": "server_name",
//!         "exact": {
//!             "admin.example.com": "admin",
//!             "www.example.com": { "input": "transport_protocol",
//!                                  "exact": { "tls": "www-tls" } }
//!         }
//!     }"#,
//! )
//! .unwrap();
//! assert_eq!(tree.exact.len(), 2);
//! assert!(matches!(tree.exact["admin.example.com"], MatchAction::Chain(_)));
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::FilterChainError;
use crate::net::socket::ConnectionSocket;

/// Connection input a tree node switches on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchInput {
    /// Destination (listener) port, compared as a decimal string
    DestinationPort,
    /// Requested server name (TLS SNI), lowercased
    ServerName,
    /// Detected transport protocol
    TransportProtocol,
    /// Offered ALPN protocols, tried in offer order
    ApplicationProtocol,
    /// Source classification, `"local"` or `"external"`
    SourceType,
}

/// Edge out of a tree node: either a terminal chain name or a subtree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatchAction {
    /// Terminal: the name of the filter chain to select
    Chain(String),
    /// Continue matching in a nested tree
    Subtree(Box<MatchTreeConfig>),
}

/// One node of the decision tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchTreeConfig {
    /// Input this node switches on
    pub input: MatchInput,

    /// Exact-value edges
    #[serde(default)]
    pub exact: BTreeMap<String, MatchAction>,

    /// Edge taken when no exact value matches
    #[serde(default)]
    pub on_no_match: Option<Box<MatchAction>>,
}

impl MatchTreeConfig {
    /// Verify that every terminal action names a registered chain
    ///
    /// # Errors
    ///
    /// Returns [`FilterChainError::UnknownChainName`] for a dangling name.
    pub fn validate_names(
        &self,
        is_known: &impl Fn(&str) -> bool,
    ) -> Result<(), FilterChainError> {
        for action in self.exact.values().chain(self.on_no_match.as_deref()) {
            match action {
                MatchAction::Chain(name) => {
                    if !is_known(name) {
                        return Err(FilterChainError::UnknownChainName(name.clone()));
                    }
                }
                MatchAction::Subtree(sub) => sub.validate_names(is_known)?,
            }
        }
        Ok(())
    }

    /// Evaluate the tree against a connection; yields a chain name or nothing
    #[must_use]
    pub fn evaluate(&self, socket: &ConnectionSocket) -> Option<&str> {
        let action = match self.input {
            MatchInput::DestinationPort => {
                self.edge_for(&socket.destination_port().to_string())
            }
            MatchInput::ServerName => {
                self.edge_for(&socket.requested_server_name().to_ascii_lowercase())
            }
            MatchInput::TransportProtocol => self.edge_for(socket.detected_transport_protocol()),
            MatchInput::ApplicationProtocol => socket
                .requested_application_protocols()
                .iter()
                .find_map(|p| self.exact.get(p.as_str()))
                .or(self.on_no_match.as_deref()),
            MatchInput::SourceType => self.edge_for(&socket.source_type().to_string()),
        }?;
        match action {
            MatchAction::Chain(name) => Some(name),
            MatchAction::Subtree(sub) => sub.evaluate(socket),
        }
    }

    fn edge_for(&self, value: &str) -> Option<&MatchAction> {
        self.exact.get(value).or(self.on_no_match.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> MatchTreeConfig {
        serde_json::from_str(
            r#"{
                "input": "destination_port",
                "exact": {
                    "443": {
                        "input": "server_name",
                        "exact": { "foo.example.com": "foo" },
                        "on_no_match": "tls-default"
                    }
                },
                "on_no_match": "plain"
            }"#,
        )
        .unwrap()
    }

    fn socket(dest: &str) -> ConnectionSocket {
        ConnectionSocket::new(dest.parse().unwrap(), "203.0.113.9:40000".parse().unwrap())
    }

    #[test]
    fn test_nested_evaluation() {
        let tree = tree();
        let s = socket("10.0.0.1:443").with_server_name("foo.example.com");
        assert_eq!(tree.evaluate(&s), Some("foo"));
        let s = socket("10.0.0.1:443").with_server_name("bar.example.com");
        assert_eq!(tree.evaluate(&s), Some("tls-default"));
        let s = socket("10.0.0.1:80");
        assert_eq!(tree.evaluate(&s), Some("plain"));
    }

    #[test]
    fn test_no_match_without_fallback_yields_none() {
        let tree: MatchTreeConfig = serde_json::from_str(
            r#"{ "input": "server_name", "exact": { "a.example.com": "a" } }"#,
        )
        .unwrap();
        let s = socket("10.0.0.1:443").with_server_name("b.example.com");
        assert_eq!(tree.evaluate(&s), None);
    }

    #[test]
    fn test_application_protocol_offer_order() {
        let tree: MatchTreeConfig = serde_json::from_str(
            r#"{ "input": "application_protocol",
                 "exact": { "h2": "http2", "http/1.1": "http1" } }"#,
        )
        .unwrap();
        let s = socket("10.0.0.1:443")
            .with_application_protocols(vec!["http/1.1".into(), "h2".into()]);
        assert_eq!(tree.evaluate(&s), Some("http1"));
    }

    #[test]
    fn test_validate_names_flags_dangling_reference() {
        let tree = tree();
        let known = |name: &str| name == "foo" || name == "plain";
        let err = tree.validate_names(&known).unwrap_err();
        assert!(matches!(err, FilterChainError::UnknownChainName(n) if n == "tls-default"));

        let known = |name: &str| matches!(name, "foo" | "plain" | "tls-default");
        assert!(tree.validate_names(&known).is_ok());
    }
}
