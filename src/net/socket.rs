//! Connection metadata consumed by filter-chain lookup
//!
//! A [`ConnectionSocket`] is a read-only snapshot of what is known about an
//! accepted downstream connection at dispatch time: the 5-tuple, the SNI
//! from the TLS `ClientHello`, the detected transport protocol, and the ALPN
//! protocols the client offered, in offer order.
//!
//! # Example
//!
//! ```
//! use conn_dispatch::net::socket::{ConnectionSocket, SourceType};
//!
//! let socket = ConnectionSocket::new(
//!     "10.0.0.1:443".parse().unwrap(),
//!     "203.0.113.7:49152".parse().unwrap(),
//! )
//! .with_server_name("www.example.com")
//! .with_transport_protocol("tls")
//! .with_application_protocols(vec!["h2".into(), "http/1.1".into()]);
//!
//! assert_eq!(socket.destination_port(), 443);
//! assert_eq!(socket.requested_server_name(), "www.example.com");
//! assert_eq!(socket.source_type(), SourceType::External);
//! ```

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Connection source classification used by the source-type match dimension
///
/// `Local` matches only loopback/UDS peers (or peers sharing the listener's
/// address); `External` matches everything else; `Any` matches both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Match any connection source
    #[default]
    Any,
    /// Match only local (loopback or same-host) sources
    Local,
    /// Match only non-local sources
    External,
}

impl SourceType {
    /// Fixed slot of this source type in the per-type index array
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Any => 0,
            Self::Local => 1,
            Self::External => 2,
        }
    }

    /// Number of source-type slots
    pub const COUNT: usize = 3;
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::Local => write!(f, "local"),
            Self::External => write!(f, "external"),
        }
    }
}

/// Read-only view of an accepted downstream connection
#[derive(Debug, Clone)]
pub struct ConnectionSocket {
    destination: SocketAddr,
    remote: SocketAddr,
    direct_remote_ip: IpAddr,
    server_name: String,
    transport_protocol: String,
    application_protocols: Vec<String>,
    local_or_uds: bool,
}

impl ConnectionSocket {
    /// Create a socket view from the connection addresses
    ///
    /// `destination` is the local (listener-side) address of the connection;
    /// `remote` is the peer. The direct remote defaults to the peer and the
    /// source classification defaults to local when the peer is loopback or
    /// shares the destination address; both can be overridden.
    #[must_use]
    pub fn new(destination: SocketAddr, remote: SocketAddr) -> Self {
        let local_or_uds = remote.ip().is_loopback() || remote.ip() == destination.ip();
        Self {
            destination,
            remote,
            direct_remote_ip: remote.ip(),
            server_name: String::new(),
            transport_protocol: String::new(),
            application_protocols: Vec::new(),
            local_or_uds,
        }
    }

    /// Set the requested server name (TLS SNI)
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Set the detected transport protocol (e.g. `"tls"`, `"raw_buffer"`)
    #[must_use]
    pub fn with_transport_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.transport_protocol = protocol.into();
        self
    }

    /// Set the ALPN protocols the client offered, in offer order
    #[must_use]
    pub fn with_application_protocols(mut self, protocols: Vec<String>) -> Self {
        self.application_protocols = protocols;
        self
    }

    /// Set the direct remote IP (the immediate peer, before any proxy
    /// protocol restored the original source)
    #[must_use]
    pub const fn with_direct_remote_ip(mut self, ip: IpAddr) -> Self {
        self.direct_remote_ip = ip;
        self
    }

    /// Override the local/UDS classification
    #[must_use]
    pub const fn with_local_or_uds(mut self, local: bool) -> Self {
        self.local_or_uds = local;
        self
    }

    /// Destination (local) port of the connection
    #[must_use]
    pub const fn destination_port(&self) -> u16 {
        self.destination.port()
    }

    /// Destination (local) IP of the connection
    #[must_use]
    pub const fn destination_ip(&self) -> IpAddr {
        self.destination.ip()
    }

    /// Requested server name, empty when the client sent no SNI
    #[must_use]
    pub fn requested_server_name(&self) -> &str {
        &self.server_name
    }

    /// Detected transport protocol, empty when none was detected
    #[must_use]
    pub fn detected_transport_protocol(&self) -> &str {
        &self.transport_protocol
    }

    /// ALPN protocols offered by the client, in offer order
    #[must_use]
    pub fn requested_application_protocols(&self) -> &[String] {
        &self.application_protocols
    }

    /// Immediate peer IP
    #[must_use]
    pub const fn direct_remote_ip(&self) -> IpAddr {
        self.direct_remote_ip
    }

    /// Logical source IP (after proxy-protocol restoration, if any)
    #[must_use]
    pub const fn remote_ip(&self) -> IpAddr {
        self.remote.ip()
    }

    /// Logical source port
    #[must_use]
    pub const fn remote_port(&self) -> u16 {
        self.remote.port()
    }

    /// Whether the peer is local (loopback or UDS)
    #[must_use]
    pub const fn local_or_uds(&self) -> bool {
        self.local_or_uds
    }

    /// Source classification of this connection: never `Any`
    #[must_use]
    pub const fn source_type(&self) -> SourceType {
        if self.local_or_uds {
            SourceType::Local
        } else {
            SourceType::External
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_classified_local() {
        let socket = ConnectionSocket::new(
            "127.0.0.1:8443".parse().unwrap(),
            "127.0.0.1:55000".parse().unwrap(),
        );
        assert!(socket.local_or_uds());
        assert_eq!(socket.source_type(), SourceType::Local);
    }

    #[test]
    fn test_public_peer_classified_external() {
        let socket = ConnectionSocket::new(
            "10.0.0.1:443".parse().unwrap(),
            "203.0.113.7:49152".parse().unwrap(),
        );
        assert_eq!(socket.source_type(), SourceType::External);
        assert_eq!(socket.remote_port(), 49152);
        assert_eq!(socket.direct_remote_ip(), socket.remote_ip());
    }

    #[test]
    fn test_same_host_peer_classified_local() {
        let socket = ConnectionSocket::new(
            "10.0.0.1:443".parse().unwrap(),
            "10.0.0.1:39000".parse().unwrap(),
        );
        assert_eq!(socket.source_type(), SourceType::Local);
    }

    #[test]
    fn test_source_type_indices_are_distinct() {
        assert_eq!(SourceType::Any.index(), 0);
        assert_eq!(SourceType::Local.index(), 1);
        assert_eq!(SourceType::External.index(), 2);
    }

    #[test]
    fn test_default_accessors_empty() {
        let socket = ConnectionSocket::new(
            "10.0.0.1:443".parse().unwrap(),
            "203.0.113.7:49152".parse().unwrap(),
        );
        assert_eq!(socket.requested_server_name(), "");
        assert_eq!(socket.detected_transport_protocol(), "");
        assert!(socket.requested_application_protocols().is_empty());
    }
}
