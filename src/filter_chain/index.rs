//! Nested filter-chain index: construction and per-connection lookup
//!
//! The index is a nested dictionary / longest-prefix hybrid. Dimensions are
//! tested in a fixed order: destination port, destination IP, server name,
//! transport protocol, application protocol, direct source IP, source type,
//! source IP, source port. Each level maps its key to the next level; an
//! unspecified dimension is stored under a sentinel key (`""` for strings,
//! `0` for ports). The "any" bucket of an IP dimension becomes `0.0.0.0/0`
//! plus `::/0` in that level's trie, so longest-prefix matching makes
//! specific ranges win over the catch-all for free.
//!
//! Construction runs on the control plane in two passes: plain nested-map
//! insertion, then a freeze that turns every CIDR-keyed map into an
//! immutable LPM trie. Lookup never mutates and never allocates beyond the
//! lowercased server name.
//!
//! Lookup commits to the first key that matches at each level: if a more
//! specific key exists but its subtree has no chain for the connection, the
//! less specific key of the same level is not revisited. Two levels are the
//! exception and retry on a miss: destination port falls back to the
//! catch-all port bucket, and source type falls back from the socket's
//! class to `ANY`.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::FilterChainError;
use crate::net::cidr::{parse_cidr, CidrTrie};
use crate::net::socket::{ConnectionSocket, SourceType};

use super::chain::FilterChain;
use super::config::{canonicalize_server_name, FilterChainMatch};

// Build-side nested maps, keyed by the raw (normalized) configuration
// values. Frozen into the lookup structure once all chains are inserted.
type SourcePortsBuild = HashMap<u16, Arc<FilterChain>>;
type SourceIpsBuild = HashMap<String, SourcePortsBuild>;
type SourceTypesBuild = [SourceIpsBuild; SourceType::COUNT];
type DirectSourceIpsBuild = HashMap<String, SourceTypesBuild>;
type ApplicationProtocolsBuild = HashMap<String, DirectSourceIpsBuild>;
type TransportProtocolsBuild = HashMap<String, ApplicationProtocolsBuild>;
type ServerNamesBuild = HashMap<String, TransportProtocolsBuild>;
type DestinationIpsBuild = HashMap<String, ServerNamesBuild>;
type DestinationPortsBuild = HashMap<u16, DestinationIpsBuild>;

/// Incrementally populated index; [`ChainIndexBuilder::freeze`] produces the
/// immutable lookup structure
#[derive(Default)]
pub(crate) struct ChainIndexBuilder {
    destination_ports: DestinationPortsBuild,
}

/// `values`, or the sentinel "any" key when the dimension is unspecified
fn keys_or_any(values: &[String]) -> Vec<String> {
    if values.is_empty() {
        vec![String::new()]
    } else {
        values.to_vec()
    }
}

/// Normalized CIDR keys (or the "any" key), so `10.0.0.1` and
/// `10.0.0.1/32` land in the same entry
fn cidr_keys_or_any(values: &[String]) -> Result<Vec<String>, FilterChainError> {
    if values.is_empty() {
        return Ok(vec![String::new()]);
    }
    values
        .iter()
        .map(|v| parse_cidr(v).map(|net| net.to_string()))
        .collect()
}

impl ChainIndexBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert one chain under every key combination its predicate spans
    ///
    /// # Errors
    ///
    /// Returns [`FilterChainError::DuplicateMatcher`] when another chain
    /// already occupies the exact same path, and
    /// [`FilterChainError::InvalidCidr`] for unparseable ranges.
    pub(crate) fn add_chain(
        &mut self,
        chain_match: &FilterChainMatch,
        chain: &Arc<FilterChain>,
    ) -> Result<(), FilterChainError> {
        let port = chain_match.destination_port.unwrap_or(0);
        let node = self.destination_ports.entry(port).or_default();
        add_for_destination_ips(node, chain_match, chain)
    }

    /// Materialize the per-level tries and produce the immutable index
    pub(crate) fn freeze(self) -> Result<ChainIndex, FilterChainError> {
        let mut destination_ports = HashMap::with_capacity(self.destination_ports.len());
        for (port, ips) in self.destination_ports {
            destination_ports.insert(port, freeze_destination_ips(ips)?);
        }
        Ok(ChainIndex { destination_ports })
    }
}

fn add_for_destination_ips(
    node: &mut DestinationIpsBuild,
    chain_match: &FilterChainMatch,
    chain: &Arc<FilterChain>,
) -> Result<(), FilterChainError> {
    for cidr in cidr_keys_or_any(&chain_match.destination_ranges)? {
        add_for_server_names(node.entry(cidr).or_default(), chain_match, chain)?;
    }
    Ok(())
}

fn add_for_server_names(
    node: &mut ServerNamesBuild,
    chain_match: &FilterChainMatch,
    chain: &Arc<FilterChain>,
) -> Result<(), FilterChainError> {
    for name in keys_or_any(&chain_match.server_names) {
        let key = canonicalize_server_name(&name);
        add_for_transport_protocols(node.entry(key).or_default(), chain_match, chain)?;
    }
    Ok(())
}

fn add_for_transport_protocols(
    node: &mut TransportProtocolsBuild,
    chain_match: &FilterChainMatch,
    chain: &Arc<FilterChain>,
) -> Result<(), FilterChainError> {
    let key = chain_match.transport_protocol.clone();
    add_for_application_protocols(node.entry(key).or_default(), chain_match, chain)
}

fn add_for_application_protocols(
    node: &mut ApplicationProtocolsBuild,
    chain_match: &FilterChainMatch,
    chain: &Arc<FilterChain>,
) -> Result<(), FilterChainError> {
    for protocol in keys_or_any(&chain_match.application_protocols) {
        add_for_direct_source_ips(node.entry(protocol).or_default(), chain_match, chain)?;
    }
    Ok(())
}

fn add_for_direct_source_ips(
    node: &mut DirectSourceIpsBuild,
    chain_match: &FilterChainMatch,
    chain: &Arc<FilterChain>,
) -> Result<(), FilterChainError> {
    for cidr in cidr_keys_or_any(&chain_match.direct_source_ranges)? {
        let slot = node.entry(cidr).or_default();
        add_for_source_ips(
            &mut slot[chain_match.source_type.index()],
            chain_match,
            chain,
        )?;
    }
    Ok(())
}

fn add_for_source_ips(
    node: &mut SourceIpsBuild,
    chain_match: &FilterChainMatch,
    chain: &Arc<FilterChain>,
) -> Result<(), FilterChainError> {
    for cidr in cidr_keys_or_any(&chain_match.source_ranges)? {
        add_for_source_ports(node.entry(cidr).or_default(), chain_match, chain)?;
    }
    Ok(())
}

fn add_for_source_ports(
    node: &mut SourcePortsBuild,
    chain_match: &FilterChainMatch,
    chain: &Arc<FilterChain>,
) -> Result<(), FilterChainError> {
    let ports: Vec<u16> = if chain_match.source_ports.is_empty() {
        vec![0]
    } else {
        chain_match.source_ports.clone()
    };
    for port in ports {
        if let Some(existing) = node.get(&port) {
            return Err(FilterChainError::duplicate(existing.name(), chain.name()));
        }
        node.insert(port, Arc::clone(chain));
    }
    Ok(())
}

// Immutable lookup structure. IP levels carry both the exact-key map (kept
// from construction) and the frozen trie that lookup walks.

pub(crate) struct SourcePortsLevel {
    map: HashMap<u16, Arc<FilterChain>>,
}

pub(crate) struct SourceIpsLevel {
    #[allow(dead_code)]
    map: HashMap<String, Arc<SourcePortsLevel>>,
    trie: CidrTrie<Arc<SourcePortsLevel>>,
}

pub(crate) struct SourceTypesLevel {
    slots: [SourceIpsLevel; SourceType::COUNT],
}

pub(crate) struct DirectSourceIpsLevel {
    #[allow(dead_code)]
    map: HashMap<String, Arc<SourceTypesLevel>>,
    trie: CidrTrie<Arc<SourceTypesLevel>>,
}

pub(crate) struct ApplicationProtocolsLevel {
    map: HashMap<String, DirectSourceIpsLevel>,
}

pub(crate) struct TransportProtocolsLevel {
    map: HashMap<String, ApplicationProtocolsLevel>,
}

pub(crate) struct ServerNamesLevel {
    map: HashMap<String, TransportProtocolsLevel>,
}

pub(crate) struct DestinationIpsLevel {
    #[allow(dead_code)]
    map: HashMap<String, Arc<ServerNamesLevel>>,
    trie: CidrTrie<Arc<ServerNamesLevel>>,
}

/// Immutable multi-dimensional filter-chain index
pub struct ChainIndex {
    destination_ports: HashMap<u16, DestinationIpsLevel>,
}

/// Freeze a CIDR-keyed map into (map of shared levels, LPM trie). The ""
/// key becomes the v4 and v6 default routes pointing at the same level.
fn freeze_ip_map<N>(
    build: HashMap<String, N>,
    freeze_next: impl Fn(N) -> Result<Arc<N2Of<N>>, FilterChainError>,
) -> Result<(HashMap<String, Arc<N2Of<N>>>, CidrTrie<Arc<N2Of<N>>>), FilterChainError>
where
    N: FreezeTarget,
{
    let mut map = HashMap::with_capacity(build.len());
    let mut entries = Vec::new();
    for (key, next) in build {
        let frozen = freeze_next(next)?;
        if key.is_empty() {
            entries.push(("0.0.0.0/0".parse().unwrap(), Arc::clone(&frozen)));
            entries.push(("::/0".parse().unwrap(), Arc::clone(&frozen)));
        } else {
            entries.push((parse_cidr(&key)?, Arc::clone(&frozen)));
        }
        map.insert(key, frozen);
    }
    Ok((map, CidrTrie::build(entries)))
}

/// Associates a build-side node with its frozen form, so [`freeze_ip_map`]
/// can be shared by the three IP dimensions.
pub(crate) trait FreezeTarget {
    type Frozen;
}

type N2Of<N> = <N as FreezeTarget>::Frozen;

impl FreezeTarget for ServerNamesBuild {
    type Frozen = ServerNamesLevel;
}

impl FreezeTarget for SourceTypesBuild {
    type Frozen = SourceTypesLevel;
}

impl FreezeTarget for SourcePortsBuild {
    type Frozen = SourcePortsLevel;
}

fn freeze_destination_ips(
    build: DestinationIpsBuild,
) -> Result<DestinationIpsLevel, FilterChainError> {
    let (map, trie) = freeze_ip_map(build, |server_names| {
        let mut map = HashMap::with_capacity(server_names.len());
        for (name, transports) in server_names {
            map.insert(name, freeze_transport_protocols(transports)?);
        }
        Ok(Arc::new(ServerNamesLevel { map }))
    })?;
    Ok(DestinationIpsLevel { map, trie })
}

fn freeze_transport_protocols(
    build: TransportProtocolsBuild,
) -> Result<TransportProtocolsLevel, FilterChainError> {
    let mut map = HashMap::with_capacity(build.len());
    for (protocol, app_protocols) in build {
        let mut app_map = HashMap::with_capacity(app_protocols.len());
        for (app, direct_sources) in app_protocols {
            app_map.insert(app, freeze_direct_source_ips(direct_sources)?);
        }
        map.insert(protocol, ApplicationProtocolsLevel { map: app_map });
    }
    Ok(TransportProtocolsLevel { map })
}

fn freeze_direct_source_ips(
    build: DirectSourceIpsBuild,
) -> Result<DirectSourceIpsLevel, FilterChainError> {
    let (map, trie) = freeze_ip_map(build, |source_types| {
        let [any, local, external] = source_types;
        Ok(Arc::new(SourceTypesLevel {
            slots: [
                freeze_source_ips(any)?,
                freeze_source_ips(local)?,
                freeze_source_ips(external)?,
            ],
        }))
    })?;
    Ok(DirectSourceIpsLevel { map, trie })
}

fn freeze_source_ips(build: SourceIpsBuild) -> Result<SourceIpsLevel, FilterChainError> {
    let (map, trie) = freeze_ip_map(build, |ports| Ok(Arc::new(SourcePortsLevel { map: ports })))?;
    Ok(SourceIpsLevel { map, trie })
}

impl ChainIndex {
    /// Select the filter chain for an accepted connection, if any
    ///
    /// The destination-port level, like the source-type level, retries on a
    /// miss: when the exact-port subtree yields nothing the catch-all port
    /// bucket is consulted before giving up.
    #[must_use]
    pub fn find(&self, socket: &ConnectionSocket) -> Option<&Arc<FilterChain>> {
        if let Some(level) = self.destination_ports.get(&socket.destination_port()) {
            if let Some(chain) = Self::find_for_destination_ip(level, socket) {
                return Some(chain);
            }
        }
        let catch_all = self.destination_ports.get(&0)?;
        Self::find_for_destination_ip(catch_all, socket)
    }

    fn find_for_destination_ip<'a>(
        level: &'a DestinationIpsLevel,
        socket: &ConnectionSocket,
    ) -> Option<&'a Arc<FilterChain>> {
        let server_names = level.trie.lookup(socket.destination_ip())?;
        Self::find_for_server_name(server_names, socket)
    }

    fn find_for_server_name<'a>(
        level: &'a ServerNamesLevel,
        socket: &ConnectionSocket,
    ) -> Option<&'a Arc<FilterChain>> {
        let raw = socket.requested_server_name();
        let server_name: Cow<'_, str> = if raw.bytes().any(|b| b.is_ascii_uppercase()) {
            Cow::Owned(raw.to_ascii_lowercase())
        } else {
            Cow::Borrowed(raw)
        };

        // Exact name, i.e. "www.example.com" for "www.example.com".
        if let Some(next) = level.map.get(server_name.as_ref()) {
            return Self::find_for_transport_protocol(next, socket);
        }

        // Wildcard names, longest first: ".example.com" before ".com" for
        // "www.example.com". Keys carry the leading dot.
        let name = server_name.as_ref();
        let mut pos = name[1.min(name.len())..].find('.').map(|p| p + 1);
        while let Some(p) = pos {
            if p + 1 >= name.len() {
                break;
            }
            if let Some(next) = level.map.get(&name[p..]) {
                return Self::find_for_transport_protocol(next, socket);
            }
            pos = name[p + 1..].find('.').map(|q| q + p + 1);
        }

        // Chains without server-name requirements.
        let next = level.map.get("")?;
        Self::find_for_transport_protocol(next, socket)
    }

    fn find_for_transport_protocol<'a>(
        level: &'a TransportProtocolsLevel,
        socket: &ConnectionSocket,
    ) -> Option<&'a Arc<FilterChain>> {
        let next = level
            .map
            .get(socket.detected_transport_protocol())
            .or_else(|| level.map.get(""))?;
        Self::find_for_application_protocol(next, socket)
    }

    fn find_for_application_protocol<'a>(
        level: &'a ApplicationProtocolsLevel,
        socket: &ConnectionSocket,
    ) -> Option<&'a Arc<FilterChain>> {
        for protocol in socket.requested_application_protocols() {
            if let Some(next) = level.map.get(protocol.as_str()) {
                return Self::find_for_direct_source_ip(next, socket);
            }
        }
        let next = level.map.get("")?;
        Self::find_for_direct_source_ip(next, socket)
    }

    fn find_for_direct_source_ip<'a>(
        level: &'a DirectSourceIpsLevel,
        socket: &ConnectionSocket,
    ) -> Option<&'a Arc<FilterChain>> {
        let source_types = level.trie.lookup(socket.direct_remote_ip())?;
        Self::find_for_source_type(source_types, socket)
    }

    fn find_for_source_type<'a>(
        level: &'a SourceTypesLevel,
        socket: &ConnectionSocket,
    ) -> Option<&'a Arc<FilterChain>> {
        // The socket's own class first, then the ANY slot. This is the one
        // level that retries on a miss deeper down.
        let classed = &level.slots[socket.source_type().index()];
        if let Some(chain) = Self::find_for_source_ip(classed, socket) {
            return Some(chain);
        }
        Self::find_for_source_ip(&level.slots[SourceType::Any.index()], socket)
    }

    fn find_for_source_ip<'a>(
        level: &'a SourceIpsLevel,
        socket: &ConnectionSocket,
    ) -> Option<&'a Arc<FilterChain>> {
        let ports = level.trie.lookup(socket.remote_ip())?;
        ports
            .map
            .get(&socket.remote_port())
            .or_else(|| ports.map.get(&0))
    }
}

impl std::fmt::Debug for ChainIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainIndex")
            .field("destination_ports", &self.destination_ports.len())
            .finish()
    }
}
