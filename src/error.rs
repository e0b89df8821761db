//! Error types for conn-dispatch
//!
//! All errors are returned synchronously from builders on the control plane.
//! Data-plane lookups (`find_filter_chain`, `choose_host`) never fail; they
//! return `None` instead. When a build fails, the previously published
//! snapshot remains active.

use thiserror::Error;

/// Top-level error type for conn-dispatch
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Filter-chain index construction errors
    #[error("Filter chain error: {0}")]
    FilterChain(#[from] FilterChainError),

    /// Load balancer snapshot construction errors
    #[error("Balancer error: {0}")]
    Balancer(#[from] BalancerError),
}

impl DispatchError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::FilterChain(e) => e.is_recoverable(),
            Self::Balancer(e) => e.is_recoverable(),
        }
    }
}

/// Filter-chain index construction errors
#[derive(Debug, Error)]
pub enum FilterChainError {
    /// Two filter chains share the same match predicate
    #[error("filter chains '{first}' and '{second}' have the same matching rules")]
    DuplicateMatcher {
        /// Name of the previously registered chain
        first: String,
        /// Name of the chain that collided with it
        second: String,
    },

    /// Malformed CIDR string
    #[error("invalid CIDR range: {0}")]
    InvalidCidr(String),

    /// Malformed or overly broad wildcard server name
    #[error("invalid server name wildcard: {0}")]
    InvalidWildcard(String),

    /// Source-type and source-IP constraints are mutually exclusive
    #[error("filter chain '{chain}' specifies source type {source_type} together with source IPs")]
    ConflictingSourceType {
        /// Offending chain
        chain: String,
        /// The non-ANY source type that was combined with source IPs
        source_type: String,
    },

    /// Matcher-tree mode requires every chain to carry a unique name
    #[error("filter chain must have a non-empty name when a match tree is configured")]
    ChainNameRequired,

    /// Two named filter chains share a name
    #[error("duplicate filter chain name: {0}")]
    DuplicateChainName(String),

    /// The match tree references a chain name that was never registered
    #[error("match tree references unknown filter chain: {0}")]
    UnknownChainName(String),
}

impl FilterChainError {
    /// Build errors need a corrected configuration; nothing to retry
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a duplicate matcher error naming both chains
    pub fn duplicate(first: impl Into<String>, second: impl Into<String>) -> Self {
        Self::DuplicateMatcher {
            first: first.into(),
            second: second.into(),
        }
    }

    /// Create an invalid CIDR error
    pub fn invalid_cidr(cidr: impl Into<String>) -> Self {
        Self::InvalidCidr(cidr.into())
    }
}

/// Load balancer snapshot construction errors
#[derive(Debug, Error)]
pub enum BalancerError {
    /// Host or locality weight sum exceeds `u32::MAX`
    #[error("the sum of weights of all {scope} exceeds {max}", max = u32::MAX)]
    WeightOverflow {
        /// "upstream hosts in a locality" or "localities at the same priority"
        scope: &'static str,
    },

    /// Locality weight vector length differs from hosts-per-locality
    #[error("locality weights ({weights}) do not match localities ({localities})")]
    MismatchedLocalityWeights {
        /// Number of locality weight entries
        weights: usize,
        /// Number of locality host groups
        localities: usize,
    },

    /// Ring-hash ring size bounds are inconsistent
    #[error("minimum ring size {minimum} is greater than maximum ring size {maximum}")]
    InvalidRingSize {
        /// Configured minimum
        minimum: u64,
        /// Configured maximum
        maximum: u64,
    },

    /// Maglev table size must be prime
    #[error("maglev table size {0} is not prime")]
    InvalidTableSize(u64),
}

impl BalancerError {
    /// Snapshot build errors leave the previous snapshot active; weight
    /// overflows can clear on the next topology update
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::WeightOverflow { .. })
    }

    /// Create a host weight overflow error
    #[must_use]
    pub const fn host_weight_overflow() -> Self {
        Self::WeightOverflow {
            scope: "upstream hosts in a locality",
        }
    }

    /// Create a locality weight overflow error
    #[must_use]
    pub const fn locality_weight_overflow() -> Self {
        Self::WeightOverflow {
            scope: "localities at the same priority",
        }
    }
}

/// Type alias for Result with DispatchError
pub type Result<T> = std::result::Result<T, DispatchError>;
