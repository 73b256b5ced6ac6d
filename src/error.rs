//! Error types for the tiered cache engine

use thiserror::Error;

use crate::tenant::Tenant;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Tenant / Identity Errors
    // =========================================================================
    /// Caller does not own the cache or manager and is not the super-tenant
    #[error("Access denied: tenant {caller} cannot access {resource} owned by {owner}")]
    AccessDenied {
        caller: Tenant,
        owner: Tenant,
        resource: String,
    },

    /// No tenant identity available for the calling context
    #[error("No tenant context available for the current caller")]
    NoTenantContext,

    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// A cache with the same name is already registered on the manager
    #[error("Cache {cache} already exists in manager {manager}")]
    AlreadyExists { manager: String, cache: String },

    /// Declared key/value types disagree with the caller's expectation
    #[error("Cache {cache} is declared as <{declared}> but was requested as <{requested}>")]
    TypeMismatch {
        cache: String,
        declared: String,
        requested: String,
    },

    /// Operation attempted on a closed cache or manager
    #[error("Cache {0} is closed")]
    CacheClosed(String),

    // =========================================================================
    // Tier Errors
    // =========================================================================
    /// Distributed tier unreachable or failed
    #[error("Distributed tier unavailable for {namespace}: {reason}")]
    DistributedUnavailable { namespace: String, reason: String },

    /// Failed to encode or decode an entry for the distributed tier
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Externally supplied loader hook failed
    #[error("Cache loader failed for cache {cache}: {source}")]
    LoaderFailure {
        cache: String,
        #[source]
        source: anyhow::Error,
    },

    // =========================================================================
    // Configuration / Runtime Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for failures of the distributed tier, which callers may retry
    /// or treat as a local-only miss.
    pub fn is_distributed(&self) -> bool {
        matches!(self, Error::DistributedUnavailable { .. })
    }
}
