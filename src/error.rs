//! Error types for the tollgate core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for tollgate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tollgate core
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// No entitlement, customer or grant was found
    #[error("not found: {0}")]
    NotFound(String),

    /// A grant set could not be merged into an entitlement
    #[error("grant resolution error: {0}")]
    GrantResolution(String),

    /// The resolver was handed an empty grant set
    #[error("no grants to merge")]
    NoGrants,

    /// Grants for different feature slugs were handed to the resolver
    #[error("feature mismatch: expected {expected}, got {got}")]
    FeatureMismatch { expected: String, got: String },

    /// Input failed validation
    #[error("schema invalid: {0}")]
    SchemaInvalid(String),

    /// Downstream I/O fault after exhausted retries
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    /// The reconciler refused a correction
    #[error("drift too large: drift={drift} max={max}")]
    DriftTooLarge { drift: String, max: String },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Cache layer error
    #[error("cache error: {0}")]
    Cache(String),

    /// Analytics backend error
    #[error("analytics error: {0}")]
    Analytics(String),

    /// Actor mailbox closed or call timed out
    #[error("actor error: {0}")]
    Actor(String),

    /// Caught-all guard; callers deny with a generic message
    #[error("unhandled error: {0}")]
    Unhandled(String),
}

/// Stable reason attached to every denied verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeniedReason {
    /// No entitlement exists for the (customer, feature) pair
    EntitlementNotFound,
    /// The entitlement exists but could not be evaluated
    EntitlementError,
    /// The meter overran the limit under a non-`always` overage strategy
    LimitExceeded,
    /// The feature is disabled for the project
    FeatureDisabled,
    /// `now` is before the entitlement becomes effective
    NotActive,
    /// `now` is past the entitlement expiry
    Expired,
    /// The customer or project has been revoked
    Revoked,
}

impl DeniedReason {
    /// Stable wire string, matching the serialized form
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EntitlementNotFound => "ENTITLEMENT_NOT_FOUND",
            Self::EntitlementError => "ENTITLEMENT_ERROR",
            Self::LimitExceeded => "LIMIT_EXCEEDED",
            Self::FeatureDisabled => "FEATURE_DISABLED",
            Self::NotActive => "NOT_ACTIVE",
            Self::Expired => "EXPIRED",
            Self::Revoked => "REVOKED",
        }
    }
}

impl std::fmt::Display for DeniedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
