//! Error taxonomy shared by every component.
//!
//! Callers (the HTTP layer lives outside this crate) map variants to status
//! codes: `InvalidInput` 400, `NotFound` 404, `Unauthenticated` 401,
//! `RateLimited` 429, `Unexpected` 500. `Unexpected` wraps storage and crypto
//! failures that are not attributable to caller input and must be reported
//! generically without leaking internal detail.

use std::fmt;

/// Which limiter tier rejected the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitTier {
    /// The global per-client rule.
    Primary,
    /// A per-route rule (explicit or default fallback).
    Secondary,
}

impl fmt::Display for LimitTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad, expired, or mismatched caller input (codes, challenges,
    /// credentials, duplicate emails). Retriable with corrected input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Lookup by id for an entity that does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Missing or unresolvable bearer token; requires re-authentication.
    #[error("unauthenticated")]
    Unauthenticated,

    /// A request budget was exhausted; retriable after the window resets.
    #[error("rate limit exceeded ({tier})")]
    RateLimited { tier: LimitTier },

    /// Storage or cryptographic failure not attributable to caller input.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::{Error, LimitTier};

    #[test]
    fn limit_tier_display_names() {
        assert_eq!(LimitTier::Primary.to_string(), "primary");
        assert_eq!(LimitTier::Secondary.to_string(), "secondary");
    }

    #[test]
    fn error_messages_stay_generic() {
        let err = Error::invalid("code mismatch");
        assert_eq!(err.to_string(), "invalid input: code mismatch");

        let err = Error::NotFound("flow");
        assert_eq!(err.to_string(), "flow not found");

        let err = Error::RateLimited {
            tier: LimitTier::Secondary,
        };
        assert_eq!(err.to_string(), "rate limit exceeded (secondary)");
    }
}
