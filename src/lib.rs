//! # Identeco (Identity & Session Core)
//!
//! `identeco` turns passkey ceremonies, email-ownership proofs, opaque bearer
//! tokens, and per-client request budgets into one authentication and
//! session-management story. It is a library: HTTP routing, serialization,
//! and process wiring live in the consuming service.
//!
//! ## Registration
//!
//! Registration is a forward-only state machine over a single persisted flow
//! record: prove email ownership with a short numeric code, then bind a
//! WebAuthn credential, then the user exists. Flows expire after thirty
//! minutes regardless of progress; out-of-order operations are rejected
//! rather than silently corrected.
//!
//! ## Authentication & Sessions
//!
//! - **Ceremonies:** challenges are single-use, TTL-bound, and keyed by their
//!   own value; signature counters must strictly advance or the assertion is
//!   rejected as a possible cloned authenticator.
//! - **Tokens:** opaque bearer strings stored only as SHA-256 hashes, with a
//!   per-user revocation set for "logout everywhere".
//! - **Sessions:** per-login records carrying IP, GeoIP location, and device;
//!   a first-seen device fires a security notification before the new session
//!   row can mask it.
//!
//! ## Rate Limiting
//!
//! Every inbound request passes a moving-window budget in two tiers: one
//! global per-client rule and one per-route rule, with an exemption list for
//! health checks.
//!
//! Collaborators (persistence, ephemeral cache, email dispatch, GeoIP) are
//! injected trait handles constructed at startup and shared by reference;
//! there is no global state.

pub mod cache;
pub mod email;
pub mod error;
pub mod geoip;
pub mod rate_limit;
pub mod register;
pub mod sessions;
pub mod tokens;
pub mod users;
pub mod webauthn;
