//! WebAuthn ceremonies.
//!
//! ## Flow Overview
//!
//! Both ceremonies follow the same shape: generate options carrying a random
//! challenge, park the ceremony state in the [`ChallengeStore`] keyed by the
//! challenge itself, hand the options to the client, then verify the signed
//! response against the parked state. The challenge is single-use; it is
//! removed the moment a verification attempt claims it, so a replayed
//! response fails with `InvalidInput`.
//!
//! Authentication additionally enforces the signature counter: a response
//! reporting a counter at or below the stored value is treated as a cloned
//! authenticator and rejected without touching storage.

mod challenge;
mod models;
mod repo;
mod service;

pub use challenge::ChallengeStore;
pub use models::WebAuthnCredential;
pub use repo::{CredentialRepo, MemoryCredentialRepo, PgCredentialRepo};
pub use service::{
    CeremonyCoordinator, VerifiedAuthentication, VerifiedRegistration,
};
