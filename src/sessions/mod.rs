//! Per-login session records.
//!
//! A session captures where and from what a login happened (IP, resolved
//! location, device string). Logout is either soft (stamp `logged_out_at`,
//! keep the row for history) or hard (delete the row); the caller chooses.
//! Sessions and tokens are linked only by the session id carried inside a
//! token's claims; revoking one does not touch the other.

mod models;
mod repo;
mod service;

pub use models::UserSession;
pub use repo::{MemorySessionRepo, PgSessionRepo, SessionRepo};
pub use service::SessionStore;
