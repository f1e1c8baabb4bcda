//! Registration flows.
//!
//! ## Flow Overview
//!
//! A flow is a forward-only state machine over one persisted record:
//!
//! 1) `start(email)` creates the flow at `EmailVerification` and delivers a
//!    numeric code to the address.
//! 2) `verify(flow_id, code)` consumes the code and advances to
//!    `WebauthnStart`.
//! 3) `webauthn_start(flow_id)` issues ceremony options for a provisional
//!    user id and advances to `WebauthnFinish`.
//! 4) `webauthn_finish(flow_id, credential)` verifies the signed response,
//!    creates the user with its first credential, opens a session, mints a
//!    token, and deletes the flow.
//!
//! Any operation invoked out of order fails `InvalidInput`; steps never move
//! backward. Flows expire 30 minutes after creation regardless of progress
//! and an expired flow reads as absent.

mod codes;
mod models;
mod repo;
mod service;

pub use codes::{IssueOutcome, VerificationCodeLedger};
pub use models::{RegisterFlow, RegisterStep};
pub use repo::{FlowRepo, MemoryFlowRepo, PgFlowRepo};
pub use service::{CompletedRegistration, RegisterFlowManager, StartedFlow};
