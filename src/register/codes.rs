//! Verification code issuance and consumption.
//!
//! One live code per flow: issuing overwrites the previous hash, consuming
//! clears it. Codes are six decimal digits, valid for ten minutes, stored
//! only as SHA-256 over `email ":" code`. A resend inside the sixty second
//! cooldown is reported as [`IssueOutcome::Cooldown`] and leaves the previous
//! code untouched.

use chrono::{Duration, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::register::models::RegisterFlow;
use crate::register::repo::FlowRepo;

const DEFAULT_CODE_TTL_SECONDS: i64 = 600;
const DEFAULT_RESEND_COOLDOWN_SECONDS: i64 = 60;

#[derive(Debug, PartialEq, Eq)]
pub enum IssueOutcome {
    /// A fresh code, to be delivered to the address. Never persisted raw.
    Issued(String),
    /// The previous code is still within its resend cooldown.
    Cooldown,
}

#[derive(Clone)]
pub struct VerificationCodeLedger {
    flows: Arc<dyn FlowRepo>,
    ttl: Duration,
    cooldown: Duration,
}

impl VerificationCodeLedger {
    #[must_use]
    pub fn new(flows: Arc<dyn FlowRepo>) -> Self {
        Self {
            flows,
            ttl: Duration::seconds(DEFAULT_CODE_TTL_SECONDS),
            cooldown: Duration::seconds(DEFAULT_RESEND_COOLDOWN_SECONDS),
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Issue a code for the flow, superseding any previous one.
    ///
    /// # Errors
    /// Returns `Unexpected` if the write fails.
    pub async fn issue(&self, flow: &RegisterFlow) -> Result<IssueOutcome> {
        let now = Utc::now();
        if flow
            .code_issued_at
            .is_some_and(|issued_at| now - issued_at < self.cooldown)
        {
            return Ok(IssueOutcome::Cooldown);
        }

        let code = generate_code();
        let code_hash = hash_code(&flow.email, &code);
        self.flows
            .set_code(flow.id, &code_hash, now, now + self.ttl)
            .await?;
        Ok(IssueOutcome::Issued(code))
    }

    /// Consume the flow's live code. A successful consume clears the code so
    /// it cannot be verified twice.
    ///
    /// # Errors
    /// Returns `InvalidInput` on a missing, expired, or mismatched code.
    pub async fn consume(&self, flow: &RegisterFlow, code: &str) -> Result<()> {
        let Some(stored_hash) = flow.code_hash.as_deref() else {
            return Err(Error::invalid("no verification code issued"));
        };
        if flow
            .code_expires_at
            .is_none_or(|expires_at| expires_at <= Utc::now())
        {
            return Err(Error::invalid("verification code expired"));
        }
        if hash_code(&flow.email, code.trim()) != stored_hash {
            return Err(Error::invalid("verification code mismatch"));
        }

        self.flows.clear_code(flow.id).await
    }
}

fn generate_code() -> String {
    format!("{:06}", OsRng.gen_range(0..1_000_000u32))
}

fn hash_code(email: &str, code: &str) -> Vec<u8> {
    Sha256::digest(format!("{email}:{code}").as_bytes()).to_vec()
}

#[cfg(test)]
mod tests {
    use super::{generate_code, hash_code, IssueOutcome, VerificationCodeLedger};
    use crate::error::Error;
    use crate::register::models::{RegisterFlow, RegisterStep};
    use crate::register::repo::{FlowRepo, MemoryFlowRepo};
    use anyhow::Result;
    use chrono::{Duration, Utc};
    use std::sync::Arc;
    use uuid::Uuid;

    fn flow() -> RegisterFlow {
        RegisterFlow {
            id: Uuid::new_v4(),
            email: "dave@example.com".to_string(),
            step: RegisterStep::EmailVerification,
            code_hash: None,
            code_issued_at: None,
            code_expires_at: None,
            ip_address: None,
            user_agent: None,
            expires_at: Utc::now() + Duration::minutes(30),
            created_at: Utc::now(),
        }
    }

    async fn issued_code(
        ledger: &VerificationCodeLedger,
        flow: &RegisterFlow,
    ) -> Result<String> {
        match ledger.issue(flow).await? {
            IssueOutcome::Issued(code) => Ok(code),
            IssueOutcome::Cooldown => anyhow::bail!("unexpected cooldown"),
        }
    }

    #[test]
    fn codes_are_six_digits() {
        for _ in 0..32 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn hashes_are_keyed_by_email() {
        assert_ne!(
            hash_code("a@example.com", "123456"),
            hash_code("b@example.com", "123456")
        );
    }

    #[tokio::test]
    async fn issue_then_consume() -> Result<()> {
        let flows = Arc::new(MemoryFlowRepo::new());
        let ledger = VerificationCodeLedger::new(flows.clone());
        let flow = flow();
        flows.insert(&flow).await?;

        let code = issued_code(&ledger, &flow).await?;
        let flow = flows.find(flow.id).await?.unwrap();
        ledger.consume(&flow, &code).await?;

        // Consumed codes cannot be verified again.
        let flow = flows.find(flow.id).await?.unwrap();
        assert!(matches!(
            ledger.consume(&flow, &code).await,
            Err(Error::InvalidInput(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn wrong_code_is_rejected() -> Result<()> {
        let flows = Arc::new(MemoryFlowRepo::new());
        let ledger = VerificationCodeLedger::new(flows.clone());
        let flow = flow();
        flows.insert(&flow).await?;

        let code = issued_code(&ledger, &flow).await?;
        let flow = flows.find(flow.id).await?.unwrap();
        let wrong = if code == "000000" { "000001" } else { "000000" };
        assert!(matches!(
            ledger.consume(&flow, wrong).await,
            Err(Error::InvalidInput(_))
        ));

        // The right code is still live after a failed attempt.
        ledger.consume(&flow, &code).await?;
        Ok(())
    }

    #[tokio::test]
    async fn resend_supersedes_after_cooldown() -> Result<()> {
        let flows = Arc::new(MemoryFlowRepo::new());
        let ledger = VerificationCodeLedger::new(flows.clone()).with_cooldown(Duration::zero());
        let flow = flow();
        flows.insert(&flow).await?;

        let first = issued_code(&ledger, &flow).await?;
        let flow = flows.find(flow.id).await?.unwrap();
        let second = issued_code(&ledger, &flow).await?;

        let flow = flows.find(flow.id).await?.unwrap();
        if first != second {
            assert!(matches!(
                ledger.consume(&flow, &first).await,
                Err(Error::InvalidInput(_))
            ));
        }
        ledger.consume(&flow, &second).await?;
        Ok(())
    }

    #[tokio::test]
    async fn resend_inside_cooldown_is_a_noop() -> Result<()> {
        let flows = Arc::new(MemoryFlowRepo::new());
        let ledger = VerificationCodeLedger::new(flows.clone());
        let flow = flow();
        flows.insert(&flow).await?;

        let first = issued_code(&ledger, &flow).await?;
        let flow = flows.find(flow.id).await?.unwrap();
        assert_eq!(ledger.issue(&flow).await?, IssueOutcome::Cooldown);

        // The previous code stays valid.
        ledger.consume(&flow, &first).await?;
        Ok(())
    }

    #[tokio::test]
    async fn expired_code_is_rejected() -> Result<()> {
        let flows = Arc::new(MemoryFlowRepo::new());
        let ledger =
            VerificationCodeLedger::new(flows.clone()).with_ttl(Duration::milliseconds(-1));
        let flow = flow();
        flows.insert(&flow).await?;

        let code = issued_code(&ledger, &flow).await?;
        let flow = flows.find(flow.id).await?.unwrap();
        assert!(matches!(
            ledger.consume(&flow, &code).await,
            Err(Error::InvalidInput(_))
        ));
        Ok(())
    }
}
