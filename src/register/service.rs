use chrono::{Duration, Utc};
use regex::Regex;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use webauthn_rs::prelude::{CreationChallengeResponse, RegisterPublicKeyCredential};

use crate::email::{EmailMessage, EmailSender};
use crate::error::{Error, Result};
use crate::register::codes::{IssueOutcome, VerificationCodeLedger};
use crate::register::models::{RegisterFlow, RegisterStep};
use crate::register::repo::FlowRepo;
use crate::sessions::{SessionStore, UserSession};
use crate::tokens::TokenStore;
use crate::users::{User, UserRepo};
use crate::webauthn::{CeremonyCoordinator, CredentialRepo};

const DEFAULT_FLOW_TTL_MINUTES: i64 = 30;
const VERIFICATION_CODE_TEMPLATE: &str = "verification_code";

/// What `start` hands back for display.
#[derive(Debug, Clone)]
pub struct StartedFlow {
    pub flow_id: Uuid,
    pub step: RegisterStep,
    pub email_redacted: String,
    pub expires_at: chrono::DateTime<Utc>,
}

/// The terminal "user created" outcome.
pub struct CompletedRegistration {
    pub user: User,
    pub token: String,
    pub session: UserSession,
}

pub struct RegisterFlowManager {
    flows: Arc<dyn FlowRepo>,
    users: Arc<dyn UserRepo>,
    credentials: Arc<dyn CredentialRepo>,
    codes: VerificationCodeLedger,
    ceremonies: Arc<CeremonyCoordinator>,
    tokens: TokenStore,
    sessions: SessionStore,
    email: Arc<dyn EmailSender>,
    flow_ttl: Duration,
}

impl RegisterFlowManager {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flows: Arc<dyn FlowRepo>,
        users: Arc<dyn UserRepo>,
        credentials: Arc<dyn CredentialRepo>,
        codes: VerificationCodeLedger,
        ceremonies: Arc<CeremonyCoordinator>,
        tokens: TokenStore,
        sessions: SessionStore,
        email: Arc<dyn EmailSender>,
    ) -> Self {
        Self {
            flows,
            users,
            credentials,
            codes,
            ceremonies,
            tokens,
            sessions,
            email,
            flow_ttl: Duration::minutes(DEFAULT_FLOW_TTL_MINUTES),
        }
    }

    #[must_use]
    pub fn with_flow_ttl(mut self, flow_ttl: Duration) -> Self {
        self.flow_ttl = flow_ttl;
        self
    }

    /// Open a flow at `EmailVerification` and deliver the first code.
    ///
    /// # Errors
    /// Returns `InvalidInput` for a malformed or already registered email.
    pub async fn start(
        &self,
        email: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<StartedFlow> {
        let email = normalize_email(email);
        if !valid_email(&email) {
            return Err(Error::invalid("malformed email address"));
        }
        if self.users.find_by_email(&email).await?.is_some() {
            return Err(Error::invalid("email already registered"));
        }

        let now = Utc::now();
        let flow = RegisterFlow {
            id: Uuid::new_v4(),
            email: email.clone(),
            step: RegisterStep::EmailVerification,
            code_hash: None,
            code_issued_at: None,
            code_expires_at: None,
            ip_address: ip.map(ToString::to_string),
            user_agent: user_agent.map(ToString::to_string),
            expires_at: now + self.flow_ttl,
            created_at: now,
        };
        self.flows.insert(&flow).await?;

        // A fresh flow has no prior code, so issuance cannot hit the cooldown.
        if let IssueOutcome::Issued(code) = self.codes.issue(&flow).await? {
            self.deliver_code(&email, &code);
        }

        info!(flow_id = %flow.id, "Register flow started");
        Ok(StartedFlow {
            flow_id: flow.id,
            step: flow.step,
            email_redacted: redact_email(&email),
            expires_at: flow.expires_at,
        })
    }

    /// Re-deliver a code, superseding the previous one. Inside the resend
    /// cooldown this is an opaque no-op success.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the flow is absent/expired or past email
    /// verification.
    pub async fn resend_verification(&self, flow_id: Uuid) -> Result<()> {
        let flow = self.require_flow(flow_id).await?;
        self.require_step(&flow, RegisterStep::EmailVerification)?;

        if let IssueOutcome::Issued(code) = self.codes.issue(&flow).await? {
            self.deliver_code(&flow.email, &code);
        }
        Ok(())
    }

    /// Prove email ownership and advance to `WebauthnStart`.
    ///
    /// # Errors
    /// Returns `InvalidInput` on a wrong/expired code or an out-of-order
    /// flow; the step is unchanged on failure.
    pub async fn verify(&self, flow_id: Uuid, code: &str) -> Result<()> {
        let flow = self.require_flow(flow_id).await?;
        self.require_step(&flow, RegisterStep::EmailVerification)?;

        self.codes.consume(&flow, code).await?;
        if !self
            .flows
            .advance_step(
                flow.id,
                RegisterStep::EmailVerification,
                RegisterStep::WebauthnStart,
            )
            .await?
        {
            return Err(Error::invalid("register flow is no longer at this step"));
        }
        Ok(())
    }

    /// Abandon a flow. Idempotent.
    ///
    /// # Errors
    /// Returns `Unexpected` if the delete fails.
    pub async fn cancel(&self, flow_id: Uuid) -> Result<()> {
        self.flows.delete(flow_id).await
    }

    /// Issue registration ceremony options for a provisional user id and
    /// advance to `WebauthnFinish`.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the flow is absent/expired or not at
    /// `WebauthnStart`.
    pub async fn webauthn_start(&self, flow_id: Uuid) -> Result<CreationChallengeResponse> {
        let flow = self.require_flow(flow_id).await?;
        self.require_step(&flow, RegisterStep::WebauthnStart)?;

        let pending_user_id = Uuid::new_v4();
        let options = self
            .ceremonies
            .generate_registration_options(pending_user_id, &flow.email, &flow.email)
            .await?;

        if !self
            .flows
            .advance_step(
                flow.id,
                RegisterStep::WebauthnStart,
                RegisterStep::WebauthnFinish,
            )
            .await?
        {
            return Err(Error::invalid("register flow is no longer at this step"));
        }
        Ok(options)
    }

    /// Verify the signed credential and finish the flow: user, first
    /// credential, session, and token are created; the flow record is
    /// removed.
    ///
    /// # Errors
    /// Returns `InvalidInput` on a failed ceremony or an out-of-order flow;
    /// nothing is persisted on failure.
    pub async fn webauthn_finish(
        &self,
        flow_id: Uuid,
        credential: &RegisterPublicKeyCredential,
    ) -> Result<CompletedRegistration> {
        let flow = self.require_flow(flow_id).await?;
        self.require_step(&flow, RegisterStep::WebauthnFinish)?;

        let verified = self.ceremonies.verify_registration(credential).await?;

        let user = User {
            id: verified.user_id,
            email: flow.email.clone(),
            display_name: flow.email.clone(),
            created_at: Utc::now(),
        };
        self.users.insert(&user).await?;
        if let Err(err) = self.credentials.insert(&verified.credential).await {
            // A user row without its first credential can never authenticate
            // and would hold the email hostage; release it.
            if let Err(cleanup_err) = self.users.delete(user.id).await {
                warn!(
                    user_id = %user.id,
                    "Failed to remove user after credential insert failure: {cleanup_err}"
                );
            }
            return Err(err);
        }

        let session = self
            .sessions
            .create(
                user.id,
                flow.ip_address.as_deref(),
                flow.user_agent.as_deref(),
            )
            .await?;
        let token = self.tokens.issue(user.id, session.id).await?;

        self.flows.delete(flow.id).await?;
        info!(flow_id = %flow.id, user_id = %user.id, "Register flow completed");

        Ok(CompletedRegistration {
            user,
            token,
            session,
        })
    }

    async fn require_flow(&self, flow_id: Uuid) -> Result<RegisterFlow> {
        self.flows
            .find(flow_id)
            .await?
            .ok_or_else(|| Error::invalid("register flow expired or unknown"))
    }

    fn require_step(&self, flow: &RegisterFlow, expected: RegisterStep) -> Result<()> {
        if flow.step == expected {
            Ok(())
        } else {
            Err(Error::invalid(format!(
                "register flow is at {}, expected {}",
                flow.step.as_str(),
                expected.as_str()
            )))
        }
    }

    fn deliver_code(&self, email: &str, code: &str) {
        let message = EmailMessage::new(
            VERIFICATION_CODE_TEMPLATE,
            email,
            json!({ "code": code }),
        );
        if let Err(err) = self.email.send(&message) {
            warn!("Failed to send verification code: {err}");
        }
    }
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub(crate) fn valid_email(email: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email))
}

/// Redact an email for display, keeping the first and last character of the
/// local part. Short locals keep only the first character.
pub(crate) fn redact_email(email: &str) -> String {
    let Some((local, domain)) = email.split_once('@') else {
        return email.to_string();
    };
    let mut chars = local.chars();
    match (chars.next(), local.chars().count()) {
        (Some(first), count) if count > 2 => {
            let last = local.chars().last().unwrap_or(first);
            format!("{first}***{last}@{domain}")
        }
        (Some(first), _) => format!("{first}***@{domain}"),
        (None, _) => format!("***@{domain}"),
    }
}
