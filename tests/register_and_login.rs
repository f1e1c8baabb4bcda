//! End-to-end registration and login scenarios driven by a software
//! authenticator, with every collaborator running in-process.

use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use url::Url;
use uuid::Uuid;
use webauthn_authenticator_rs::softpasskey::SoftPasskey;
use webauthn_authenticator_rs::WebauthnAuthenticator;

use identeco::cache::MemoryCache;
use identeco::email::RecordingEmailSender;
use identeco::error::Error;
use identeco::geoip::StaticGeoIp;
use identeco::register::{
    MemoryFlowRepo, RegisterFlowManager, RegisterStep, VerificationCodeLedger,
};
use identeco::sessions::SessionStore;
use identeco::tokens::TokenStore;
use identeco::users::{MemoryUserRepo, UserRepo};
use identeco::webauthn::{
    CeremonyCoordinator, ChallengeStore, CredentialRepo, MemoryCredentialRepo, WebAuthnCredential,
};

const RP_ID: &str = "localhost";
const RP_ORIGIN: &str = "https://localhost";

struct Harness {
    manager: RegisterFlowManager,
    ceremonies: Arc<CeremonyCoordinator>,
    credentials: Arc<dyn CredentialRepo>,
    users: Arc<MemoryUserRepo>,
    tokens: TokenStore,
    sessions: SessionStore,
    email: Arc<RecordingEmailSender>,
}

fn harness() -> Result<Harness> {
    harness_with_credentials(Arc::new(MemoryCredentialRepo::new()))
}

fn harness_with_credentials(credentials: Arc<dyn CredentialRepo>) -> Result<Harness> {
    let cache = Arc::new(MemoryCache::new());
    let users = Arc::new(MemoryUserRepo::new());
    let flows = Arc::new(MemoryFlowRepo::new());
    let email = Arc::new(RecordingEmailSender::new());

    // The software authenticator used below is not a platform authenticator,
    // so the attachment policy is relaxed for the suite.
    let ceremonies = Arc::new(
        CeremonyCoordinator::new(
            RP_ID,
            RP_ORIGIN,
            "Identeco",
            users.clone(),
            credentials.clone(),
            ChallengeStore::new(cache.clone()),
        )?
        .with_authenticator_attachment(None),
    );
    let tokens = TokenStore::new(cache.clone());
    let sessions = SessionStore::new(
        Arc::new(identeco::sessions::MemorySessionRepo::new()),
        users.clone(),
        Arc::new(StaticGeoIp::new().with_entry("203.0.113.5", "Berlin, DE")),
        email.clone(),
    );
    let manager = RegisterFlowManager::new(
        flows.clone(),
        users.clone(),
        credentials.clone(),
        VerificationCodeLedger::new(flows),
        ceremonies.clone(),
        tokens.clone(),
        sessions.clone(),
        email.clone(),
    );

    Ok(Harness {
        manager,
        ceremonies,
        credentials,
        users,
        tokens,
        sessions,
        email,
    })
}

/// Credential storage that rejects every insert, as if the backing store
/// were down at the worst moment.
struct UnavailableCredentialRepo;

#[async_trait::async_trait]
impl CredentialRepo for UnavailableCredentialRepo {
    async fn insert(&self, _credential: &WebAuthnCredential) -> identeco::error::Result<()> {
        Err(anyhow::anyhow!("credential store unavailable").into())
    }

    async fn find(
        &self,
        _credential_id: &[u8],
        _user_id: Uuid,
    ) -> identeco::error::Result<Option<WebAuthnCredential>> {
        Ok(None)
    }

    async fn list_for_user(
        &self,
        _user_id: Uuid,
    ) -> identeco::error::Result<Vec<WebAuthnCredential>> {
        Ok(Vec::new())
    }

    async fn record_authentication(
        &self,
        _credential_id: &[u8],
        _user_id: Uuid,
        _sign_count: i64,
        _backed_up: bool,
    ) -> identeco::error::Result<()> {
        Ok(())
    }
}

fn last_code(email: &RecordingEmailSender, recipient: &str) -> Result<String> {
    email
        .sent()
        .iter()
        .rev()
        .find(|message| message.template == "verification_code" && message.recipient == recipient)
        .and_then(|message| match &message.context {
            Value::Object(context) => context
                .get("code")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            _ => None,
        })
        .context("no verification code delivered")
}

fn origin() -> Result<Url> {
    Url::parse(RP_ORIGIN).context("origin url")
}

/// Drive a full registration for `email` and return the authenticator for
/// subsequent logins along with the completed registration.
async fn register(
    harness: &Harness,
    email: &str,
) -> Result<(
    WebauthnAuthenticator<SoftPasskey>,
    identeco::register::CompletedRegistration,
)> {
    let started = harness
        .manager
        .start(email, Some("203.0.113.5"), Some("Firefox on Linux"))
        .await?;
    assert_eq!(started.step, RegisterStep::EmailVerification);

    let code = last_code(&harness.email, email)?;
    harness.manager.verify(started.flow_id, &code).await?;

    let options = harness.manager.webauthn_start(started.flow_id).await?;

    let mut authenticator = WebauthnAuthenticator::new(SoftPasskey::new(true));
    let credential = authenticator
        .do_registration(origin()?, options)
        .map_err(|err| anyhow::anyhow!("authenticator registration failed: {err:?}"))?;

    let completed = harness
        .manager
        .webauthn_finish(started.flow_id, &credential)
        .await?;
    Ok((authenticator, completed))
}

#[tokio::test]
async fn registration_end_to_end() -> Result<()> {
    let harness = harness()?;
    let (_, completed) = register(&harness, "eve@example.com").await?;

    assert_eq!(completed.user.email, "eve@example.com");
    assert_eq!(completed.session.location, "Berlin, DE");

    // The returned token is immediately usable.
    let claims = harness.tokens.resolve(&completed.token).await?;
    assert_eq!(claims.user_id, completed.user.id);
    assert_eq!(claims.session_id, completed.session.id);
    Ok(())
}

#[tokio::test]
async fn wrong_code_leaves_step_unchanged() -> Result<()> {
    let harness = harness()?;
    let started = harness
        .manager
        .start("frank@example.com", None, None)
        .await?;

    let code = last_code(&harness.email, "frank@example.com")?;
    let wrong = if code == "000000" { "000001" } else { "000000" };
    assert!(matches!(
        harness.manager.verify(started.flow_id, wrong).await,
        Err(Error::InvalidInput(_))
    ));

    // Still at email verification: the ceremony cannot be started, and the
    // right code still works.
    assert!(matches!(
        harness.manager.webauthn_start(started.flow_id).await,
        Err(Error::InvalidInput(_))
    ));
    harness.manager.verify(started.flow_id, &code).await?;
    Ok(())
}

#[tokio::test]
async fn out_of_order_steps_are_rejected() -> Result<()> {
    let harness = harness()?;
    let started = harness.manager.start("grace@example.com", None, None).await?;

    assert!(matches!(
        harness.manager.webauthn_start(started.flow_id).await,
        Err(Error::InvalidInput(_))
    ));

    let code = last_code(&harness.email, "grace@example.com")?;
    harness.manager.verify(started.flow_id, &code).await?;

    // Verified codes cannot be consumed a second time.
    assert!(matches!(
        harness.manager.verify(started.flow_id, &code).await,
        Err(Error::InvalidInput(_))
    ));
    Ok(())
}

#[tokio::test]
async fn duplicate_email_cannot_start_a_flow() -> Result<()> {
    let harness = harness()?;
    register(&harness, "heidi@example.com").await?;

    assert!(matches!(
        harness.manager.start("heidi@example.com", None, None).await,
        Err(Error::InvalidInput(_))
    ));
    Ok(())
}

#[tokio::test]
async fn cancelled_flows_are_gone() -> Result<()> {
    let harness = harness()?;
    let started = harness.manager.start("ivan@example.com", None, None).await?;

    harness.manager.cancel(started.flow_id).await?;
    harness.manager.cancel(started.flow_id).await?;

    let code = last_code(&harness.email, "ivan@example.com")?;
    assert!(matches!(
        harness.manager.verify(started.flow_id, &code).await,
        Err(Error::InvalidInput(_))
    ));
    Ok(())
}

#[tokio::test]
async fn login_end_to_end() -> Result<()> {
    let harness = harness()?;
    let (mut authenticator, completed) = register(&harness, "judy@example.com").await?;

    let options = harness
        .ceremonies
        .generate_authentication_options("judy@example.com")
        .await?;
    let assertion = authenticator
        .do_authentication(origin()?, options)
        .map_err(|err| anyhow::anyhow!("authenticator assertion failed: {err:?}"))?;

    let verified = harness.ceremonies.verify_authentication(&assertion).await?;
    assert_eq!(verified.user_id, completed.user.id);
    assert!(verified.sign_count > 0);

    // The credential's counter and usage stamp were persisted.
    let stored = harness
        .credentials
        .find(&verified.credential_id, verified.user_id)
        .await?
        .context("credential missing")?;
    assert_eq!(stored.sign_count, verified.sign_count);
    assert!(stored.last_used_at.is_some());

    // A login opens its own session and token.
    let session = harness
        .sessions
        .create(verified.user_id, None, Some("Firefox on Linux"))
        .await?;
    let token = harness.tokens.issue(verified.user_id, session.id).await?;
    assert_eq!(
        harness.tokens.resolve(&token).await?.session_id,
        session.id
    );
    Ok(())
}

#[tokio::test]
async fn authentication_challenges_are_single_use() -> Result<()> {
    let harness = harness()?;
    let (mut authenticator, _) = register(&harness, "mallory@example.com").await?;

    let options = harness
        .ceremonies
        .generate_authentication_options("mallory@example.com")
        .await?;
    let assertion = authenticator
        .do_authentication(origin()?, options)
        .map_err(|err| anyhow::anyhow!("authenticator assertion failed: {err:?}"))?;

    harness.ceremonies.verify_authentication(&assertion).await?;
    assert!(matches!(
        harness.ceremonies.verify_authentication(&assertion).await,
        Err(Error::InvalidInput(_))
    ));
    Ok(())
}

#[tokio::test]
async fn counter_regression_is_rejected_without_mutation() -> Result<()> {
    let harness = harness()?;
    let (mut authenticator, completed) = register(&harness, "niaj@example.com").await?;

    // Find the registered credential and jump its counter far ahead, as if a
    // clone had already authenticated.
    let stored = harness
        .credentials
        .list_for_user(completed.user.id)
        .await?
        .pop()
        .context("credential missing")?;
    harness
        .credentials
        .record_authentication(&stored.credential_id, completed.user.id, 1000, false)
        .await?;

    let options = harness
        .ceremonies
        .generate_authentication_options("niaj@example.com")
        .await?;
    let assertion = authenticator
        .do_authentication(origin()?, options)
        .map_err(|err| anyhow::anyhow!("authenticator assertion failed: {err:?}"))?;

    assert!(matches!(
        harness.ceremonies.verify_authentication(&assertion).await,
        Err(Error::InvalidInput(_))
    ));

    // Storage kept the high-water mark.
    let after = harness
        .credentials
        .find(&stored.credential_id, completed.user.id)
        .await?
        .context("credential missing")?;
    assert_eq!(after.sign_count, 1000);
    Ok(())
}

#[tokio::test]
async fn revoke_all_invalidates_every_token() -> Result<()> {
    let harness = harness()?;
    let (_, completed) = register(&harness, "olivia@example.com").await?;

    let extra = harness
        .tokens
        .issue(completed.user.id, Uuid::new_v4())
        .await?;

    harness.tokens.revoke_all(completed.user.id).await?;
    harness.sessions.logout_all(completed.user.id).await?;

    assert!(matches!(
        harness.tokens.resolve(&completed.token).await,
        Err(Error::Unauthenticated)
    ));
    assert!(matches!(
        harness.tokens.resolve(&extra).await,
        Err(Error::Unauthenticated)
    ));
    assert!(harness
        .sessions
        .list_all(completed.user.id)
        .await?
        .iter()
        .all(|session| !session.is_active()));
    Ok(())
}

#[tokio::test]
async fn failed_credential_insert_releases_the_email() -> Result<()> {
    let harness = harness_with_credentials(Arc::new(UnavailableCredentialRepo))?;
    let started = harness.manager.start("pat@example.com", None, None).await?;
    let code = last_code(&harness.email, "pat@example.com")?;
    harness.manager.verify(started.flow_id, &code).await?;

    let options = harness.manager.webauthn_start(started.flow_id).await?;
    let mut authenticator = WebauthnAuthenticator::new(SoftPasskey::new(true));
    let credential = authenticator
        .do_registration(origin()?, options)
        .map_err(|err| anyhow::anyhow!("authenticator registration failed: {err:?}"))?;

    assert!(harness
        .manager
        .webauthn_finish(started.flow_id, &credential)
        .await
        .is_err());

    // No half-created account survives: the email can start a fresh flow.
    assert!(harness
        .users
        .find_by_email("pat@example.com")
        .await?
        .is_none());
    harness.manager.start("pat@example.com", None, None).await?;
    Ok(())
}

#[tokio::test]
async fn unknown_email_cannot_authenticate() -> Result<()> {
    let harness = harness()?;
    assert!(matches!(
        harness
            .ceremonies
            .generate_authentication_options("nobody@example.com")
            .await,
        Err(Error::InvalidInput(_))
    ));
    Ok(())
}
