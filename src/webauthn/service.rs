//! Ceremony coordination.
//!
//! Flow Overview:
//! 1) Build registration or authentication options with a fresh challenge.
//! 2) Park the library's ceremony state in the [`ChallengeStore`] keyed by
//!    the challenge, tied to the acting user id (provisional for
//!    registration).
//! 3) On verify, recover the challenge from the response's `clientDataJSON`,
//!    claim the parked state (single use), and let the library check
//!    signature, origin, and RP id.
//! 4) Authentication additionally enforces strict sign-count advancement and
//!    stamps the credential's usage.
//!
//! Every verification failure is a non-retriable `InvalidInput`; the caller
//! restarts the ceremony with a fresh challenge.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use std::sync::Arc;
use url::Url;
use uuid::Uuid;
use webauthn_rs::prelude::{
    CreationChallengeResponse, Passkey, PasskeyAuthentication, PasskeyRegistration,
    PublicKeyCredential, RegisterPublicKeyCredential, RequestChallengeResponse, Webauthn,
    WebauthnBuilder,
};
use webauthn_rs_proto::{AuthenticatorAttachment, ResidentKeyRequirement, UserVerificationPolicy};

use crate::error::{Error, Result};
use crate::users::UserRepo;
use crate::webauthn::challenge::ChallengeStore;
use crate::webauthn::models::WebAuthnCredential;
use crate::webauthn::repo::CredentialRepo;

const REGISTER_KIND: &str = "register";
const AUTH_KIND: &str = "auth";

/// Outcome of a verified registration ceremony. The caller persists the user
/// and the credential together.
pub struct VerifiedRegistration {
    pub user_id: Uuid,
    pub credential: WebAuthnCredential,
}

/// Outcome of a verified authentication ceremony. Storage has already been
/// stamped with the new sign count.
pub struct VerifiedAuthentication {
    pub user_id: Uuid,
    pub credential_id: Vec<u8>,
    pub sign_count: i64,
}

pub struct CeremonyCoordinator {
    webauthn: Webauthn,
    users: Arc<dyn UserRepo>,
    credentials: Arc<dyn CredentialRepo>,
    challenges: ChallengeStore,
    attachment: Option<AuthenticatorAttachment>,
    user_verification: UserVerificationPolicy,
    resident_key: Option<ResidentKeyRequirement>,
}

impl CeremonyCoordinator {
    /// Build a coordinator scoped to one relying party. The default
    /// authenticator-selection policy is platform attachment, required user
    /// verification, preferred resident key.
    ///
    /// # Errors
    /// Returns error if the origin is not a valid URL or the RP id does not
    /// match it.
    pub fn new(
        rp_id: &str,
        rp_origin: &str,
        rp_name: &str,
        users: Arc<dyn UserRepo>,
        credentials: Arc<dyn CredentialRepo>,
        challenges: ChallengeStore,
    ) -> Result<Self> {
        let rp_origin_url = Url::parse(rp_origin)
            .map_err(|_| Error::invalid(format!("invalid relying party origin: {rp_origin}")))?;
        let webauthn = WebauthnBuilder::new(rp_id, &rp_origin_url)
            .map_err(|err| Error::invalid(format!("invalid relying party: {err}")))?
            .rp_name(rp_name)
            .build()
            .map_err(|err| anyhow::Error::new(err).context("Failed to build webauthn"))?;

        Ok(Self {
            webauthn,
            users,
            credentials,
            challenges,
            attachment: Some(AuthenticatorAttachment::Platform),
            user_verification: UserVerificationPolicy::Required,
            resident_key: Some(ResidentKeyRequirement::Preferred),
        })
    }

    /// Override the attachment policy; `None` accepts any authenticator
    /// (roaming keys, software authenticators).
    #[must_use]
    pub fn with_authenticator_attachment(
        mut self,
        attachment: Option<AuthenticatorAttachment>,
    ) -> Self {
        self.attachment = attachment;
        self
    }

    #[must_use]
    pub fn with_user_verification(mut self, policy: UserVerificationPolicy) -> Self {
        self.user_verification = policy;
        self
    }

    #[must_use]
    pub fn with_resident_key(mut self, requirement: Option<ResidentKeyRequirement>) -> Self {
        self.resident_key = requirement;
        self
    }

    /// Begin a registration ceremony for a provisional user id not yet
    /// committed to storage.
    ///
    /// # Errors
    /// Returns error if option generation or challenge storage fails.
    pub async fn generate_registration_options(
        &self,
        pending_user_id: Uuid,
        email: &str,
        display_name: &str,
    ) -> Result<CreationChallengeResponse> {
        let (mut options, state) = self
            .webauthn
            .start_passkey_registration(pending_user_id, email, display_name, None)
            .map_err(|err| {
                anyhow::Error::new(err).context("Failed to start registration ceremony")
            })?;

        if let Some(selection) = options.public_key.authenticator_selection.as_mut() {
            selection.authenticator_attachment = self.attachment.clone();
            selection.user_verification = self.user_verification.clone();
            selection.resident_key = self.resident_key.clone();
        }

        let challenge = URL_SAFE_NO_PAD.encode(&options.public_key.challenge);
        self.challenges
            .put(REGISTER_KIND, &challenge, pending_user_id, &state)
            .await?;

        Ok(options)
    }

    /// Verify a signed registration response. Yields the credential for the
    /// caller to persist alongside the new user; nothing is written here.
    ///
    /// # Errors
    /// Returns `InvalidInput` on an unknown/expired/reused challenge or any
    /// cryptographic verification failure.
    pub async fn verify_registration(
        &self,
        credential: &RegisterPublicKeyCredential,
    ) -> Result<VerifiedRegistration> {
        let challenge = challenge_from_client_data(credential.response.client_data_json.as_ref())?;
        let Some((user_id, state)) = self
            .challenges
            .take::<PasskeyRegistration>(REGISTER_KIND, &challenge)
            .await?
        else {
            return Err(Error::invalid("unknown or expired registration challenge"));
        };

        let passkey = self
            .webauthn
            .finish_passkey_registration(credential, &state)
            .map_err(|err| Error::invalid(format!("registration verification failed: {err}")))?;

        let transports = credential
            .response
            .transports
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|transport| format!("{transport:?}").to_lowercase())
            .collect();

        Ok(VerifiedRegistration {
            user_id,
            credential: WebAuthnCredential {
                credential_id: passkey.cred_id().as_slice().to_vec(),
                user_id,
                public_key: serialize_passkey(&passkey)?,
                sign_count: 0,
                device_type: "single_device".to_string(),
                backed_up: false,
                transports,
                created_at: Utc::now(),
                last_used_at: None,
            },
        })
    }

    /// Begin an authentication ceremony for a known email.
    ///
    /// # Errors
    /// Returns `InvalidInput` if no user owns the email or the user has no
    /// registered credentials.
    pub async fn generate_authentication_options(
        &self,
        email: &str,
    ) -> Result<RequestChallengeResponse> {
        let Some(user) = self.users.find_by_email(email).await? else {
            return Err(Error::invalid("no user registered for email"));
        };

        let passkeys: Vec<Passkey> = self
            .credentials
            .list_for_user(user.id)
            .await?
            .iter()
            .filter_map(|credential| serde_json::from_slice(&credential.public_key).ok())
            .collect();
        if passkeys.is_empty() {
            return Err(Error::invalid("no credentials registered for user"));
        }

        let (options, state) = self
            .webauthn
            .start_passkey_authentication(&passkeys)
            .map_err(|err| {
                anyhow::Error::new(err).context("Failed to start authentication ceremony")
            })?;

        let challenge = URL_SAFE_NO_PAD.encode(&options.public_key.challenge);
        self.challenges
            .put(AUTH_KIND, &challenge, user.id, &state)
            .await?;

        Ok(options)
    }

    /// Verify a signed assertion, enforce sign-count advancement, and stamp
    /// the credential's usage.
    ///
    /// # Errors
    /// Returns `InvalidInput` on an unknown/expired/reused challenge, an
    /// unregistered credential, a counter regression, or any cryptographic
    /// verification failure. Storage is untouched on failure.
    pub async fn verify_authentication(
        &self,
        credential: &PublicKeyCredential,
    ) -> Result<VerifiedAuthentication> {
        let challenge = challenge_from_client_data(credential.response.client_data_json.as_ref())?;
        let Some((user_id, state)) = self
            .challenges
            .take::<PasskeyAuthentication>(AUTH_KIND, &challenge)
            .await?
        else {
            return Err(Error::invalid(
                "unknown or expired authentication challenge",
            ));
        };

        let result = self
            .webauthn
            .finish_passkey_authentication(credential, &state)
            .map_err(|err| Error::invalid(format!("authentication verification failed: {err}")))?;

        let credential_id = result.cred_id().as_slice().to_vec();
        let Some(stored) = self.credentials.find(&credential_id, user_id).await? else {
            return Err(Error::invalid("credential not registered for user"));
        };

        let sign_count = i64::from(result.counter());
        ensure_counter_advances(stored.sign_count, sign_count)?;

        self.credentials
            .record_authentication(&credential_id, user_id, sign_count, result.backup_state())
            .await?;

        Ok(VerifiedAuthentication {
            user_id,
            credential_id,
            sign_count,
        })
    }
}

fn serialize_passkey(passkey: &Passkey) -> Result<Vec<u8>> {
    serde_json::to_vec(passkey)
        .map_err(|err| anyhow::Error::new(err).context("Failed to serialize passkey").into())
}

/// Strict replay rule: the reported counter must exceed the stored one.
fn ensure_counter_advances(stored: i64, reported: i64) -> Result<()> {
    if reported > stored {
        Ok(())
    } else {
        Err(Error::invalid(format!(
            "signature counter did not advance (stored {stored}, reported {reported})"
        )))
    }
}

/// Recover the base64url challenge string from a response's `clientDataJSON`.
fn challenge_from_client_data(client_data_json: &[u8]) -> Result<String> {
    let client_data: serde_json::Value = serde_json::from_slice(client_data_json)
        .map_err(|_| Error::invalid("malformed client data"))?;
    client_data
        .get("challenge")
        .and_then(|challenge| challenge.as_str())
        .map(ToString::to_string)
        .ok_or_else(|| Error::invalid("client data missing challenge"))
}
