use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::webauthn::models::WebAuthnCredential;

#[async_trait]
pub trait CredentialRepo: Send + Sync {
    /// Persist a newly registered credential.
    ///
    /// # Errors
    /// Returns error if the write fails.
    async fn insert(&self, credential: &WebAuthnCredential) -> Result<()>;

    /// Fetch a credential scoped to its owner.
    async fn find(
        &self,
        credential_id: &[u8],
        user_id: Uuid,
    ) -> Result<Option<WebAuthnCredential>>;

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<WebAuthnCredential>>;

    /// Record a successful assertion: new sign count, backup state, and a
    /// fresh `last_used_at` stamp.
    async fn record_authentication(
        &self,
        credential_id: &[u8],
        user_id: Uuid,
        sign_count: i64,
        backed_up: bool,
    ) -> Result<()>;
}

pub struct PgCredentialRepo {
    pool: PgPool,
}

impl PgCredentialRepo {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialRepo for PgCredentialRepo {
    async fn insert(&self, credential: &WebAuthnCredential) -> Result<()> {
        let query = "INSERT INTO webauthn_credentials \
            (credential_id, user_id, public_key, sign_count, device_type, backed_up, transports, created_at) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&credential.credential_id)
            .bind(credential.user_id)
            .bind(&credential.public_key)
            .bind(credential.sign_count)
            .bind(&credential.device_type)
            .bind(credential.backed_up)
            .bind(&credential.transports)
            .bind(credential.created_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| {
                anyhow::Error::new(err)
                    .context("Failed to insert credential")
                    .into()
            })
            .map(|_| ())
    }

    async fn find(
        &self,
        credential_id: &[u8],
        user_id: Uuid,
    ) -> Result<Option<WebAuthnCredential>> {
        let query = "SELECT * FROM webauthn_credentials WHERE credential_id = $1 AND user_id = $2";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        sqlx::query_as::<_, WebAuthnCredential>(query)
            .bind(credential_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| {
                anyhow::Error::new(err)
                    .context("Failed to fetch credential")
                    .into()
            })
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<WebAuthnCredential>> {
        let query =
            "SELECT * FROM webauthn_credentials WHERE user_id = $1 ORDER BY created_at DESC";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        sqlx::query_as::<_, WebAuthnCredential>(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| {
                anyhow::Error::new(err)
                    .context("Failed to list credentials")
                    .into()
            })
    }

    async fn record_authentication(
        &self,
        credential_id: &[u8],
        user_id: Uuid,
        sign_count: i64,
        backed_up: bool,
    ) -> Result<()> {
        let query = "UPDATE webauthn_credentials \
            SET sign_count = $1, backed_up = $2, last_used_at = NOW() \
            WHERE credential_id = $3 AND user_id = $4";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(sign_count)
            .bind(backed_up)
            .bind(credential_id)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| {
                anyhow::Error::new(err)
                    .context("Failed to record credential usage")
                    .into()
            })
            .map(|_| ())
    }
}

/// In-process [`CredentialRepo`] used by tests and local dev.
#[derive(Default)]
pub struct MemoryCredentialRepo {
    credentials: Mutex<HashMap<Vec<u8>, WebAuthnCredential>>,
}

impl MemoryCredentialRepo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn credentials(&self) -> MutexGuard<'_, HashMap<Vec<u8>, WebAuthnCredential>> {
        self.credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CredentialRepo for MemoryCredentialRepo {
    async fn insert(&self, credential: &WebAuthnCredential) -> Result<()> {
        self.credentials()
            .insert(credential.credential_id.clone(), credential.clone());
        Ok(())
    }

    async fn find(
        &self,
        credential_id: &[u8],
        user_id: Uuid,
    ) -> Result<Option<WebAuthnCredential>> {
        Ok(self
            .credentials()
            .get(credential_id)
            .filter(|credential| credential.user_id == user_id)
            .cloned())
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<WebAuthnCredential>> {
        let mut credentials: Vec<WebAuthnCredential> = self
            .credentials()
            .values()
            .filter(|credential| credential.user_id == user_id)
            .cloned()
            .collect();
        credentials.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(credentials)
    }

    async fn record_authentication(
        &self,
        credential_id: &[u8],
        user_id: Uuid,
        sign_count: i64,
        backed_up: bool,
    ) -> Result<()> {
        let mut credentials = self.credentials();
        if let Some(credential) = credentials
            .get_mut(credential_id)
            .filter(|credential| credential.user_id == user_id)
        {
            credential.sign_count = sign_count;
            credential.backed_up = backed_up;
            credential.last_used_at = Some(chrono::Utc::now());
        }
        Ok(())
    }
}
