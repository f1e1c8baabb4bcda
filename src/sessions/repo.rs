use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::sessions::models::UserSession;

#[async_trait]
pub trait SessionRepo: Send + Sync {
    async fn insert(&self, session: &UserSession) -> Result<()>;

    /// All sessions for a user, most recent first.
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<UserSession>>;

    /// Soft logout. Returns false if the session does not exist.
    async fn mark_logged_out(&self, session_id: Uuid) -> Result<bool>;

    /// Hard delete, scoped to the owner. Returns false if nothing matched.
    async fn delete(&self, session_id: Uuid, user_id: Uuid) -> Result<bool>;

    /// Soft-logout every session for a user.
    async fn mark_all_logged_out(&self, user_id: Uuid) -> Result<()>;

    /// Whether the user has ever logged in from this device string.
    async fn has_device(&self, user_id: Uuid, device: &str) -> Result<bool>;
}

pub struct PgSessionRepo {
    pool: PgPool,
}

impl PgSessionRepo {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionRepo for PgSessionRepo {
    async fn insert(&self, session: &UserSession) -> Result<()> {
        let query = "INSERT INTO user_sessions \
            (id, user_id, ip_address, location, device, logged_out_at, created_at) \
            VALUES ($1, $2, $3, $4, $5, $6, $7)";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(session.id)
            .bind(session.user_id)
            .bind(&session.ip_address)
            .bind(&session.location)
            .bind(&session.device)
            .bind(session.logged_out_at)
            .bind(session.created_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| {
                anyhow::Error::new(err)
                    .context("Failed to insert session")
                    .into()
            })
            .map(|_| ())
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<UserSession>> {
        let query = "SELECT * FROM user_sessions WHERE user_id = $1 ORDER BY created_at DESC";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        sqlx::query_as::<_, UserSession>(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| {
                anyhow::Error::new(err)
                    .context("Failed to list sessions")
                    .into()
            })
    }

    async fn mark_logged_out(&self, session_id: Uuid) -> Result<bool> {
        let query = "UPDATE user_sessions SET logged_out_at = NOW() \
            WHERE id = $1 AND logged_out_at IS NULL";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(session_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| anyhow::Error::new(err).context("Failed to mark session logged out"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, session_id: Uuid, user_id: Uuid) -> Result<bool> {
        let query = "DELETE FROM user_sessions WHERE id = $1 AND user_id = $2";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(session_id)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| anyhow::Error::new(err).context("Failed to delete session"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_all_logged_out(&self, user_id: Uuid) -> Result<()> {
        let query = "UPDATE user_sessions SET logged_out_at = NOW() \
            WHERE user_id = $1 AND logged_out_at IS NULL";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| {
                anyhow::Error::new(err)
                    .context("Failed to mark sessions logged out")
                    .into()
            })
            .map(|_| ())
    }

    async fn has_device(&self, user_id: Uuid, device: &str) -> Result<bool> {
        let query = "SELECT EXISTS(SELECT 1 FROM user_sessions WHERE user_id = $1 AND device = $2)";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let exists: (bool,) = sqlx::query_as(query)
            .bind(user_id)
            .bind(device)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| anyhow::Error::new(err).context("Failed to probe device history"))?;
        Ok(exists.0)
    }
}

/// In-process [`SessionRepo`] used by tests and local dev.
#[derive(Default)]
pub struct MemorySessionRepo {
    sessions: Mutex<HashMap<Uuid, UserSession>>,
}

impl MemorySessionRepo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<Uuid, UserSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SessionRepo for MemorySessionRepo {
    async fn insert(&self, session: &UserSession) -> Result<()> {
        self.sessions().insert(session.id, session.clone());
        Ok(())
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<UserSession>> {
        let mut sessions: Vec<UserSession> = self
            .sessions()
            .values()
            .filter(|session| session.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn mark_logged_out(&self, session_id: Uuid) -> Result<bool> {
        let mut sessions = self.sessions();
        match sessions.get_mut(&session_id) {
            Some(session) if session.logged_out_at.is_none() => {
                session.logged_out_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, session_id: Uuid, user_id: Uuid) -> Result<bool> {
        let mut sessions = self.sessions();
        let matched = sessions
            .get(&session_id)
            .is_some_and(|session| session.user_id == user_id);
        if matched {
            sessions.remove(&session_id);
        }
        Ok(matched)
    }

    async fn mark_all_logged_out(&self, user_id: Uuid) -> Result<()> {
        let now = Utc::now();
        for session in self.sessions().values_mut() {
            if session.user_id == user_id && session.logged_out_at.is_none() {
                session.logged_out_at = Some(now);
            }
        }
        Ok(())
    }

    async fn has_device(&self, user_id: Uuid, device: &str) -> Result<bool> {
        Ok(self
            .sessions()
            .values()
            .any(|session| session.user_id == user_id && session.device.as_deref() == Some(device)))
    }
}
