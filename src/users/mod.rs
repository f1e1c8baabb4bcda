//! User accounts.
//!
//! Accounts are created exclusively by a completed register flow; there is no
//! standalone "create user" entry point. Email uniqueness is enforced by the
//! store and surfaces as `InvalidInput` so callers can report it like any
//! other bad request.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, FromRow, PgPool, Row};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for User {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            display_name: row.try_get("display_name")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
pub trait UserRepo: Send + Sync {
    /// Persist a new account.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the email is already registered.
    async fn insert(&self, user: &User) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>>;

    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Remove an account. Missing ids are fine.
    async fn delete(&self, id: Uuid) -> Result<()>;
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

pub struct PgUserRepo {
    pool: PgPool,
}

impl PgUserRepo {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepo for PgUserRepo {
    async fn insert(&self, user: &User) -> Result<()> {
        let query = "INSERT INTO users (id, email, display_name, created_at) VALUES ($1, $2, $3, $4)";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        match sqlx::query(query)
            .bind(user.id)
            .bind(&user.email)
            .bind(&user.display_name)
            .bind(user.created_at)
            .execute(&self.pool)
            .instrument(span)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(Error::invalid("email already registered"))
            }
            Err(err) => Err(anyhow::Error::new(err)
                .context("Failed to insert user")
                .into()),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let query = "SELECT * FROM users WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        sqlx::query_as::<_, User>(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| anyhow::Error::new(err).context("Failed to fetch user").into())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let query = "SELECT * FROM users WHERE email = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        sqlx::query_as::<_, User>(query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| {
                anyhow::Error::new(err)
                    .context("Failed to fetch user by email")
                    .into()
            })
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let query = "DELETE FROM users WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| {
                anyhow::Error::new(err)
                    .context("Failed to delete user")
                    .into()
            })
            .map(|_| ())
    }
}

/// In-process [`UserRepo`] used by tests and local dev.
#[derive(Default)]
pub struct MemoryUserRepo {
    users: Mutex<HashMap<Uuid, User>>,
}

impl MemoryUserRepo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn users(&self) -> MutexGuard<'_, HashMap<Uuid, User>> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl UserRepo for MemoryUserRepo {
    async fn insert(&self, user: &User) -> Result<()> {
        let mut users = self.users();
        if users.values().any(|existing| existing.email == user.email) {
            return Err(Error::invalid("email already registered"));
        }
        users.insert(user.id, user.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.users().get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .users()
            .values()
            .find(|user| user.email == email)
            .cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.users().remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryUserRepo, User, UserRepo};
    use crate::error::Error;
    use anyhow::Result;
    use chrono::Utc;
    use uuid::Uuid;

    fn user(email: &str) -> User {
        User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            display_name: email.to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_and_lookup() -> Result<()> {
        let repo = MemoryUserRepo::new();
        let alice = user("alice@example.com");
        repo.insert(&alice).await?;

        let by_id = repo.find_by_id(alice.id).await?;
        assert_eq!(by_id.map(|u| u.email), Some(alice.email.clone()));

        let by_email = repo.find_by_email("alice@example.com").await?;
        assert_eq!(by_email.map(|u| u.id), Some(alice.id));
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_email_is_invalid_input() -> Result<()> {
        let repo = MemoryUserRepo::new();
        repo.insert(&user("bob@example.com")).await?;

        let err = repo.insert(&user("bob@example.com")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        Ok(())
    }

    #[tokio::test]
    async fn delete_releases_the_email() -> Result<()> {
        let repo = MemoryUserRepo::new();
        let erin = user("erin@example.com");
        repo.insert(&erin).await?;

        repo.delete(erin.id).await?;
        assert!(repo.find_by_id(erin.id).await?.is_none());

        repo.insert(&user("erin@example.com")).await?;
        repo.delete(erin.id).await?;
        Ok(())
    }
}
