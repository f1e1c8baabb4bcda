use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::register::models::{RegisterFlow, RegisterStep};

#[async_trait]
pub trait FlowRepo: Send + Sync {
    async fn insert(&self, flow: &RegisterFlow) -> Result<()>;

    /// Fetch a live flow. Expired flows read as absent.
    async fn find(&self, id: Uuid) -> Result<Option<RegisterFlow>>;

    /// Conditional step transition: only applies when the flow is live and
    /// currently at `from`. Returns whether the transition happened.
    async fn advance_step(&self, id: Uuid, from: RegisterStep, to: RegisterStep) -> Result<bool>;

    /// Attach a fresh code hash, superseding any previous one.
    async fn set_code(
        &self,
        id: Uuid,
        code_hash: &[u8],
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Drop the live code after a successful verify.
    async fn clear_code(&self, id: Uuid) -> Result<()>;

    /// Remove a flow. Missing flows are fine.
    async fn delete(&self, id: Uuid) -> Result<()>;
}

pub struct PgFlowRepo {
    pool: PgPool,
}

impl PgFlowRepo {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FlowRepo for PgFlowRepo {
    async fn insert(&self, flow: &RegisterFlow) -> Result<()> {
        let query = "INSERT INTO register_flows \
            (id, email, step, code_hash, code_issued_at, code_expires_at, ip_address, user_agent, expires_at, created_at) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(flow.id)
            .bind(&flow.email)
            .bind(flow.step.as_str())
            .bind(&flow.code_hash)
            .bind(flow.code_issued_at)
            .bind(flow.code_expires_at)
            .bind(&flow.ip_address)
            .bind(&flow.user_agent)
            .bind(flow.expires_at)
            .bind(flow.created_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| {
                anyhow::Error::new(err)
                    .context("Failed to insert register flow")
                    .into()
            })
            .map(|_| ())
    }

    async fn find(&self, id: Uuid) -> Result<Option<RegisterFlow>> {
        let query = "SELECT * FROM register_flows WHERE id = $1 AND expires_at > NOW()";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        sqlx::query_as::<_, RegisterFlow>(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| {
                anyhow::Error::new(err)
                    .context("Failed to fetch register flow")
                    .into()
            })
    }

    async fn advance_step(&self, id: Uuid, from: RegisterStep, to: RegisterStep) -> Result<bool> {
        let query = "UPDATE register_flows SET step = $1 \
            WHERE id = $2 AND step = $3 AND expires_at > NOW()";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(to.as_str())
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| anyhow::Error::new(err).context("Failed to advance register flow"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_code(
        &self,
        id: Uuid,
        code_hash: &[u8],
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let query = "UPDATE register_flows \
            SET code_hash = $1, code_issued_at = $2, code_expires_at = $3 WHERE id = $4";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(code_hash)
            .bind(issued_at)
            .bind(expires_at)
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| {
                anyhow::Error::new(err)
                    .context("Failed to set verification code")
                    .into()
            })
            .map(|_| ())
    }

    async fn clear_code(&self, id: Uuid) -> Result<()> {
        let query = "UPDATE register_flows \
            SET code_hash = NULL, code_issued_at = NULL, code_expires_at = NULL WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| {
                anyhow::Error::new(err)
                    .context("Failed to clear verification code")
                    .into()
            })
            .map(|_| ())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let query = "DELETE FROM register_flows WHERE id = $1";
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
                    .context("Failed to delete register flow")
                    .into()
            })
            .map(|_| ())
    }
}

/// In-process [`FlowRepo`] used by tests and local dev.
#[derive(Default)]
pub struct MemoryFlowRepo {
    flows: Mutex<HashMap<Uuid, RegisterFlow>>,
}

impl MemoryFlowRepo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn flows(&self) -> MutexGuard<'_, HashMap<Uuid, RegisterFlow>> {
        self.flows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl FlowRepo for MemoryFlowRepo {
    async fn insert(&self, flow: &RegisterFlow) -> Result<()> {
        self.flows().insert(flow.id, flow.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<RegisterFlow>> {
        let now = Utc::now();
        Ok(self
            .flows()
            .get(&id)
            .filter(|flow| !flow.is_expired(now))
            .cloned())
    }

    async fn advance_step(&self, id: Uuid, from: RegisterStep, to: RegisterStep) -> Result<bool> {
        let now = Utc::now();
        let mut flows = self.flows();
        match flows.get_mut(&id) {
            Some(flow) if !flow.is_expired(now) && flow.step == from => {
                flow.step = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_code(
        &self,
        id: Uuid,
        code_hash: &[u8],
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(flow) = self.flows().get_mut(&id) {
            flow.code_hash = Some(code_hash.to_vec());
            flow.code_issued_at = Some(issued_at);
            flow.code_expires_at = Some(expires_at);
        }
        Ok(())
    }

    async fn clear_code(&self, id: Uuid) -> Result<()> {
        if let Some(flow) = self.flows().get_mut(&id) {
            flow.code_hash = None;
            flow.code_issued_at = None;
            flow.code_expires_at = None;
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.flows().remove(&id);
        Ok(())
    }
}
