use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, FromRow, Row};
use std::str::FromStr;
use uuid::Uuid;

/// Forward-only flow position. The derived ordering is the transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RegisterStep {
    EmailVerification,
    WebauthnStart,
    WebauthnFinish,
}

impl RegisterStep {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmailVerification => "email_verification",
            Self::WebauthnStart => "webauthn_start",
            Self::WebauthnFinish => "webauthn_finish",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown register step: {0}")]
pub struct UnknownStep(String);

impl FromStr for RegisterStep {
    type Err = UnknownStep;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "email_verification" => Ok(Self::EmailVerification),
            "webauthn_start" => Ok(Self::WebauthnStart),
            "webauthn_finish" => Ok(Self::WebauthnFinish),
            other => Err(UnknownStep(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterFlow {
    pub id: Uuid,
    pub email: String,
    pub step: RegisterStep,
    pub code_hash: Option<Vec<u8>>,
    pub code_issued_at: Option<DateTime<Utc>>,
    pub code_expires_at: Option<DateTime<Utc>>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl RegisterFlow {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl<'r> FromRow<'r, PgRow> for RegisterFlow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let step: String = row.try_get("step")?;
        let step = step.parse().map_err(|err| sqlx::Error::ColumnDecode {
            index: "step".to_string(),
            source: Box::new(err),
        })?;
        Ok(Self {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            step,
            code_hash: row.try_get("code_hash")?,
            code_issued_at: row.try_get("code_issued_at")?,
            code_expires_at: row.try_get("code_expires_at")?,
            ip_address: row.try_get("ip_address")?,
            user_agent: row.try_get("user_agent")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::RegisterStep;

    #[test]
    fn steps_order_forward() {
        assert!(RegisterStep::EmailVerification < RegisterStep::WebauthnStart);
        assert!(RegisterStep::WebauthnStart < RegisterStep::WebauthnFinish);
    }

    #[test]
    fn step_names_round_trip() {
        for step in [
            RegisterStep::EmailVerification,
            RegisterStep::WebauthnStart,
            RegisterStep::WebauthnFinish,
        ] {
            assert_eq!(step.as_str().parse::<RegisterStep>().unwrap(), step);
        }
        assert!("finished".parse::<RegisterStep>().is_err());
    }
}
