use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, FromRow, Row};
use uuid::Uuid;

/// A registered passkey. `public_key` holds the serialized passkey state from
/// the verification library; `sign_count` mirrors the authenticator counter
/// and only ever increases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebAuthnCredential {
    pub credential_id: Vec<u8>,
    pub user_id: Uuid,
    pub public_key: Vec<u8>,
    pub sign_count: i64,
    pub device_type: String,
    pub backed_up: bool,
    pub transports: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for WebAuthnCredential {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            credential_id: row.try_get("credential_id")?,
            user_id: row.try_get("user_id")?,
            public_key: row.try_get("public_key")?,
            sign_count: row.try_get("sign_count")?,
            device_type: row.try_get("device_type")?,
            backed_up: row.try_get("backed_up")?,
            transports: row.try_get("transports")?,
            created_at: row.try_get("created_at")?,
            last_used_at: row.try_get("last_used_at")?,
        })
    }
}
