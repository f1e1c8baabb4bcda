use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, FromRow, Row};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub ip_address: Option<String>,
    pub location: String,
    pub device: Option<String>,
    pub logged_out_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl UserSession {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.logged_out_at.is_none()
    }
}

impl<'r> FromRow<'r, PgRow> for UserSession {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            ip_address: row.try_get("ip_address")?,
            location: row.try_get("location")?,
            device: row.try_get("device")?,
            logged_out_at: row.try_get("logged_out_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}
