use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::email::{EmailMessage, EmailSender};
use crate::error::{Error, Result};
use crate::geoip::GeoIpResolver;
use crate::sessions::models::UserSession;
use crate::sessions::repo::SessionRepo;
use crate::users::UserRepo;

const NEW_DEVICE_TEMPLATE: &str = "new_device";

#[derive(Clone)]
pub struct SessionStore {
    repo: Arc<dyn SessionRepo>,
    users: Arc<dyn UserRepo>,
    geoip: Arc<dyn GeoIpResolver>,
    email: Arc<dyn EmailSender>,
}

impl SessionStore {
    #[must_use]
    pub fn new(
        repo: Arc<dyn SessionRepo>,
        users: Arc<dyn UserRepo>,
        geoip: Arc<dyn GeoIpResolver>,
        email: Arc<dyn EmailSender>,
    ) -> Self {
        Self {
            repo,
            users,
            geoip,
            email,
        }
    }

    /// Record a login. Device novelty is evaluated before the row is written
    /// so the new session cannot mask itself, and a first-seen device fires a
    /// security notification. Email delivery never blocks the success path.
    ///
    /// # Errors
    /// Returns `Unexpected` if the write fails.
    pub async fn create(
        &self,
        user_id: Uuid,
        ip: Option<&str>,
        device: Option<&str>,
    ) -> Result<UserSession> {
        let location = self.geoip.location_or_unknown(ip);

        if let Some(device) = device {
            if !self.repo.has_device(user_id, device).await? {
                self.notify_new_device(user_id, device, &location).await;
            }
        }

        let session = UserSession {
            id: Uuid::new_v4(),
            user_id,
            ip_address: ip.map(ToString::to_string),
            location,
            device: device.map(ToString::to_string),
            logged_out_at: None,
            created_at: Utc::now(),
        };
        self.repo.insert(&session).await?;
        Ok(session)
    }

    /// Whether the user has logged in from this device string before.
    ///
    /// # Errors
    /// Returns `Unexpected` if the lookup fails.
    pub async fn has_device_before(&self, user_id: Uuid, device: &str) -> Result<bool> {
        self.repo.has_device(user_id, device).await
    }

    /// All sessions for a user, most recent first.
    ///
    /// # Errors
    /// Returns `Unexpected` if the lookup fails.
    pub async fn list_all(&self, user_id: Uuid) -> Result<Vec<UserSession>> {
        self.repo.list_for_user(user_id).await
    }

    /// Soft logout: stamp `logged_out_at`, keep the row for history.
    ///
    /// # Errors
    /// Returns `NotFound` if there is no active session with this id.
    pub async fn mark_logged_out(&self, session_id: Uuid) -> Result<()> {
        if self.repo.mark_logged_out(session_id).await? {
            Ok(())
        } else {
            Err(Error::NotFound("session"))
        }
    }

    /// Hard logout: remove the row, scoped to the owner.
    ///
    /// # Errors
    /// Returns `NotFound` if the session does not exist for this user.
    pub async fn delete(&self, session_id: Uuid, user_id: Uuid) -> Result<()> {
        if self.repo.delete(session_id, user_id).await? {
            Ok(())
        } else {
            Err(Error::NotFound("session"))
        }
    }

    /// Soft-logout every session; pairs with token revocation.
    ///
    /// # Errors
    /// Returns `Unexpected` if the write fails.
    pub async fn logout_all(&self, user_id: Uuid) -> Result<()> {
        self.repo.mark_all_logged_out(user_id).await
    }

    async fn notify_new_device(&self, user_id: Uuid, device: &str, location: &str) {
        let recipient = match self.users.find_by_id(user_id).await {
            Ok(Some(user)) => user.email,
            Ok(None) => return,
            Err(err) => {
                warn!(%user_id, "Failed to look up user for new device notification: {err}");
                return;
            }
        };
        let message = EmailMessage::new(
            NEW_DEVICE_TEMPLATE,
            &recipient,
            json!({ "device": device, "location": location }),
        );
        if let Err(err) = self.email.send(&message) {
            warn!(%user_id, "Failed to send new device notification: {err}");
        }
    }
}
