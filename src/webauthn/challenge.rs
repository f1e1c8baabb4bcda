//! Ephemeral challenge → pending-user mapping.
//!
//! A challenge is stored keyed by its own base64url value together with the
//! serialized ceremony state and the identifier of the user the ceremony is
//! for. Entries expire after five minutes and are single-use: `take` removes
//! the entry, so a second verification attempt with the same challenge sees
//! nothing. A losing check-and-delete race re-fails verification, never
//! corrupts state.

use anyhow::Context;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cache::Cache;
use crate::error::Result;

const DEFAULT_CHALLENGE_TTL: Duration = Duration::from_secs(300);

#[derive(Serialize, Deserialize)]
struct StoredCeremony {
    user_id: Uuid,
    state: serde_json::Value,
}

#[derive(Clone)]
pub struct ChallengeStore {
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl ChallengeStore {
    #[must_use]
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            cache,
            ttl: DEFAULT_CHALLENGE_TTL,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn key(kind: &str, challenge: &str) -> String {
        format!("webauthn:{kind}:{challenge}")
    }

    /// Park a ceremony under its challenge.
    ///
    /// # Errors
    /// Returns `Unexpected` if the state cannot be serialized or stored.
    pub async fn put<S: Serialize>(
        &self,
        kind: &str,
        challenge: &str,
        user_id: Uuid,
        state: &S,
    ) -> Result<()> {
        let stored = StoredCeremony {
            user_id,
            state: serde_json::to_value(state).context("Failed to serialize ceremony state")?,
        };
        let value = serde_json::to_string(&stored).context("Failed to encode ceremony entry")?;
        self.cache
            .set_with_ttl(&Self::key(kind, challenge), value, self.ttl)
            .await
    }

    /// Claim a ceremony, removing it. Absent or expired challenges read as
    /// `None`.
    ///
    /// # Errors
    /// Returns `Unexpected` if a present entry cannot be decoded.
    pub async fn take<S: DeserializeOwned>(
        &self,
        kind: &str,
        challenge: &str,
    ) -> Result<Option<(Uuid, S)>> {
        let key = Self::key(kind, challenge);
        let Some(value) = self.cache.get(&key).await? else {
            return Ok(None);
        };
        self.cache.delete(&key).await?;

        let stored: StoredCeremony =
            serde_json::from_str(&value).context("Failed to decode ceremony entry")?;
        let state =
            serde_json::from_value(stored.state).context("Failed to decode ceremony state")?;
        Ok(Some((stored.user_id, state)))
    }
}

#[cfg(test)]
mod tests {
    use super::ChallengeStore;
    use crate::cache::MemoryCache;
    use anyhow::Result;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct FakeState {
        nonce: u32,
    }

    #[tokio::test]
    async fn challenges_are_single_use() -> Result<()> {
        let store = ChallengeStore::new(Arc::new(MemoryCache::new()));
        let user_id = Uuid::new_v4();
        store
            .put("register", "abc123", user_id, &FakeState { nonce: 7 })
            .await?;

        let taken = store.take::<FakeState>("register", "abc123").await?;
        assert_eq!(taken, Some((user_id, FakeState { nonce: 7 })));

        let again = store.take::<FakeState>("register", "abc123").await?;
        assert_eq!(again, None);
        Ok(())
    }

    #[tokio::test]
    async fn kinds_do_not_collide() -> Result<()> {
        let store = ChallengeStore::new(Arc::new(MemoryCache::new()));
        store
            .put("register", "abc", Uuid::new_v4(), &FakeState { nonce: 1 })
            .await?;

        assert_eq!(store.take::<FakeState>("auth", "abc").await?, None);
        assert!(store.take::<FakeState>("register", "abc").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn expired_challenges_read_as_absent() -> Result<()> {
        let store = ChallengeStore::new(Arc::new(MemoryCache::new()))
            .with_ttl(Duration::from_millis(20));
        store
            .put("auth", "xyz", Uuid::new_v4(), &FakeState { nonce: 2 })
            .await?;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.take::<FakeState>("auth", "xyz").await?, None);
        Ok(())
    }
}
