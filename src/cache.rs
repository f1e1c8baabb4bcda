//! Ephemeral key/value collaborator.
//!
//! Challenges, token mappings, revocation sets, and other short-lived state
//! live behind the [`Cache`] trait: plain string values with an optional TTL
//! plus set-membership operations for bulk revocation. The shipped
//! [`MemoryCache`] keeps everything in mutex-guarded maps and prunes expired
//! entries on access; a Redis-backed implementation is a drop-in for
//! multi-instance deployments.
//!
//! Every operation is atomic per key. Callers that need check-and-delete
//! (single-use challenges) issue a `get` followed by a `delete`; a losing
//! race surfaces as a missing key, never as corrupt state.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::Result;

#[async_trait]
pub trait Cache: Send + Sync {
    /// Store a value without expiry (kept until deleted).
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Store a value that disappears after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Fetch a value; expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete a key of any kind (value or set). Missing keys are fine.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Add a member to a set, creating the set if needed.
    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    /// Remove a member from a set. Missing members are fine.
    async fn srem(&self, key: &str, member: &str) -> Result<()>;

    /// Enumerate a set; a missing set reads as empty.
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
}

struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// In-process [`Cache`] used by tests and single-instance deployments.
#[derive(Default)]
pub struct MemoryCache {
    values: Mutex<HashMap<String, ValueEntry>>,
    sets: Mutex<HashMap<String, HashSet<String>>>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> MutexGuard<'_, HashMap<String, ValueEntry>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sets(&self) -> MutexGuard<'_, HashMap<String, HashSet<String>>> {
        self.sets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.values().insert(
            key.to_string(),
            ValueEntry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut values = self.values();
        values.retain(|_, entry| !entry.is_expired(now));
        values.insert(
            key.to_string(),
            ValueEntry {
                value,
                expires_at: Some(now + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut values = self.values();
        if values.get(key).is_some_and(|entry| entry.is_expired(now)) {
            values.remove(key);
        }
        Ok(values.get(key).map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values().remove(key);
        self.sets().remove(key);
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.sets()
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut sets = self.sets();
        if let Some(set) = sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                sets.remove(key);
            }
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .sets()
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::{Cache, MemoryCache};
    use anyhow::Result;
    use std::time::Duration;

    #[tokio::test]
    async fn values_round_trip_and_delete() -> Result<()> {
        let cache = MemoryCache::new();
        cache.set("k", "v".to_string()).await?;
        assert_eq!(cache.get("k").await?.as_deref(), Some("v"));

        cache.delete("k").await?;
        assert_eq!(cache.get("k").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn ttl_entries_expire() -> Result<()> {
        let cache = MemoryCache::new();
        cache
            .set_with_ttl("k", "v".to_string(), Duration::from_millis(20))
            .await?;
        assert_eq!(cache.get("k").await?.as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("k").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn sets_track_membership() -> Result<()> {
        let cache = MemoryCache::new();
        cache.sadd("s", "a").await?;
        cache.sadd("s", "b").await?;
        cache.sadd("s", "a").await?;

        let mut members = cache.smembers("s").await?;
        members.sort();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);

        cache.srem("s", "a").await?;
        assert_eq!(cache.smembers("s").await?, vec!["b".to_string()]);

        cache.delete("s").await?;
        assert!(cache.smembers("s").await?.is_empty());
        Ok(())
    }
}
