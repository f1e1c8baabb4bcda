//! Opaque bearer tokens.
//!
//! A token is 32 random bytes shown to the caller exactly once as a base64url
//! string. The store only ever sees the SHA-256 of that string, so a cache
//! compromise yields no usable bearer tokens. Each user carries a revocation
//! set of their token hashes for "logout everywhere". Tokens have no implicit
//! TTL; their lifetime ends only on explicit revocation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use anyhow::Context;

use crate::cache::Cache;
use crate::error::{Error, Result};

const TOKEN_BYTES: usize = 32;

/// What a resolved token stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub user_id: Uuid,
    pub session_id: Uuid,
}

#[derive(Clone)]
pub struct TokenStore {
    cache: Arc<dyn Cache>,
}

impl TokenStore {
    #[must_use]
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    fn token_key(token_hash: &str) -> String {
        format!("token:{token_hash}")
    }

    fn user_set_key(user_id: Uuid) -> String {
        format!("user:{user_id}:tokens")
    }

    /// Mint a token for a (user, session) pair and return the raw string.
    /// The raw token is never stored.
    ///
    /// # Errors
    /// Returns `Unexpected` if the cache write fails.
    pub async fn issue(&self, user_id: Uuid, session_id: Uuid) -> Result<String> {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);
        let token_hash = hash_token(&token);

        let claims = TokenClaims {
            user_id,
            session_id,
        };
        let value = serde_json::to_string(&claims).context("Failed to encode token claims")?;

        self.cache.set(&Self::token_key(&token_hash), value).await?;
        self.cache
            .sadd(&Self::user_set_key(user_id), &token_hash)
            .await?;

        Ok(token)
    }

    /// Map a raw token back to its claims.
    ///
    /// # Errors
    /// Returns `Unauthenticated` if the token is unknown or revoked.
    pub async fn resolve(&self, token: &str) -> Result<TokenClaims> {
        let token_hash = hash_token(token);
        let Some(value) = self.cache.get(&Self::token_key(&token_hash)).await? else {
            return Err(Error::Unauthenticated);
        };
        let claims = serde_json::from_str(&value).context("Failed to decode token claims")?;
        Ok(claims)
    }

    /// Revoke a single token. Idempotent.
    ///
    /// # Errors
    /// Returns `Unexpected` if the cache write fails.
    pub async fn revoke(&self, token: &str, user_id: Uuid) -> Result<()> {
        let token_hash = hash_token(token);
        self.cache.delete(&Self::token_key(&token_hash)).await?;
        self.cache
            .srem(&Self::user_set_key(user_id), &token_hash)
            .await?;
        Ok(())
    }

    /// Revoke every token a user holds: enumerate the revocation set, delete
    /// each mapping, then clear the set. A token issued concurrently may or
    /// may not be caught.
    ///
    /// # Errors
    /// Returns `Unexpected` if a cache operation fails.
    pub async fn revoke_all(&self, user_id: Uuid) -> Result<()> {
        let set_key = Self::user_set_key(user_id);
        for token_hash in self.cache.smembers(&set_key).await? {
            self.cache.delete(&Self::token_key(&token_hash)).await?;
        }
        self.cache.delete(&set_key).await?;
        Ok(())
    }
}

fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::{hash_token, TokenClaims, TokenStore};
    use crate::cache::MemoryCache;
    use crate::error::Error;
    use anyhow::Result;
    use std::sync::Arc;
    use uuid::Uuid;

    fn store() -> TokenStore {
        TokenStore::new(Arc::new(MemoryCache::new()))
    }

    #[test]
    fn hashes_are_stable_and_token_free() {
        let hash = hash_token("some-token");
        assert_eq!(hash, hash_token("some-token"));
        assert_ne!(hash, hash_token("other-token"));
        assert!(!hash.contains("some-token"));
    }

    #[tokio::test]
    async fn issue_then_resolve_round_trips() -> Result<()> {
        let store = store();
        let user_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();

        let token = store.issue(user_id, session_id).await?;
        let claims = store.resolve(&token).await?;
        assert_eq!(
            claims,
            TokenClaims {
                user_id,
                session_id
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn resolve_after_revoke_is_unauthenticated() -> Result<()> {
        let store = store();
        let user_id = Uuid::new_v4();
        let token = store.issue(user_id, Uuid::new_v4()).await?;

        store.revoke(&token, user_id).await?;
        assert!(matches!(
            store.resolve(&token).await,
            Err(Error::Unauthenticated)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn revoke_all_kills_every_token() -> Result<()> {
        let store = store();
        let user_id = Uuid::new_v4();
        let first = store.issue(user_id, Uuid::new_v4()).await?;
        let second = store.issue(user_id, Uuid::new_v4()).await?;
        let other_user = Uuid::new_v4();
        let unrelated = store.issue(other_user, Uuid::new_v4()).await?;

        store.revoke_all(user_id).await?;
        assert!(matches!(
            store.resolve(&first).await,
            Err(Error::Unauthenticated)
        ));
        assert!(matches!(
            store.resolve(&second).await,
            Err(Error::Unauthenticated)
        ));
        assert!(store.resolve(&unrelated).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_token_is_unauthenticated() {
        let store = store();
        assert!(matches!(
            store.resolve("never-issued").await,
            Err(Error::Unauthenticated)
        ));
    }
}
