//! Refresh credential persistence.
//!
//! Only the SHA-512 digest of a refresh secret is ever stored or compared.
//! The plaintext leaves the process once, in the response that issued it.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64ct::{Base64, Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha512};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use uuid::Uuid;

pub const REFRESH_SECRET_BYTES: usize = 64;
pub const DEFAULT_REFRESH_TTL_DAYS: i64 = 7;
pub const MAX_REFRESH_TTL_DAYS: i64 = 365;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
}

impl RefreshToken {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.is_active_at(Utc::now())
    }

    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at > now
    }
}

/// Storage seam for refresh credential records.
///
/// Every mutation is a single-record (or single-statement) update.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn insert(&self, record: &RefreshToken) -> Result<()>;

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>>;

    /// Mark one record revoked. Returns `false` when it was already revoked or missing.
    async fn revoke(&self, id: Uuid) -> Result<bool>;

    /// Revoke every active record owned by `user_id`, returning how many changed.
    async fn revoke_all_active_for(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<u64>;

    async fn active_for(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Vec<RefreshToken>>;

    /// Delete expired or revoked records.
    async fn purge_inactive(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Generate a new refresh secret from the OS CSPRNG.
///
/// # Errors
/// Returns an error if the random source fails.
pub fn generate_refresh_secret() -> Result<String> {
    let mut bytes = [0u8; REFRESH_SECRET_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate refresh token")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// SHA-512 digest of `value`, standard base64.
#[must_use]
pub fn sha512_b64(value: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(value.as_bytes());
    Base64::encode_string(&hasher.finalize())
}

#[must_use]
pub fn hash_refresh_secret(secret: &str) -> String {
    sha512_b64(secret)
}

/// Expiry of a refresh credential issued at `now`.
///
/// # Errors
/// Returns an error if `ttl_days` is outside `1..=MAX_REFRESH_TTL_DAYS`.
pub fn refresh_expiry(now: DateTime<Utc>, ttl_days: i64) -> Result<DateTime<Utc>> {
    if !(1..=MAX_REFRESH_TTL_DAYS).contains(&ttl_days) {
        bail!("refresh token lifetime of {ttl_days} days is out of range");
    }
    Duration::try_days(ttl_days)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .context("refresh token expiry overflows")
}

/// Refresh credential operations used by the session service.
#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn RefreshTokenStore>,
    ttl_days: i64,
}

impl CredentialStore {
    #[must_use]
    pub fn new(store: Arc<dyn RefreshTokenStore>, ttl_days: i64) -> Self {
        Self { store, ttl_days }
    }

    pub(crate) fn backend(&self) -> Arc<dyn RefreshTokenStore> {
        Arc::clone(&self.store)
    }

    /// Issue a refresh credential for `user_id`, returning the plaintext
    /// secret alongside the persisted record.
    ///
    /// # Errors
    /// Returns an error if the configured lifetime is out of range, or if
    /// secret generation or persistence fails.
    pub async fn create(&self, user_id: Uuid) -> Result<(String, RefreshToken)> {
        let now = Utc::now();
        let expires_at = refresh_expiry(now, self.ttl_days)?;
        let secret = generate_refresh_secret()?;
        let record = RefreshToken {
            id: Uuid::new_v4(),
            user_id,
            token_hash: hash_refresh_secret(&secret),
            expires_at,
            created_at: now,
            revoked: false,
        };
        self.store
            .insert(&record)
            .await
            .context("failed to store refresh token")?;
        Ok((secret, record))
    }

    /// # Errors
    /// Returns an error if the lookup fails.
    pub async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>> {
        self.store.find_by_hash(token_hash).await
    }

    /// Hash `secret` and look it up.
    ///
    /// # Errors
    /// Returns an error if the lookup fails.
    pub async fn find_by_secret(&self, secret: &str) -> Result<Option<RefreshToken>> {
        self.find_by_hash(&hash_refresh_secret(secret)).await
    }

    /// # Errors
    /// Returns an error if the update fails.
    pub async fn revoke(&self, record: &RefreshToken) -> Result<bool> {
        self.store
            .revoke(record.id)
            .await
            .context("failed to revoke refresh token")
    }

    /// # Errors
    /// Returns an error if the update fails.
    pub async fn revoke_all_active_for(&self, user_id: Uuid) -> Result<u64> {
        self.store
            .revoke_all_active_for(user_id, Utc::now())
            .await
            .context("failed to revoke refresh tokens")
    }

    /// # Errors
    /// Returns an error if the lookup fails.
    pub async fn active_for(&self, user_id: Uuid) -> Result<Vec<RefreshToken>> {
        self.store.active_for(user_id, Utc::now()).await
    }

    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn purge_inactive(&self) -> Result<u64> {
        self.store
            .purge_inactive(Utc::now())
            .await
            .context("failed to purge refresh tokens")
    }

    #[must_use]
    pub fn is_active(&self, record: &RefreshToken) -> bool {
        record.is_active()
    }
}

/// Process-local store for development and tests.
#[derive(Debug, Default)]
pub struct MemoryRefreshTokenStore {
    records: Mutex<HashMap<Uuid, RefreshToken>>,
}

impl MemoryRefreshTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryRefreshTokenStore {
    async fn insert(&self, record: &RefreshToken) -> Result<()> {
        let mut records = self.records.lock().await;
        if records
            .values()
            .any(|existing| existing.token_hash == record.token_hash)
        {
            anyhow::bail!("duplicate refresh token hash");
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .find(|record| record.token_hash == token_hash)
            .cloned())
    }

    async fn revoke(&self, id: Uuid) -> Result<bool> {
        let mut records = self.records.lock().await;
        Ok(match records.get_mut(&id) {
            Some(record) if !record.revoked => {
                record.revoked = true;
                true
            }
            _ => false,
        })
    }

    async fn revoke_all_active_for(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.lock().await;
        let mut revoked = 0;
        for record in records.values_mut() {
            if record.user_id == user_id && record.is_active_at(now) {
                record.revoked = true;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn active_for(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Vec<RefreshToken>> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .filter(|record| record.user_id == user_id && record.is_active_at(now))
            .cloned()
            .collect())
    }

    async fn purge_inactive(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| record.is_active_at(now));
        Ok((before - records.len()) as u64)
    }
}
