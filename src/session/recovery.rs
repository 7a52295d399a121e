//! Password-reset codes.
//!
//! Codes are six digits, stored hashed, single use, and burned after too
//! many wrong guesses.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, Rng};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::credentials::sha512_b64;

pub const DEFAULT_RESET_CODE_TTL_MINUTES: i64 = 60;
pub const MAX_RESET_CODE_TTL_MINUTES: i64 = 24 * 60;
pub const DEFAULT_RESET_MAX_ATTEMPTS: i32 = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResetCode {
    pub id: Uuid,
    pub user_id: Uuid,
    pub code_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub attempts: i32,
}

impl ResetCode {
    #[must_use]
    pub fn is_pending_at(&self, now: DateTime<Utc>) -> bool {
        !self.used && self.expires_at > now
    }
}

#[async_trait]
pub trait ResetCodeStore: Send + Sync {
    /// Mark every unused code for `user_id` as used.
    async fn invalidate_for(&self, user_id: Uuid) -> Result<u64>;

    async fn insert(&self, code: &ResetCode) -> Result<()>;

    /// All unused codes for `user_id`, expired ones included.
    async fn unused_for(&self, user_id: Uuid) -> Result<Vec<ResetCode>>;

    /// Persist `used` and `attempts`.
    async fn update(&self, code: &ResetCode) -> Result<()>;
}

#[must_use]
pub fn generate_reset_code() -> String {
    OsRng.gen_range(100_000..1_000_000).to_string()
}

/// Stored form of a reset code.
#[must_use]
pub fn hash_reset_code(code: &str) -> String {
    sha512_b64(code)
}

/// Expiry of a reset code issued at `now`.
///
/// # Errors
/// Returns an error if `ttl_minutes` is outside `1..=MAX_RESET_CODE_TTL_MINUTES`.
pub fn reset_code_expiry(now: DateTime<Utc>, ttl_minutes: i64) -> Result<DateTime<Utc>> {
    if !(1..=MAX_RESET_CODE_TTL_MINUTES).contains(&ttl_minutes) {
        bail!("reset code lifetime of {ttl_minutes} minutes is out of range");
    }
    Duration::try_minutes(ttl_minutes)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .context("reset code expiry overflows")
}

#[derive(Debug, Default)]
pub struct MemoryResetCodeStore {
    codes: Mutex<HashMap<Uuid, ResetCode>>,
}

impl MemoryResetCodeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResetCodeStore for MemoryResetCodeStore {
    async fn invalidate_for(&self, user_id: Uuid) -> Result<u64> {
        let mut codes = self.codes.lock().await;
        let mut changed = 0;
        for code in codes.values_mut() {
            if code.user_id == user_id && !code.used {
                code.used = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn insert(&self, code: &ResetCode) -> Result<()> {
        self.codes.lock().await.insert(code.id, code.clone());
        Ok(())
    }

    async fn unused_for(&self, user_id: Uuid) -> Result<Vec<ResetCode>> {
        let codes = self.codes.lock().await;
        let mut unused: Vec<ResetCode> = codes
            .values()
            .filter(|code| code.user_id == user_id && !code.used)
            .cloned()
            .collect();
        unused.sort_by_key(|code| code.created_at);
        Ok(unused)
    }

    async fn update(&self, code: &ResetCode) -> Result<()> {
        if let Some(stored) = self.codes.lock().await.get_mut(&code.id) {
            stored.used = code.used;
            stored.attempts = code.attempts;
        }
        Ok(())
    }
}
