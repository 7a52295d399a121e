//! Postgres-backed stores.
//!
//! Schema lives in `db/sql/01_learnbox.sql`. Every refresh-token mutation is a
//! single statement; nothing here opens a transaction.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::{info_span, Instrument, Span};
use uuid::Uuid;

use super::{
    credentials::{RefreshToken, RefreshTokenStore},
    identity::{Identity, IdentityStore},
    recovery::{ResetCode, ResetCodeStore},
};

fn db_span(operation: &'static str, statement: &'static str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

#[derive(Clone, Debug)]
pub struct PgIdentityStore {
    pool: PgPool,
}

impl PgIdentityStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const IDENTITY_COLUMNS: &str =
    "id, email, username, phone, password_hash, role, created_at, last_login_at";

fn identity_from_row(row: &PgRow) -> Identity {
    Identity {
        id: row.get("id"),
        email: row.get("email"),
        username: row.get("username"),
        phone: row.get("phone"),
        password_hash: row.get("password_hash"),
        role: row.get("role"),
        created_at: row.get("created_at"),
        last_login_at: row.get("last_login_at"),
    }
}

#[async_trait]
impl IdentityStore for PgIdentityStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Identity>> {
        let query = format!("SELECT {IDENTITY_COLUMNS} FROM users WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", "SELECT ... FROM users WHERE id = $1"))
            .await
            .context("failed to lookup user by id")?;
        Ok(row.as_ref().map(identity_from_row))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Identity>> {
        let query = format!("SELECT {IDENTITY_COLUMNS} FROM users WHERE email = $1");
        let row = sqlx::query(&query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", "SELECT ... FROM users WHERE email = $1"))
            .await
            .context("failed to lookup user by email")?;
        Ok(row.as_ref().map(identity_from_row))
    }

    async fn role_of(&self, id: Uuid) -> Result<Option<String>> {
        let query = "SELECT role FROM users WHERE id = $1";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lookup user role")?;
        Ok(row.map(|row| row.get("role")))
    }

    async fn insert(&self, identity: &Identity) -> Result<bool> {
        let query = r"
            INSERT INTO users (id, email, username, phone, password_hash, role, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
        ";
        let result = sqlx::query(query)
            .bind(identity.id)
            .bind(&identity.email)
            .bind(&identity.username)
            .bind(&identity.phone)
            .bind(&identity.password_hash)
            .bind(&identity.role)
            .bind(identity.created_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(err).context("failed to insert user"),
        }
    }

    async fn touch_last_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let query = "UPDATE users SET last_login_at = $2 WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to update last login")?;
        Ok(())
    }

    async fn set_role(&self, id: Uuid, role: &str) -> Result<bool> {
        let query = "UPDATE users SET role = $2 WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .bind(role)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to update role")?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> Result<bool> {
        let query = "UPDATE users SET password_hash = $2 WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .bind(password_hash)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to update password")?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Clone, Debug)]
pub struct PgRefreshTokenStore {
    pool: PgPool,
}

impl PgRefreshTokenStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn refresh_token_from_row(row: &PgRow) -> RefreshToken {
    RefreshToken {
        id: row.get("id"),
        user_id: row.get("user_id"),
        token_hash: row.get("token_hash"),
        expires_at: row.get("expires_at"),
        created_at: row.get("created_at"),
        revoked: row.get("revoked"),
    }
}

#[async_trait]
impl RefreshTokenStore for PgRefreshTokenStore {
    async fn insert(&self, record: &RefreshToken) -> Result<()> {
        let query = r"
            INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at, created_at, revoked)
            VALUES ($1, $2, $3, $4, $5, $6)
        ";
        sqlx::query(query)
            .bind(record.id)
            .bind(record.user_id)
            .bind(&record.token_hash)
            .bind(record.expires_at)
            .bind(record.created_at)
            .bind(record.revoked)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to insert refresh token")?;
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>> {
        let query = r"
            SELECT id, user_id, token_hash, expires_at, created_at, revoked
            FROM refresh_tokens
            WHERE token_hash = $1
            LIMIT 1
        ";
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lookup refresh token")?;
        Ok(row.as_ref().map(refresh_token_from_row))
    }

    async fn revoke(&self, id: Uuid) -> Result<bool> {
        let query = r"
            UPDATE refresh_tokens
            SET revoked = TRUE, revoked_at = NOW()
            WHERE id = $1 AND revoked = FALSE
        ";
        let result = sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to revoke refresh token")?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_all_active_for(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        let query = r"
            UPDATE refresh_tokens
            SET revoked = TRUE, revoked_at = NOW()
            WHERE user_id = $1 AND revoked = FALSE AND expires_at > $2
        ";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to revoke user refresh tokens")?;
        Ok(result.rows_affected())
    }

    async fn active_for(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Vec<RefreshToken>> {
        let query = r"
            SELECT id, user_id, token_hash, expires_at, created_at, revoked
            FROM refresh_tokens
            WHERE user_id = $1 AND revoked = FALSE AND expires_at > $2
            ORDER BY created_at
        ";
        let rows = sqlx::query(query)
            .bind(user_id)
            .bind(now)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to list active refresh tokens")?;
        Ok(rows.iter().map(refresh_token_from_row).collect())
    }

    async fn purge_inactive(&self, now: DateTime<Utc>) -> Result<u64> {
        let query = "DELETE FROM refresh_tokens WHERE revoked = TRUE OR expires_at <= $1";
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to purge refresh tokens")?;
        Ok(result.rows_affected())
    }
}

#[derive(Clone, Debug)]
pub struct PgResetCodeStore {
    pool: PgPool,
}

impl PgResetCodeStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResetCodeStore for PgResetCodeStore {
    async fn invalidate_for(&self, user_id: Uuid) -> Result<u64> {
        let query = "UPDATE password_reset_codes SET used = TRUE WHERE user_id = $1 AND used = FALSE";
        let result = sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to invalidate reset codes")?;
        Ok(result.rows_affected())
    }

    async fn insert(&self, code: &ResetCode) -> Result<()> {
        let query = r"
            INSERT INTO password_reset_codes
                (id, user_id, code_hash, created_at, expires_at, used, attempts)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
        ";
        sqlx::query(query)
            .bind(code.id)
            .bind(code.user_id)
            .bind(&code.code_hash)
            .bind(code.created_at)
            .bind(code.expires_at)
            .bind(code.used)
            .bind(code.attempts)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to insert reset code")?;
        Ok(())
    }

    async fn unused_for(&self, user_id: Uuid) -> Result<Vec<ResetCode>> {
        let query = r"
            SELECT id, user_id, code_hash, created_at, expires_at, used, attempts
            FROM password_reset_codes
            WHERE user_id = $1 AND used = FALSE
            ORDER BY created_at
        ";
        let rows = sqlx::query(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to list reset codes")?;
        Ok(rows
            .iter()
            .map(|row| ResetCode {
                id: row.get("id"),
                user_id: row.get("user_id"),
                code_hash: row.get("code_hash"),
                created_at: row.get("created_at"),
                expires_at: row.get("expires_at"),
                used: row.get("used"),
                attempts: row.get("attempts"),
            })
            .collect())
    }

    async fn update(&self, code: &ResetCode) -> Result<()> {
        let query = "UPDATE password_reset_codes SET used = $2, attempts = $3 WHERE id = $1";
        sqlx::query(query)
            .bind(code.id)
            .bind(code.used)
            .bind(code.attempts)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to update reset code")?;
        Ok(())
    }
}
