//! Session lifecycle orchestration.
//!
//! An identity moves through `Anonymous -> Authenticated -> Rotating ->
//! Authenticated` and ends in `Revoked`/`Expired -> Anonymous`. No lock
//! serializes transitions for one identity; each transition is consistent on
//! its own instead:
//!
//! - login revokes the previous refresh tokens before minting a new one, so
//!   two refresh tokens are never active at once (a crash in between leaves
//!   zero and the user logs in again);
//! - rotation never mutates refresh state, so concurrent rotations all
//!   succeed with distinct access tokens;
//! - rotation keeps the presented refresh token. It stays usable until it
//!   expires or is revoked.
//!
//! Administrative revocation only blocks future rotations. Access tokens
//! already handed out remain valid until their own expiry.

use chrono::Utc;
use regex::Regex;
use serde_json::json;
use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    broadcaster::{RevocationBroadcaster, SessionEvent, REVOKED_MESSAGE},
    credentials::{
        hash_refresh_secret, CredentialStore, RefreshTokenStore, DEFAULT_REFRESH_TTL_DAYS,
        MAX_REFRESH_TTL_DAYS,
    },
    error::{SessionError, SessionResult},
    identity::{
        is_known_role, Identity, IdentityStore, UserProfile, DEFAULT_ROLE, ROLE_ADMIN,
    },
    notifier::{self, EmailMessage, LogNotifier, Notifier, TEMPLATE_PASSWORD_RESET, TEMPLATE_WELCOME},
    password::Passwords,
    recovery::{
        generate_reset_code, hash_reset_code, reset_code_expiry, ResetCode, ResetCodeStore,
        DEFAULT_RESET_CODE_TTL_MINUTES, DEFAULT_RESET_MAX_ATTEMPTS, MAX_RESET_CODE_TTL_MINUTES,
    },
    token::TokenIssuer,
};

pub const MIN_PASSWORD_LENGTH: usize = 8;
pub const DEFAULT_REVOCATION_NOTICE_DELAY: Duration = Duration::from_secs(1);
const RESET_REQUESTED_MESSAGE: &str =
    "If an account with this email exists, a reset code has been sent";

static EMAIL_RE: OnceLock<Option<Regex>> = OnceLock::new();

#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    refresh_ttl_days: i64,
    revocation_notice_delay: Duration,
    reset_code_ttl_minutes: i64,
    reset_max_attempts: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_ttl_days: DEFAULT_REFRESH_TTL_DAYS,
            revocation_notice_delay: DEFAULT_REVOCATION_NOTICE_DELAY,
            reset_code_ttl_minutes: DEFAULT_RESET_CODE_TTL_MINUTES,
            reset_max_attempts: DEFAULT_RESET_MAX_ATTEMPTS,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_refresh_ttl_days(mut self, days: i64) -> Self {
        self.refresh_ttl_days = days;
        self
    }

    #[must_use]
    pub fn with_revocation_notice_delay(mut self, delay: Duration) -> Self {
        self.revocation_notice_delay = delay;
        self
    }

    #[must_use]
    pub fn with_reset_code_ttl_minutes(mut self, minutes: i64) -> Self {
        self.reset_code_ttl_minutes = minutes;
        self
    }

    #[must_use]
    pub fn with_reset_max_attempts(mut self, attempts: i32) -> Self {
        self.reset_max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn refresh_ttl_days(&self) -> i64 {
        self.refresh_ttl_days
    }

    #[must_use]
    pub fn revocation_notice_delay(&self) -> Duration {
        self.revocation_notice_delay
    }

    #[must_use]
    pub fn reset_code_ttl_minutes(&self) -> i64 {
        self.reset_code_ttl_minutes
    }

    #[must_use]
    pub fn reset_max_attempts(&self) -> i32 {
        self.reset_max_attempts
    }

    /// Reject lifetimes that would overflow timestamp arithmetic and
    /// non-positive attempt limits.
    ///
    /// # Errors
    /// `InvalidArgument` naming the first offending setting.
    pub fn validate(&self) -> SessionResult<()> {
        if !(1..=MAX_REFRESH_TTL_DAYS).contains(&self.refresh_ttl_days) {
            return Err(SessionError::invalid(format!(
                "refresh token lifetime must be 1..={MAX_REFRESH_TTL_DAYS} days"
            )));
        }
        if !(1..=MAX_RESET_CODE_TTL_MINUTES).contains(&self.reset_code_ttl_minutes) {
            return Err(SessionError::invalid(format!(
                "reset code lifetime must be 1..={MAX_RESET_CODE_TTL_MINUTES} minutes"
            )));
        }
        if self.reset_max_attempts < 1 {
            return Err(SessionError::invalid("reset attempts must be positive"));
        }
        Ok(())
    }
}

/// A freshly issued access/refresh pair.
#[derive(Clone, Debug)]
pub struct IssuedSession {
    pub access_token: String,
    pub refresh_token: String,
    pub user: UserProfile,
}

#[derive(Clone, Debug, Default)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub phone: Option<String>,
    pub password: String,
    pub role: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct PasswordReset {
    pub email: String,
    pub code: String,
    pub new_password: String,
    pub confirm_password: String,
}

pub struct SessionService {
    tokens: Arc<TokenIssuer>,
    credentials: CredentialStore,
    identities: Arc<dyn IdentityStore>,
    reset_codes: Arc<dyn ResetCodeStore>,
    broadcaster: Arc<RevocationBroadcaster>,
    notifier: Arc<dyn Notifier>,
    passwords: Passwords,
    config: SessionConfig,
}

impl SessionService {
    #[must_use]
    pub fn new(
        tokens: Arc<TokenIssuer>,
        identities: Arc<dyn IdentityStore>,
        refresh_tokens: Arc<dyn RefreshTokenStore>,
        reset_codes: Arc<dyn ResetCodeStore>,
        broadcaster: Arc<RevocationBroadcaster>,
    ) -> Self {
        let config = SessionConfig::default();
        Self {
            tokens,
            credentials: CredentialStore::new(refresh_tokens, config.refresh_ttl_days),
            identities,
            reset_codes,
            broadcaster,
            notifier: Arc::new(LogNotifier),
            passwords: Passwords::default(),
            config,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.credentials = CredentialStore::new(self.credentials_backend(), config.refresh_ttl_days);
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    #[must_use]
    pub fn with_passwords(mut self, passwords: Passwords) -> Self {
        self.passwords = passwords;
        self
    }

    #[must_use]
    pub fn tokens(&self) -> Arc<TokenIssuer> {
        Arc::clone(&self.tokens)
    }

    #[must_use]
    pub fn broadcaster(&self) -> Arc<RevocationBroadcaster> {
        Arc::clone(&self.broadcaster)
    }

    #[must_use]
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn credentials_backend(&self) -> Arc<dyn RefreshTokenStore> {
        self.credentials.backend()
    }

    /// Create an identity and sign it in.
    ///
    /// # Errors
    /// `InvalidArgument` for missing or malformed fields, `Conflict` when the
    /// email is taken, `Internal` on store failures.
    #[instrument(skip_all, fields(email = %registration.email))]
    pub async fn register(&self, registration: Registration) -> SessionResult<IssuedSession> {
        let username = registration.username.trim().to_string();
        let email = normalize_email(&registration.email);
        if username.is_empty() || email.is_empty() || registration.password.is_empty() {
            return Err(SessionError::invalid(
                "username, email and password are required",
            ));
        }
        if !valid_email(&email) {
            return Err(SessionError::invalid("invalid email address"));
        }
        if registration.password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(SessionError::invalid(format!(
                "password must be at least {MIN_PASSWORD_LENGTH} characters"
            )));
        }
        let role = match registration.role.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_ROLE.to_string(),
            Some(ROLE_ADMIN) => {
                return Err(SessionError::invalid("the admin role cannot be self-assigned"))
            }
            Some(role) if is_known_role(role) => role.to_string(),
            Some(_) => return Err(SessionError::invalid("unknown role")),
        };

        if self.lookup_by_email(&email).await.is_some() {
            return Err(SessionError::Conflict(
                "a user with this email already exists".to_string(),
            ));
        }

        let password_hash = self
            .passwords
            .hash(&registration.password)
            .map_err(|err| SessionError::internal("failed to hash password", err))?;
        let identity = Identity {
            id: Uuid::new_v4(),
            email,
            username,
            phone: registration
                .phone
                .map(|phone| phone.trim().to_string())
                .filter(|phone| !phone.is_empty()),
            password_hash,
            role,
            created_at: Utc::now(),
            last_login_at: None,
        };
        let inserted = self
            .identities
            .insert(&identity)
            .await
            .map_err(|err| SessionError::internal("failed to create user", err))?;
        if !inserted {
            return Err(SessionError::Conflict(
                "a user with this email already exists".to_string(),
            ));
        }
        info!(user_id = %identity.id, role = %identity.role, "user registered");

        notifier::dispatch(
            &self.notifier,
            EmailMessage {
                to_email: identity.email.clone(),
                template: TEMPLATE_WELCOME.to_string(),
                variables: json!({ "username": identity.username }),
            },
        );

        let role = identity.role.clone();
        self.issue(&identity, &role).await
    }

    /// Exchange email and password for a new credential pair.
    ///
    /// All previously active refresh tokens of the identity are revoked
    /// before the new one is minted.
    ///
    /// # Errors
    /// `InvalidCredentials` for an unknown email or wrong password,
    /// `Internal` on store failures.
    #[instrument(skip_all)]
    pub async fn login(&self, email: &str, password: &str) -> SessionResult<IssuedSession> {
        let email = normalize_email(email);
        let Some(identity) = self.lookup_by_email(&email).await else {
            debug!("login for unknown email");
            return Err(SessionError::InvalidCredentials);
        };
        if !self.passwords.verify(password, &identity.password_hash) {
            debug!(user_id = %identity.id, "login with wrong password");
            return Err(SessionError::InvalidCredentials);
        }

        if let Err(err) = self
            .identities
            .touch_last_login(identity.id, Utc::now())
            .await
        {
            warn!(user_id = %identity.id, "failed to record last login: {err:#}");
        }

        let role = self.current_role(identity.id).await;
        let revoked = self
            .credentials
            .revoke_all_active_for(identity.id)
            .await
            .map_err(|err| SessionError::internal("failed to revoke previous sessions", err))?;
        let issued = self.issue(&identity, &role).await?;
        info!(user_id = %identity.id, revoked, "user logged in");
        Ok(issued)
    }

    /// Mint a new access token from an expired one plus an active refresh
    /// token. The refresh token is returned unchanged.
    ///
    /// # Errors
    /// `InvalidRefreshToken` when the refresh token is unknown, revoked or
    /// expired; `InvalidAccessToken` when the access token is not ours or
    /// belongs to someone else; `NotFound` when the identity is gone.
    #[instrument(skip_all)]
    pub async fn rotate(
        &self,
        access_token: &str,
        refresh_secret: &str,
    ) -> SessionResult<IssuedSession> {
        let refresh_secret = refresh_secret.trim();
        if refresh_secret.is_empty() {
            return Err(SessionError::InvalidRefreshToken);
        }
        let record = self
            .credentials
            .find_by_hash(&hash_refresh_secret(refresh_secret))
            .await
            .map_err(|err| SessionError::internal("failed to lookup refresh token", err))?;
        let Some(record) = record.filter(|record| self.credentials.is_active(record)) else {
            return Err(SessionError::InvalidRefreshToken);
        };

        let claims = self
            .tokens
            .decode_ignoring_expiry(access_token.trim())
            .map_err(|_| SessionError::InvalidAccessToken)?;
        if claims.sub != record.user_id {
            warn!(
                token_user = %claims.sub,
                refresh_owner = %record.user_id,
                "refresh token presented with another user's access token"
            );
            return Err(SessionError::InvalidAccessToken);
        }

        let Some(identity) = self.lookup_by_id(record.user_id).await else {
            return Err(SessionError::NotFound("user"));
        };
        let role = self.current_role(identity.id).await;
        let access_token = self.mint(&identity, &role)?;
        debug!(user_id = %identity.id, "access token rotated");
        Ok(IssuedSession {
            access_token,
            refresh_token: refresh_secret.to_string(),
            user: UserProfile::from_identity(&identity, &role),
        })
    }

    /// Revoke the presented refresh token, or every active one when none is
    /// given. A token owned by another identity is left alone.
    ///
    /// # Errors
    /// `Internal` on store failures.
    #[instrument(skip_all, fields(%user_id))]
    pub async fn logout(&self, user_id: Uuid, refresh_secret: Option<&str>) -> SessionResult<()> {
        match refresh_secret.map(str::trim).filter(|secret| !secret.is_empty()) {
            Some(secret) => {
                let record = self
                    .credentials
                    .find_by_hash(&hash_refresh_secret(secret))
                    .await
                    .map_err(|err| SessionError::internal("failed to lookup refresh token", err))?;
                match record {
                    Some(record) if record.user_id == user_id => {
                        self.credentials
                            .revoke(&record)
                            .await
                            .map_err(|err| SessionError::internal("failed to revoke session", err))?;
                    }
                    Some(_) => warn!("logout presented a refresh token owned by another user"),
                    None => debug!("logout presented an unknown refresh token"),
                }
            }
            None => {
                self.credentials
                    .revoke_all_active_for(user_id)
                    .await
                    .map_err(|err| SessionError::internal("failed to revoke sessions", err))?;
            }
        }
        info!("user logged out");
        Ok(())
    }

    /// Revoke one refresh token owned by `user_id`.
    ///
    /// # Errors
    /// `NotFound` when the token is unknown or not owned by the caller.
    #[instrument(skip_all, fields(%user_id))]
    pub async fn revoke_token(&self, user_id: Uuid, refresh_secret: &str) -> SessionResult<()> {
        let record = self
            .credentials
            .find_by_hash(&hash_refresh_secret(refresh_secret.trim()))
            .await
            .map_err(|err| SessionError::internal("failed to lookup refresh token", err))?;
        let Some(record) = record.filter(|record| record.user_id == user_id) else {
            return Err(SessionError::NotFound("token"));
        };
        self.credentials
            .revoke(&record)
            .await
            .map_err(|err| SessionError::internal("failed to revoke refresh token", err))?;
        Ok(())
    }

    /// Verify an access token and return the identity with its current role.
    ///
    /// # Errors
    /// `InvalidAccessToken` for any verification failure or a missing identity.
    pub async fn validate(&self, access_token: &str) -> SessionResult<UserProfile> {
        let claims = self.tokens.verify(access_token.trim()).map_err(|err| {
            debug!("access token rejected: {err}");
            SessionError::InvalidAccessToken
        })?;
        let Some(identity) = self.lookup_by_id(claims.sub).await else {
            return Err(SessionError::InvalidAccessToken);
        };
        let role = self.current_role(identity.id).await;
        Ok(UserProfile::from_identity(&identity, &role))
    }

    /// Revoke every refresh token of `user_id` and push a `session_revoked`
    /// notice to its live connections after the configured delay.
    ///
    /// # Errors
    /// `NotFound` for an unknown identity, `Internal` if revocation fails.
    #[instrument(skip_all, fields(%user_id))]
    pub async fn revoke_sessions(&self, user_id: Uuid) -> SessionResult<UserProfile> {
        let Some(identity) = self.lookup_by_id(user_id).await else {
            return Err(SessionError::NotFound("user"));
        };
        let revoked = self
            .credentials
            .revoke_all_active_for(user_id)
            .await
            .map_err(|err| SessionError::internal("failed to revoke sessions", err))?;

        let broadcaster = self.broadcaster();
        let delay = self.config.revocation_notice_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            broadcaster
                .notify(user_id, SessionEvent::session_revoked(REVOKED_MESSAGE))
                .await;
        });

        info!(
            revoked,
            access_ttl_minutes = self.tokens.config().access_ttl_minutes(),
            "sessions revoked; issued access tokens stay valid until expiry"
        );
        let role = self.current_role(user_id).await;
        Ok(UserProfile::from_identity(&identity, &role))
    }

    /// Change the stored role of `user_id`. Existing access tokens keep the
    /// old role until they are rotated.
    ///
    /// # Errors
    /// `InvalidArgument` for an unknown role, `NotFound` for an unknown identity.
    #[instrument(skip_all, fields(%user_id, role = %role))]
    pub async fn update_role(&self, user_id: Uuid, role: &str) -> SessionResult<UserProfile> {
        let role = role.trim();
        if !is_known_role(role) {
            return Err(SessionError::invalid("unknown role"));
        }
        let updated = self
            .identities
            .set_role(user_id, role)
            .await
            .map_err(|err| SessionError::internal("failed to update role", err))?;
        if !updated {
            return Err(SessionError::NotFound("user"));
        }
        let Some(identity) = self.lookup_by_id(user_id).await else {
            return Err(SessionError::NotFound("user"));
        };
        info!("role updated");
        Ok(UserProfile::from_identity(&identity, role))
    }

    /// Delete expired and revoked refresh tokens.
    ///
    /// # Errors
    /// `Internal` on store failures.
    pub async fn cleanup_tokens(&self) -> SessionResult<u64> {
        let removed = self
            .credentials
            .purge_inactive()
            .await
            .map_err(|err| SessionError::internal("failed to clean up refresh tokens", err))?;
        info!(removed, "expired refresh tokens cleaned up");
        Ok(removed)
    }

    /// Start a password reset. Always reports success for a well-formed
    /// request so callers cannot tell which emails exist.
    ///
    /// # Errors
    /// `InvalidArgument` when the email is empty.
    #[instrument(skip_all)]
    pub async fn forgot_password(&self, email: &str) -> SessionResult<&'static str> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(SessionError::invalid("email is required"));
        }
        let Some(identity) = self.lookup_by_email(&email).await else {
            debug!("password reset for unknown email");
            return Ok(RESET_REQUESTED_MESSAGE);
        };

        if let Err(err) = self.issue_reset_code(&identity).await {
            warn!(user_id = %identity.id, "failed to issue reset code: {err:#}");
        }
        Ok(RESET_REQUESTED_MESSAGE)
    }

    /// Check a reset code without consuming it.
    ///
    /// # Errors
    /// `InvalidArgument` for a wrong, expired or exhausted code,
    /// `NotFound` for an unknown email.
    #[instrument(skip_all)]
    pub async fn verify_reset_code(&self, email: &str, code: &str) -> SessionResult<()> {
        let email = normalize_email(email);
        let code = code.trim();
        if email.is_empty() || code.is_empty() {
            return Err(SessionError::invalid("email and code are required"));
        }
        let Some(identity) = self.lookup_by_email(&email).await else {
            return Err(SessionError::NotFound("user"));
        };

        let now = Utc::now();
        let pending: Vec<ResetCode> = self
            .unused_reset_codes(identity.id)
            .await?
            .into_iter()
            .filter(|candidate| candidate.is_pending_at(now))
            .collect();
        let code_hash = hash_reset_code(code);
        let found = pending
            .iter()
            .find(|candidate| candidate.code_hash == code_hash)
            .cloned();
        let Some(mut matching) = found else {
            for mut candidate in pending {
                candidate.attempts += 1;
                if candidate.attempts >= self.config.reset_max_attempts {
                    candidate.used = true;
                    warn!(code_id = %candidate.id, "reset code locked after too many attempts");
                }
                self.save_reset_code(&candidate).await?;
            }
            return Err(SessionError::invalid("invalid reset code"));
        };

        if matching.attempts >= self.config.reset_max_attempts {
            matching.used = true;
            self.save_reset_code(&matching).await?;
            return Err(SessionError::invalid("too many attempts"));
        }
        Ok(())
    }

    /// Replace the password using a reset code. Every active refresh token
    /// of the identity is revoked on success.
    ///
    /// # Errors
    /// `InvalidArgument` for validation failures or a bad code, `NotFound`
    /// for an unknown email, `Internal` on store failures.
    #[instrument(skip_all)]
    pub async fn reset_password(&self, reset: PasswordReset) -> SessionResult<()> {
        let email = normalize_email(&reset.email);
        let code = reset.code.trim();
        if email.is_empty() || code.is_empty() || reset.new_password.is_empty() {
            return Err(SessionError::invalid("all fields are required"));
        }
        if reset.new_password != reset.confirm_password {
            return Err(SessionError::invalid("passwords do not match"));
        }
        if !strong_password(&reset.new_password) {
            return Err(SessionError::invalid(format!(
                "password must be at least {MIN_PASSWORD_LENGTH} characters and contain a letter and a digit"
            )));
        }
        let Some(identity) = self.lookup_by_email(&email).await else {
            return Err(SessionError::NotFound("user"));
        };

        let code_hash = hash_reset_code(code);
        let Some(mut matching) = self
            .unused_reset_codes(identity.id)
            .await?
            .into_iter()
            .find(|candidate| candidate.code_hash == code_hash)
        else {
            return Err(SessionError::invalid("code not found or already used"));
        };
        if matching.expires_at < Utc::now() {
            matching.used = true;
            self.save_reset_code(&matching).await?;
            return Err(SessionError::invalid("reset code expired"));
        }
        if matching.attempts >= self.config.reset_max_attempts {
            matching.used = true;
            self.save_reset_code(&matching).await?;
            return Err(SessionError::invalid("too many attempts"));
        }

        let password_hash = self
            .passwords
            .hash(&reset.new_password)
            .map_err(|err| SessionError::internal("failed to hash password", err))?;
        self.identities
            .set_password_hash(identity.id, &password_hash)
            .await
            .map_err(|err| SessionError::internal("failed to update password", err))?;
        matching.used = true;
        self.save_reset_code(&matching).await?;
        let revoked = self
            .credentials
            .revoke_all_active_for(identity.id)
            .await
            .map_err(|err| SessionError::internal("failed to revoke sessions", err))?;
        info!(user_id = %identity.id, revoked, "password reset");
        Ok(())
    }

    async fn issue(&self, identity: &Identity, role: &str) -> SessionResult<IssuedSession> {
        let (refresh_token, _record) = self
            .credentials
            .create(identity.id)
            .await
            .map_err(|err| SessionError::internal("failed to create refresh token", err))?;
        let access_token = self.mint(identity, role)?;
        Ok(IssuedSession {
            access_token,
            refresh_token,
            user: UserProfile::from_identity(identity, role),
        })
    }

    fn mint(&self, identity: &Identity, role: &str) -> SessionResult<String> {
        self.tokens
            .mint(identity.id, &identity.email, &identity.username, role, None)
            .map_err(|err| SessionError::internal("failed to mint access token", err.into()))
    }

    async fn issue_reset_code(&self, identity: &Identity) -> anyhow::Result<()> {
        self.reset_codes.invalidate_for(identity.id).await?;
        let now = Utc::now();
        let expires_at = reset_code_expiry(now, self.config.reset_code_ttl_minutes)?;
        let code = generate_reset_code();
        self.reset_codes
            .insert(&ResetCode {
                id: Uuid::new_v4(),
                user_id: identity.id,
                code_hash: hash_reset_code(&code),
                created_at: now,
                expires_at,
                used: false,
                attempts: 0,
            })
            .await?;
        notifier::dispatch(
            &self.notifier,
            EmailMessage {
                to_email: identity.email.clone(),
                template: TEMPLATE_PASSWORD_RESET.to_string(),
                variables: json!({ "username": identity.username, "code": code }),
            },
        );
        Ok(())
    }

    async fn unused_reset_codes(&self, user_id: Uuid) -> SessionResult<Vec<ResetCode>> {
        self.reset_codes
            .unused_for(user_id)
            .await
            .map_err(|err| SessionError::internal("failed to load reset codes", err))
    }

    async fn save_reset_code(&self, code: &ResetCode) -> SessionResult<()> {
        self.reset_codes
            .update(code)
            .await
            .map_err(|err| SessionError::internal("failed to update reset code", err))
    }

    // Read-only lookups treat store failures as "not found".
    async fn lookup_by_id(&self, id: Uuid) -> Option<Identity> {
        match self.identities.find_by_id(id).await {
            Ok(identity) => identity,
            Err(err) => {
                warn!(user_id = %id, "user lookup failed: {err:#}");
                None
            }
        }
    }

    async fn lookup_by_email(&self, email: &str) -> Option<Identity> {
        match self.identities.find_by_email(email).await {
            Ok(identity) => identity,
            Err(err) => {
                warn!("user lookup by email failed: {err:#}");
                None
            }
        }
    }

    async fn current_role(&self, id: Uuid) -> String {
        match self.identities.role_of(id).await {
            Ok(Some(role)) if !role.is_empty() => role,
            Ok(_) => DEFAULT_ROLE.to_string(),
            Err(err) => {
                warn!(user_id = %id, "role lookup failed: {err:#}");
                DEFAULT_ROLE.to_string()
            }
        }
    }
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub(crate) fn valid_email(email_normalized: &str) -> bool {
    EMAIL_RE
        .get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").ok())
        .as_ref()
        .is_some_and(|regex| regex.is_match(email_normalized))
}

fn strong_password(password: &str) -> bool {
    password.chars().count() >= MIN_PASSWORD_LENGTH
        && password.chars().any(|c| c.is_ascii_alphabetic())
        && password.chars().any(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_email_trims_and_lowercases() {
        assert_eq!(normalize_email(" Ada@Example.COM "), "ada@example.com");
    }

    #[test]
    fn valid_email_accepts_basic_format() {
        assert!(valid_email("ada@example.com"));
        assert!(!valid_email("ada@example"));
        assert!(!valid_email("ada example@x.io"));
        // Compiled once, reused afterwards.
        assert!(EMAIL_RE.get().is_some_and(Option::is_some));
        assert!(valid_email("grace@example.org"));
    }

    #[test]
    fn strong_password_needs_letter_digit_and_length() {
        assert!(strong_password("abcdefg1"));
        assert!(!strong_password("abcdefgh"));
        assert!(!strong_password("12345678"));
        assert!(!strong_password("abc1"));
    }

    #[test]
    fn config_builder_overrides_defaults() {
        let config = SessionConfig::default()
            .with_refresh_ttl_days(30)
            .with_revocation_notice_delay(Duration::from_millis(5))
            .with_reset_code_ttl_minutes(10)
            .with_reset_max_attempts(3);
        assert_eq!(config.refresh_ttl_days(), 30);
        assert_eq!(config.revocation_notice_delay(), Duration::from_millis(5));
        assert_eq!(config.reset_code_ttl_minutes(), 10);
        assert_eq!(config.reset_max_attempts(), 3);
        assert_eq!(
            SessionConfig::default().refresh_ttl_days(),
            DEFAULT_REFRESH_TTL_DAYS
        );
    }

    #[test]
    fn config_validate_bounds_lifetimes() {
        assert!(SessionConfig::default().validate().is_ok());
        let bad = [
            SessionConfig::default().with_refresh_ttl_days(0),
            SessionConfig::default().with_refresh_ttl_days(i64::MAX / 2),
            SessionConfig::default().with_reset_code_ttl_minutes(MAX_RESET_CODE_TTL_MINUTES + 1),
            SessionConfig::default().with_reset_code_ttl_minutes(i64::MAX),
            SessionConfig::default().with_reset_max_attempts(0),
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(SessionError::InvalidArgument(_))),
                "{config:?} accepted"
            );
        }
    }
}
