//! Access credential issuance and verification.
//!
//! Access tokens are HS256 JWTs signed with a shared secret. They are never
//! stored server-side: a token is trusted while its signature, issuer,
//! audience and expiry check out, so a forced logout only becomes effective
//! against the API once the token's TTL has elapsed.

use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const MIN_SECRET_BYTES: usize = 32;
pub const DEFAULT_ACCESS_TTL_MINUTES: i64 = 60;
/// One week.
pub const MAX_ACCESS_TTL_MINUTES: i64 = 7 * 24 * 60;
pub const DEFAULT_ISSUER: &str = "learnbox";
pub const DEFAULT_AUDIENCE: &str = "learnbox-web";
const TOKEN_TYPE_ACCESS: &str = "access";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid or missing claim: {0}")]
    InvalidArgument(&'static str),
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("invalid token issuer")]
    InvalidIssuer,
    #[error("invalid token audience")]
    InvalidAudience,
    #[error("token could not be parsed")]
    Unparseable,
    #[error("failed to sign token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            ErrorKind::InvalidIssuer => Self::InvalidIssuer,
            ErrorKind::InvalidAudience => Self::InvalidAudience,
            _ => Self::Unparseable,
        }
    }
}

/// Claims embedded in every access token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: Uuid,
    pub email: String,
    pub unique_name: String,
    pub role: String,
    pub jti: Uuid,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
    #[serde(rename = "tokenType")]
    pub token_type: String,
}

#[derive(Clone, Debug)]
pub struct TokenConfig {
    secret: SecretString,
    issuer: String,
    audience: String,
    access_ttl_minutes: i64,
}

impl TokenConfig {
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self {
            secret,
            issuer: DEFAULT_ISSUER.to_string(),
            audience: DEFAULT_AUDIENCE.to_string(),
            access_ttl_minutes: DEFAULT_ACCESS_TTL_MINUTES,
        }
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.issuer = issuer;
        self
    }

    #[must_use]
    pub fn with_audience(mut self, audience: String) -> Self {
        self.audience = audience;
        self
    }

    #[must_use]
    pub fn with_access_ttl_minutes(mut self, minutes: i64) -> Self {
        self.access_ttl_minutes = minutes;
        self
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    #[must_use]
    pub fn access_ttl_minutes(&self) -> i64 {
        self.access_ttl_minutes
    }
}

fn check_ttl(minutes: i64) -> Result<Duration, TokenError> {
    if !(1..=MAX_ACCESS_TTL_MINUTES).contains(&minutes) {
        return Err(TokenError::InvalidArgument("ttl"));
    }
    Duration::try_minutes(minutes).ok_or(TokenError::InvalidArgument("ttl"))
}

pub struct TokenIssuer {
    config: TokenConfig,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("issuer", &self.config.issuer)
            .field("audience", &self.config.audience)
            .field("access_ttl_minutes", &self.config.access_ttl_minutes)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    /// Build an issuer from its configuration.
    ///
    /// # Errors
    /// Returns an error if the secret is shorter than [`MIN_SECRET_BYTES`] or
    /// the configured TTL is outside `1..=MAX_ACCESS_TTL_MINUTES`.
    pub fn new(config: TokenConfig) -> Result<Self, TokenError> {
        let secret = config.secret.expose_secret().as_bytes();
        if secret.len() < MIN_SECRET_BYTES {
            return Err(TokenError::InvalidArgument("secret"));
        }
        check_ttl(config.access_ttl_minutes)?;
        let encoding = EncodingKey::from_secret(secret);
        let decoding = DecodingKey::from_secret(secret);
        Ok(Self {
            config,
            encoding,
            decoding,
        })
    }

    #[must_use]
    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Mint a signed access token. Every call embeds a fresh `jti`, so two
    /// tokens minted in the same second for the same identity still differ.
    ///
    /// # Errors
    /// Returns `InvalidArgument` when any identity field is empty or the TTL
    /// is out of range.
    pub fn mint(
        &self,
        user_id: Uuid,
        email: &str,
        username: &str,
        role: &str,
        ttl_minutes: Option<i64>,
    ) -> Result<String, TokenError> {
        if user_id.is_nil() {
            return Err(TokenError::InvalidArgument("sub"));
        }
        if email.trim().is_empty() {
            return Err(TokenError::InvalidArgument("email"));
        }
        if username.trim().is_empty() {
            return Err(TokenError::InvalidArgument("unique_name"));
        }
        if role.trim().is_empty() {
            return Err(TokenError::InvalidArgument("role"));
        }
        let ttl = check_ttl(ttl_minutes.unwrap_or(self.config.access_ttl_minutes))?;

        let now = Utc::now();
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or(TokenError::InvalidArgument("ttl"))?;
        let claims = AccessClaims {
            sub: user_id,
            email: email.to_string(),
            unique_name: username.to_string(),
            role: role.to_string(),
            jti: Uuid::new_v4(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            token_type: TOKEN_TYPE_ACCESS.to_string(),
        };
        self.sign(&claims)
    }

    /// Sign arbitrary claims with the issuer key.
    ///
    /// # Errors
    /// Returns `Signing` if encoding fails.
    pub fn sign(&self, claims: &AccessClaims) -> Result<String, TokenError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding).map_err(TokenError::Signing)
    }

    /// Strictly verify signature, issuer, audience and expiry.
    ///
    /// # Errors
    /// Returns the first failed check.
    pub fn verify(&self, token: &str) -> Result<AccessClaims, TokenError> {
        let claims = decode::<AccessClaims>(token, &self.decoding, &self.validation(true))?.claims;
        Self::check_token_type(claims)
    }

    /// Decode a token whose expiry may have passed. Signature, issuer and
    /// audience are still enforced; every failure collapses to `Unparseable`.
    ///
    /// # Errors
    /// Returns `Unparseable` when the token cannot be trusted.
    pub fn decode_ignoring_expiry(&self, token: &str) -> Result<AccessClaims, TokenError> {
        decode::<AccessClaims>(token, &self.decoding, &self.validation(false))
            .map_err(TokenError::from)
            .and_then(|data| Self::check_token_type(data.claims))
            .map_err(|err| {
                debug!("rejecting access token during rotation: {err}");
                TokenError::Unparseable
            })
    }

    fn validation(&self, validate_exp: bool) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.set_audience(&[self.config.audience.as_str()]);
        validation.leeway = 0;
        validation.validate_exp = validate_exp;
        validation
    }

    fn check_token_type(claims: AccessClaims) -> Result<AccessClaims, TokenError> {
        if claims.token_type == TOKEN_TYPE_ACCESS {
            Ok(claims)
        } else {
            Err(TokenError::Unparseable)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef-test";

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(TokenConfig::new(SecretString::from(SECRET))).expect("issuer")
    }

    fn expired_claims(issuer: &TokenIssuer) -> AccessClaims {
        let now = Utc::now().timestamp();
        AccessClaims {
            sub: Uuid::new_v4(),
            email: "ada@example.com".to_string(),
            unique_name: "ada".to_string(),
            role: "student".to_string(),
            jti: Uuid::new_v4(),
            iat: now - 3600,
            exp: now - 60,
            iss: issuer.config().issuer().to_string(),
            aud: issuer.config().audience().to_string(),
            token_type: "access".to_string(),
        }
    }

    #[test]
    fn mint_then_verify_returns_claims() {
        let issuer = issuer();
        let user_id = Uuid::new_v4();
        let token = issuer
            .mint(user_id, "ada@example.com", "ada", "teacher", None)
            .expect("mint");
        let claims = issuer.verify(&token).expect("verify");
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.email, "ada@example.com");
        assert_eq!(claims.unique_name, "ada");
        assert_eq!(claims.role, "teacher");
        assert_eq!(claims.iss, DEFAULT_ISSUER);
        assert_eq!(claims.aud, DEFAULT_AUDIENCE);
        assert_eq!(claims.exp - claims.iat, DEFAULT_ACCESS_TTL_MINUTES * 60);
    }

    #[test]
    fn mint_rejects_empty_fields() {
        let issuer = issuer();
        let id = Uuid::new_v4();
        assert!(matches!(
            issuer.mint(Uuid::nil(), "a@b.c", "a", "student", None),
            Err(TokenError::InvalidArgument("sub"))
        ));
        assert!(matches!(
            issuer.mint(id, " ", "a", "student", None),
            Err(TokenError::InvalidArgument("email"))
        ));
        assert!(matches!(
            issuer.mint(id, "a@b.c", "", "student", None),
            Err(TokenError::InvalidArgument("unique_name"))
        ));
        assert!(matches!(
            issuer.mint(id, "a@b.c", "a", "", None),
            Err(TokenError::InvalidArgument("role"))
        ));
        assert!(matches!(
            issuer.mint(id, "a@b.c", "a", "student", Some(0)),
            Err(TokenError::InvalidArgument("ttl"))
        ));
    }

    #[test]
    fn ttl_is_bounded() {
        for minutes in [0, -5, MAX_ACCESS_TTL_MINUTES + 1, i64::MAX / 2, i64::MAX] {
            let config =
                TokenConfig::new(SecretString::from(SECRET)).with_access_ttl_minutes(minutes);
            assert!(
                matches!(TokenIssuer::new(config), Err(TokenError::InvalidArgument("ttl"))),
                "{minutes} accepted"
            );
            assert!(matches!(
                issuer().mint(Uuid::new_v4(), "a@b.c", "a", "student", Some(minutes)),
                Err(TokenError::InvalidArgument("ttl"))
            ));
        }

        let longest = TokenIssuer::new(
            TokenConfig::new(SecretString::from(SECRET))
                .with_access_ttl_minutes(MAX_ACCESS_TTL_MINUTES),
        )
        .expect("issuer");
        let token = longest
            .mint(Uuid::new_v4(), "a@b.c", "a", "student", None)
            .expect("mint");
        let claims = longest.verify(&token).expect("verify");
        assert_eq!(claims.exp - claims.iat, MAX_ACCESS_TTL_MINUTES * 60);
    }

    #[test]
    fn same_instant_mints_differ() {
        let issuer = issuer();
        let id = Uuid::new_v4();
        let first = issuer.mint(id, "a@b.c", "a", "student", None).expect("mint");
        let second = issuer.mint(id, "a@b.c", "a", "student", None).expect("mint");
        assert_ne!(first, second);
    }

    #[test]
    fn verify_rejects_expired() {
        let issuer = issuer();
        let token = issuer.sign(&expired_claims(&issuer)).expect("sign");
        assert!(matches!(issuer.verify(&token), Err(TokenError::Expired)));
    }

    #[test]
    fn verify_rejects_foreign_signature() {
        let issuer = issuer();
        let other = TokenIssuer::new(TokenConfig::new(SecretString::from(
            "another-secret-that-is-long-enough-1234",
        )))
        .expect("issuer");
        let token = other
            .mint(Uuid::new_v4(), "a@b.c", "a", "student", None)
            .expect("mint");
        assert!(matches!(
            issuer.verify(&token),
            Err(TokenError::InvalidSignature)
        ));
    }

    #[test]
    fn verify_rejects_issuer_and_audience_mismatch() {
        let issuer = issuer();
        let other_iss = TokenIssuer::new(
            TokenConfig::new(SecretString::from(SECRET)).with_issuer("someone-else".to_string()),
        )
        .expect("issuer");
        let other_aud = TokenIssuer::new(
            TokenConfig::new(SecretString::from(SECRET)).with_audience("mobile".to_string()),
        )
        .expect("issuer");
        let id = Uuid::new_v4();

        let token = other_iss.mint(id, "a@b.c", "a", "student", None).expect("mint");
        assert!(matches!(issuer.verify(&token), Err(TokenError::InvalidIssuer)));

        let token = other_aud.mint(id, "a@b.c", "a", "student", None).expect("mint");
        assert!(matches!(
            issuer.verify(&token),
            Err(TokenError::InvalidAudience)
        ));
    }

    #[test]
    fn decode_ignoring_expiry_accepts_expired_token() {
        let issuer = issuer();
        let claims = expired_claims(&issuer);
        let token = issuer.sign(&claims).expect("sign");
        let decoded = issuer.decode_ignoring_expiry(&token).expect("decode");
        assert_eq!(decoded, claims);
    }

    #[test]
    fn decode_ignoring_expiry_still_checks_signature_and_audience() {
        let issuer = issuer();
        let other = TokenIssuer::new(
            TokenConfig::new(SecretString::from(SECRET)).with_audience("mobile".to_string()),
        )
        .expect("issuer");
        let mut claims = expired_claims(&other);
        claims.aud = "mobile".to_string();
        let token = other.sign(&claims).expect("sign");
        assert!(matches!(
            issuer.decode_ignoring_expiry(&token),
            Err(TokenError::Unparseable)
        ));

        let mut tampered = issuer.sign(&expired_claims(&issuer)).expect("sign");
        tampered.push('x');
        assert!(matches!(
            issuer.decode_ignoring_expiry(&tampered),
            Err(TokenError::Unparseable)
        ));
        assert!(matches!(
            issuer.decode_ignoring_expiry("not-a-jwt"),
            Err(TokenError::Unparseable)
        ));
    }

    #[test]
    fn short_secret_is_rejected() {
        let result = TokenIssuer::new(TokenConfig::new(SecretString::from("short")));
        assert!(matches!(result, Err(TokenError::InvalidArgument("secret"))));
    }
}
