//! # Learnbox (session lifecycle service)
//!
//! `learnbox` issues, rotates and revokes the sessions of the Learnbox
//! e-learning platform.
//!
//! ## Credentials
//!
//! A session is a pair: a short-lived signed access token (HS256 JWT, never
//! stored server-side) and a long-lived opaque refresh token whose SHA-512
//! digest is the only thing persisted. Rotation trades an expired access
//! token plus an active refresh token for a new access token.
//!
//! ## Revocation
//!
//! Administrators revoke every refresh token of a user. Access tokens already
//! issued stay valid until they expire, so connected clients are also told
//! over a server-sent events stream (`/session-events`) to drop their state.
//! That stream is process-local.
//!
//! ## Client
//!
//! [`client::SessionAgent`] is the consumer side: it persists the pair, rotates
//! once on a 401 and retries the failed request once, and clears itself when a
//! revocation notice arrives.

pub mod api;
pub mod cli;
pub mod client;
pub mod session;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
