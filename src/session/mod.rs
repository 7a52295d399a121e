//! Session lifecycle core.
//!
//! Framework independent: the HTTP surface in [`crate::api`] and the CLI only
//! wire these types together. Persistence sits behind the store traits so the
//! same [`SessionService`] runs against Postgres or the in-memory stores.

pub mod broadcaster;
pub mod credentials;
pub mod error;
pub mod identity;
pub mod notifier;
pub mod password;
pub mod postgres;
pub mod recovery;
pub mod service;
pub mod token;

pub use self::broadcaster::{RevocationBroadcaster, SessionEvent, Subscription};
pub use self::credentials::{CredentialStore, MemoryRefreshTokenStore, RefreshToken, RefreshTokenStore};
pub use self::error::{SessionError, SessionResult};
pub use self::identity::{Identity, IdentityStore, MemoryIdentityStore, UserProfile};
pub use self::notifier::{LogNotifier, Notifier};
pub use self::password::Passwords;
pub use self::postgres::{PgIdentityStore, PgRefreshTokenStore, PgResetCodeStore};
pub use self::recovery::{MemoryResetCodeStore, ResetCodeStore};
pub use self::service::{IssuedSession, PasswordReset, Registration, SessionConfig, SessionService};
pub use self::token::{AccessClaims, TokenConfig, TokenError, TokenIssuer};
