#![allow(dead_code)]

use anyhow::{Context, Result};
use axum::Router;
use learnbox::{
    api,
    session::{
        Identity, IdentityStore, MemoryIdentityStore, MemoryRefreshTokenStore,
        MemoryResetCodeStore, Passwords, RevocationBroadcaster, SessionConfig, SessionService,
        TokenConfig, TokenIssuer,
    },
};
use secrecy::SecretString;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use uuid::Uuid;

pub const SECRET: &str = "integration-secret-0123456789abcdef";
pub const PASSWORD: &str = "correct-horse-1";

pub struct Harness {
    pub service: Arc<SessionService>,
    pub identities: Arc<MemoryIdentityStore>,
    pub refresh_tokens: Arc<MemoryRefreshTokenStore>,
    pub broadcaster: Arc<RevocationBroadcaster>,
    pub passwords: Passwords,
}

pub fn issuer() -> Result<Arc<TokenIssuer>> {
    Ok(Arc::new(TokenIssuer::new(TokenConfig::new(
        SecretString::from(SECRET),
    ))?))
}

pub fn cheap_passwords() -> Result<Passwords> {
    Passwords::with_params(8, 1, 1)
}

/// Service over in-memory stores with a short revocation delay.
pub fn harness() -> Result<Harness> {
    harness_with(Duration::from_secs(30))
}

pub fn harness_with(ping_interval: Duration) -> Result<Harness> {
    let identities = Arc::new(MemoryIdentityStore::new());
    let refresh_tokens = Arc::new(MemoryRefreshTokenStore::new());
    let broadcaster = Arc::new(RevocationBroadcaster::new(ping_interval));
    let passwords = cheap_passwords()?;
    let service = SessionService::new(
        issuer()?,
        identities.clone(),
        refresh_tokens.clone(),
        Arc::new(MemoryResetCodeStore::new()),
        broadcaster.clone(),
    )
    .with_config(SessionConfig::default().with_revocation_notice_delay(Duration::from_millis(20)))
    .with_passwords(passwords.clone());
    Ok(Harness {
        service: Arc::new(service),
        identities,
        refresh_tokens,
        broadcaster,
        passwords,
    })
}

impl Harness {
    /// Insert a user directly into the identity store.
    pub async fn seed_user(&self, username: &str, role: &str) -> Result<Identity> {
        let identity = Identity {
            id: Uuid::new_v4(),
            email: format!("{username}@example.com"),
            username: username.to_string(),
            phone: None,
            password_hash: self.passwords.hash(PASSWORD)?,
            role: role.to_string(),
            created_at: chrono::Utc::now(),
            last_login_at: None,
        };
        let inserted = self.identities.insert(&identity).await?;
        anyhow::ensure!(inserted, "duplicate seed user {username}");
        Ok(identity)
    }

    pub fn router(&self) -> Router {
        api::router(self.service.clone())
    }

    /// Serve the router on an ephemeral loopback port.
    pub async fn spawn_server(&self, router: Router) -> Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind test listener")?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, router.into_make_service()).await;
        });
        Ok(addr)
    }
}
