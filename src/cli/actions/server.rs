use crate::{
    api,
    cli::commands::session::Options,
    session::{
        IdentityStore, MemoryIdentityStore, MemoryRefreshTokenStore, MemoryResetCodeStore,
        PgIdentityStore, PgRefreshTokenStore, PgResetCodeStore, RefreshTokenStore,
        ResetCodeStore, RevocationBroadcaster, SessionConfig, SessionService, TokenConfig,
        TokenIssuer,
    },
};
use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub in_memory: bool,
    pub session: Options,
}

type Stores = (
    Arc<dyn IdentityStore>,
    Arc<dyn RefreshTokenStore>,
    Arc<dyn ResetCodeStore>,
);

/// Execute the server action.
/// # Errors
/// Returns an error if the token configuration is invalid, the database is
/// unreachable, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let options = args.session;

    let tokens = TokenIssuer::new(
        TokenConfig::new(options.jwt_secret)
            .with_issuer(options.jwt_issuer)
            .with_audience(options.jwt_audience)
            .with_access_ttl_minutes(options.access_token_ttl_minutes),
    )
    .context("invalid access token configuration")?;

    let config = SessionConfig::default()
        .with_refresh_ttl_days(options.refresh_token_ttl_days)
        .with_revocation_notice_delay(Duration::from_millis(options.revocation_notice_delay_ms))
        .with_reset_code_ttl_minutes(options.reset_code_ttl_minutes)
        .with_reset_max_attempts(options.reset_code_max_attempts);
    config.validate().context("invalid session configuration")?;

    let (identities, refresh_tokens, reset_codes) = match args.dsn {
        Some(dsn) if !args.in_memory => postgres_stores(&dsn).await?,
        _ => {
            warn!("using in-memory stores; all users and sessions are lost on restart");
            memory_stores()
        }
    };

    let broadcaster = Arc::new(RevocationBroadcaster::new(Duration::from_secs(
        options.session_ping_seconds,
    )));

    let service = SessionService::new(
        Arc::new(tokens),
        identities,
        refresh_tokens,
        reset_codes,
        broadcaster,
    )
    .with_config(config);

    info!(
        access_ttl_minutes = options.access_token_ttl_minutes,
        refresh_ttl_days = options.refresh_token_ttl_days,
        "session service configured"
    );

    api::new(args.port, Arc::new(service), &options.frontend_base_url).await
}

async fn postgres_stores(dsn: &str) -> Result<Stores> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(dsn)
        .await
        .context("Failed to connect to database")?;

    Ok((
        Arc::new(PgIdentityStore::new(pool.clone())),
        Arc::new(PgRefreshTokenStore::new(pool.clone())),
        Arc::new(PgResetCodeStore::new(pool)),
    ))
}

fn memory_stores() -> Stores {
    (
        Arc::new(MemoryIdentityStore::new()),
        Arc::new(MemoryRefreshTokenStore::new()),
        Arc::new(MemoryResetCodeStore::new()),
    )
}
