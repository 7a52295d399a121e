use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

use crate::session::{
    credentials::MAX_REFRESH_TTL_DAYS, recovery::MAX_RESET_CODE_TTL_MINUTES,
    token::MAX_ACCESS_TTL_MINUTES,
};

pub const ARG_JWT_SECRET: &str = "jwt-secret";
pub const ARG_JWT_ISSUER: &str = "jwt-issuer";
pub const ARG_JWT_AUDIENCE: &str = "jwt-audience";
pub const ARG_ACCESS_TTL: &str = "access-token-ttl-minutes";
pub const ARG_REFRESH_TTL: &str = "refresh-token-ttl-days";
pub const ARG_NOTICE_DELAY: &str = "revocation-notice-delay-ms";
pub const ARG_PING_SECONDS: &str = "session-ping-seconds";
pub const ARG_RESET_TTL: &str = "reset-code-ttl-minutes";
pub const ARG_RESET_ATTEMPTS: &str = "reset-code-max-attempts";
pub const ARG_FRONTEND_BASE_URL: &str = "frontend-base-url";

/// Session and token settings parsed from the command line.
#[derive(Debug)]
pub struct Options {
    pub jwt_secret: SecretString,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub access_token_ttl_minutes: i64,
    pub refresh_token_ttl_days: i64,
    pub revocation_notice_delay_ms: u64,
    pub session_ping_seconds: u64,
    pub reset_code_ttl_minutes: i64,
    pub reset_code_max_attempts: i32,
    pub frontend_base_url: String,
}

impl Options {
    /// # Errors
    /// Returns an error if a required argument is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let jwt_secret = matches
            .get_one::<String>(ARG_JWT_SECRET)
            .map(|secret| SecretString::from(secret.as_str()))
            .context("missing required argument: --jwt-secret")?;
        let string = |id: &str| matches.get_one::<String>(id).cloned().unwrap_or_default();
        Ok(Self {
            jwt_secret,
            jwt_issuer: string(ARG_JWT_ISSUER),
            jwt_audience: string(ARG_JWT_AUDIENCE),
            access_token_ttl_minutes: matches.get_one::<i64>(ARG_ACCESS_TTL).copied().unwrap_or(60),
            refresh_token_ttl_days: matches.get_one::<i64>(ARG_REFRESH_TTL).copied().unwrap_or(7),
            revocation_notice_delay_ms: matches
                .get_one::<u64>(ARG_NOTICE_DELAY)
                .copied()
                .unwrap_or(1000),
            session_ping_seconds: matches.get_one::<u64>(ARG_PING_SECONDS).copied().unwrap_or(30),
            reset_code_ttl_minutes: matches.get_one::<i64>(ARG_RESET_TTL).copied().unwrap_or(60),
            reset_code_max_attempts: matches
                .get_one::<i32>(ARG_RESET_ATTEMPTS)
                .copied()
                .unwrap_or(5),
            frontend_base_url: string(ARG_FRONTEND_BASE_URL),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_token_args(command);
    with_lifecycle_args(command)
}

fn with_token_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_JWT_SECRET)
                .long(ARG_JWT_SECRET)
                .help("Shared HS256 secret for access tokens (at least 32 bytes)")
                .env("LEARNBOX_JWT_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_JWT_ISSUER)
                .long(ARG_JWT_ISSUER)
                .help("Access token issuer")
                .env("LEARNBOX_JWT_ISSUER")
                .default_value("learnbox"),
        )
        .arg(
            Arg::new(ARG_JWT_AUDIENCE)
                .long(ARG_JWT_AUDIENCE)
                .help("Access token audience")
                .env("LEARNBOX_JWT_AUDIENCE")
                .default_value("learnbox-web"),
        )
        .arg(
            Arg::new(ARG_ACCESS_TTL)
                .long(ARG_ACCESS_TTL)
                .help("Access token lifetime in minutes")
                .env("LEARNBOX_ACCESS_TOKEN_TTL_MINUTES")
                .default_value("60")
                .value_parser(clap::value_parser!(i64).range(1..=MAX_ACCESS_TTL_MINUTES)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TTL)
                .long(ARG_REFRESH_TTL)
                .help("Refresh token lifetime in days")
                .env("LEARNBOX_REFRESH_TOKEN_TTL_DAYS")
                .default_value("7")
                .value_parser(clap::value_parser!(i64).range(1..=MAX_REFRESH_TTL_DAYS)),
        )
}

fn with_lifecycle_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_NOTICE_DELAY)
                .long(ARG_NOTICE_DELAY)
                .help("Delay before pushing a revocation notice, in milliseconds")
                .env("LEARNBOX_REVOCATION_NOTICE_DELAY_MS")
                .default_value("1000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_PING_SECONDS)
                .long(ARG_PING_SECONDS)
                .help("Heartbeat interval of session event streams, in seconds")
                .env("LEARNBOX_SESSION_PING_SECONDS")
                .default_value("30")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_RESET_TTL)
                .long(ARG_RESET_TTL)
                .help("Password reset code lifetime in minutes")
                .env("LEARNBOX_RESET_CODE_TTL_MINUTES")
                .default_value("60")
                .value_parser(clap::value_parser!(i64).range(1..=MAX_RESET_CODE_TTL_MINUTES)),
        )
        .arg(
            Arg::new(ARG_RESET_ATTEMPTS)
                .long(ARG_RESET_ATTEMPTS)
                .help("Wrong guesses before a reset code is burned")
                .env("LEARNBOX_RESET_CODE_MAX_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(i32).range(1..)),
        )
        .arg(
            Arg::new(ARG_FRONTEND_BASE_URL)
                .long(ARG_FRONTEND_BASE_URL)
                .help("Frontend base URL, allowed as CORS origin")
                .env("LEARNBOX_FRONTEND_BASE_URL")
                .default_value("http://localhost:3000"),
        )
}
