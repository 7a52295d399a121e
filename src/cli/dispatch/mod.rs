//! Map parsed command-line arguments to the action to run.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::{session, ARG_DSN, ARG_IN_MEMORY, ARG_PORT};
use anyhow::{bail, Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let in_memory = matches.get_flag(ARG_IN_MEMORY);
    let dsn = matches.get_one::<String>(ARG_DSN).cloned();
    if dsn.is_none() && !in_memory {
        bail!("missing required argument: --dsn");
    }

    let session = session::Options::parse(matches).context("invalid session options")?;

    Ok(Action::Server(Args {
        port,
        dsn,
        in_memory,
        session,
    }))
}
