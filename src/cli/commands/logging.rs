use clap::{builder::ValueParser, Arg, ArgAction, Command};

pub const ARG_VERBOSITY: &str = "verbosity";

/// Level names in verbosity order; the index is the `-v` count.
pub const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

fn parse_level(raw: &str) -> Result<u8, String> {
    let raw = raw.trim();
    if let Ok(count) = raw.parse::<u8>() {
        return u8::try_from(LEVELS.len() - 1)
            .map(|max| count.min(max))
            .map_err(|err| err.to_string());
    }
    LEVELS
        .iter()
        .position(|level| level.eq_ignore_ascii_case(raw))
        .and_then(|index| u8::try_from(index).ok())
        .ok_or_else(|| format!("invalid log level '{raw}', expected one of {LEVELS:?}"))
}

/// Accepts a count (`0`-`4`, larger values clamp to trace) or a level name.
#[must_use]
pub fn validator_log_level() -> ValueParser {
    ValueParser::from(parse_level)
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new(ARG_VERBOSITY)
            .short('v')
            .long("verbose")
            .help("Log verbosity, repeat for more (-v warn ... -vvvv trace); default: error")
            .env("LEARNBOX_LOG_LEVEL")
            .global(true)
            .action(ArgAction::Count)
            .value_parser(validator_log_level()),
    )
}
