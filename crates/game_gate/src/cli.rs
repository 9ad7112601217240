//! Command-line interface handling for the game gate.
//!
//! Options given here override the matching configuration file settings.

use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the HTTP bind address
    pub http_address: Option<String>,
    /// Optional override for the socket bind address
    pub socket_address: Option<String>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
}

/// The clap definition of the command line.
pub fn command() -> Command {
    Command::new("Game Gate")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Request/reply game service over HTTP and WebSocket sessions")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .arg(
            Arg::new("http")
                .long("http")
                .value_name("ADDRESS")
                .help("HTTP bind address (e.g., 127.0.0.1:8080)"),
        )
        .arg(
            Arg::new("socket")
                .long("socket")
                .value_name("ADDRESS")
                .help("Socket bind address (e.g., 127.0.0.1:8081)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(clap::ArgAction::SetTrue),
        )
}

impl CliArgs {
    /// Parses the process arguments, exiting with usage on error.
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    pub fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.toml")),
            http_address: matches.get_one::<String>("http").cloned(),
            socket_address: matches.get_one::<String>("socket").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}
