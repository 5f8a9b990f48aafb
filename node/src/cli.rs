//! # CLI Interface
//!
//! Command-line arguments for `paynode`, built with `clap` derive. Two
//! subcommands: `serve` runs the API, `check` validates config files without
//! starting anything.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// paynode payment-channel node.
///
/// Hosts user sessions over a state-channel protocol client and exposes them
/// through an HTTP/WebSocket API.
#[derive(Parser, Debug)]
#[command(
    name = "paynode",
    about = "Payment-channel node with an HTTP/WebSocket API",
    version,
    propagate_version = true
)]
pub struct PaynodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the API server.
    Serve(ServeArgs),
    /// Validate a node config and, optionally, session configs.
    Check(CheckArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `serve` subcommand.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Path to the node configuration file (JSON).
    ///
    /// Defaults are used for every field when omitted.
    #[arg(long, short = 'c', env = "PAYNODE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port for the HTTP/WebSocket API. Overrides `api_port` in the config.
    #[arg(long, short = 'p', env = "PAYNODE_PORT")]
    pub port: Option<u16>,

    /// Log output format: `pretty` or `json`.
    #[arg(long, env = "PAYNODE_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

/// Arguments for the `check` subcommand.
#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Path to the node configuration file (JSON).
    #[arg(long, short = 'c', env = "PAYNODE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Session configuration files to validate.
    #[arg(long = "session", short = 's')]
    pub sessions: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        PaynodeCli::command().debug_assert();
    }

    #[test]
    fn serve_accepts_port_override() {
        let cli = PaynodeCli::try_parse_from(["paynode", "serve", "--port", "6000"]).unwrap();
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.port, Some(6000));
                assert_eq!(args.log_format, "pretty");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn check_collects_session_files() {
        let cli =
            PaynodeCli::try_parse_from(["paynode", "check", "-s", "a.json", "-s", "b.json"]).unwrap();
        match cli.command {
            Commands::Check(args) => assert_eq!(args.sessions.len(), 2),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
