//! CLI command definitions

use clap::{Parser, Subcommand};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "duplex")]
#[command(about = "Reconnecting WebSocket client for request/response and push traffic", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Endpoint URL (ws:// or wss://)
    #[arg(long, env = "DUPLEX_URL", global = true)]
    pub url: Option<String>,

    /// Session identity sent as the `uuid` query parameter
    #[arg(long, env = "DUPLEX_IDENTITY", global = true)]
    pub identity: Option<String>,

    /// Log payloads and routing decisions
    #[arg(long, env = "DUPLEX_DEBUG", global = true)]
    pub debug: bool,

    /// Seconds between reconnection attempts
    #[arg(long, value_parser = parse_secs, global = true)]
    pub reconnect_delay: Option<Duration>,

    /// Seconds to wait for a response before giving up
    #[arg(long, value_parser = parse_secs, global = true)]
    pub timeout: Option<Duration>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send one JSON request and print the response
    ///
    /// Examples:
    ///   duplex request '{"task":"open.ping"}'
    Request {
        /// JSON object to send; its `id` field is assigned by the client
        #[arg(value_parser = parse_json)]
        payload: serde_json::Value,
    },

    /// Send a role-prefixed task and print the response
    ///
    /// Examples:
    ///   duplex call ping
    ///   duplex call --role admin stats '{"window":"1h"}'
    Call {
        /// Endpoint name, combined with the role as `<role>.<endpoint>`
        endpoint: String,

        /// JSON body
        #[arg(value_parser = parse_json, default_value = "{}")]
        body: serde_json::Value,

        /// Role prefix
        #[arg(long, default_value = "open")]
        role: String,
    },

    /// Print unsolicited messages until interrupted
    ///
    /// Examples:
    ///   duplex watch --topic priceUpdate
    ///   duplex watch --pattern '^/nft/'
    Watch {
        /// Exact `type` (or `path`) to watch (can be repeated)
        #[arg(long)]
        topic: Vec<String>,

        /// Regular expression tested against `type` and `path` (can be repeated)
        #[arg(long)]
        pattern: Vec<String>,
    },
}

fn parse_json(s: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(s).map_err(|e| format!("Invalid JSON: {}", e))
}

fn parse_secs(s: &str) -> Result<Duration, String> {
    s.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| format!("Invalid number of seconds: {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_request() {
        let cli = Cli::try_parse_from([
            "duplex",
            "--url",
            "ws://localhost:8080/ws",
            "request",
            r#"{"task":"open.ping"}"#,
        ])
        .unwrap();

        assert_eq!(cli.url.as_deref(), Some("ws://localhost:8080/ws"));
        match cli.command {
            Commands::Request { payload } => assert_eq!(payload["task"], "open.ping"),
            _ => panic!("expected request command"),
        }
    }

    #[test]
    fn test_parse_watch_patterns() {
        let cli = Cli::try_parse_from([
            "duplex", "watch", "--topic", "priceUpdate", "--pattern", "^/nft/",
        ])
        .unwrap();

        match cli.command {
            Commands::Watch { topic, pattern } => {
                assert_eq!(topic, vec!["priceUpdate"]);
                assert_eq!(pattern, vec!["^/nft/"]);
            }
            _ => panic!("expected watch command"),
        }
    }

    #[test]
    fn test_rejects_invalid_json() {
        assert!(Cli::try_parse_from(["duplex", "request", "{nope"]).is_err());
    }

    #[test]
    fn test_parse_secs() {
        assert_eq!(parse_secs("5"), Ok(Duration::from_secs(5)));
        assert!(parse_secs("soon").is_err());
    }
}
