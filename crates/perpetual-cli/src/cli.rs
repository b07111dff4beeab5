//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Channel name used in logs
    #[arg(short, long, global = true)]
    pub name: Option<String>,

    /// Extra handshake header, repeatable (`name=value`)
    #[arg(short = 'H', long = "header", value_parser = parse_header, global = true)]
    pub headers: Vec<(String, String)>,

    /// Seconds a connection serves before a replacement is dialed
    #[arg(long, global = true)]
    pub shift_secs: Option<u64>,

    /// Seconds old and new connections overlap during rotation
    #[arg(long, global = true)]
    pub switch_secs: Option<u64>,

    /// Interval between liveness pings in milliseconds
    #[arg(long, global = true)]
    pub ping_ms: Option<u64>,

    /// Treat inbound and outbound text as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print every inbound message until interrupted
    Listen {
        /// WebSocket address (ws:// or wss://)
        url: String,
    },
    /// Send a single message once the channel is available, then exit
    Send {
        /// WebSocket address (ws:// or wss://)
        url: String,
        /// Message content
        message: String,
    },
    /// Send stdin lines and print inbound messages
    Interactive {
        /// WebSocket address (ws:// or wss://)
        url: String,
    },
}

impl Commands {
    pub fn url(&self) -> &str {
        match self {
            Commands::Listen { url } | Commands::Send { url, .. } | Commands::Interactive { url } => url,
        }
    }
}

/// Parse a `name=value` header argument
pub fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {}", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in {}", raw));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("Authorization=Bearer abc"),
            Ok(("Authorization".to_string(), "Bearer abc".to_string()))
        );
        assert_eq!(
            parse_header("x-empty="),
            Ok(("x-empty".to_string(), String::new()))
        );
        assert!(parse_header("no-separator").is_err());
        assert!(parse_header("=value").is_err());
    }

    #[test]
    fn test_cli_parses_global_options() {
        let cli = Cli::try_parse_from([
            "perpetual",
            "send",
            "ws://localhost:9000/feed",
            "hello",
            "--header",
            "X-Token=secret",
            "--shift-secs",
            "600",
        ])
        .unwrap();

        assert_eq!(cli.command.url(), "ws://localhost:9000/feed");
        assert_eq!(cli.headers, vec![("X-Token".to_string(), "secret".to_string())]);
        assert_eq!(cli.shift_secs, Some(600));
        assert!(matches!(cli.command, Commands::Send { ref message, .. } if message == "hello"));
    }
}
