//! Command handlers for the perpetual CLI

use std::sync::Arc;
use std::time::Duration;

use perpetual_core::{
    ChannelHandler, DialRequest, HandlerBuilder, Message, PerpetualChannel, Scheduler, SocketError,
};
use perpetual_tungstenite::TungsteniteTransport;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use crate::cli::{Cli, Commands};
use crate::config::CliAppConfig;
use crate::error::{CliError, Result};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command on the given scheduler
    pub async fn execute(cli: Cli, config: CliAppConfig, scheduler: Scheduler) -> Result<()> {
        let request = dial_request(cli.command.url(), &cli.headers);
        match cli.command {
            Commands::Listen { .. } => Self::handle_listen(request, &config, &scheduler).await,
            Commands::Send { message, .. } => {
                Self::handle_send(request, message, &config, &scheduler).await
            }
            Commands::Interactive { .. } => {
                Self::handle_interactive(request, &config, &scheduler).await
            }
        }
    }

    /// Print inbound messages until Ctrl+C
    async fn handle_listen(
        request: DialRequest,
        config: &CliAppConfig,
        scheduler: &Scheduler,
    ) -> Result<()> {
        let address = request.address.clone();
        let channel = open_channel(request, config, scheduler)?;
        info!("Listening on {} (Ctrl+C to stop)", address);

        tokio::signal::ctrl_c().await?;
        shutdown(&channel, config).await;
        Ok(())
    }

    /// Send one message once the channel is available
    async fn handle_send(
        request: DialRequest,
        message: String,
        config: &CliAppConfig,
        scheduler: &Scheduler,
    ) -> Result<()> {
        let outgoing = outgoing(&message, config.cli.json)?;
        let channel = open_channel(request, config, scheduler)?;

        let startup = Duration::from_secs(config.runtime.startup_timeout_secs);
        let sent = match wait_until_available(&channel, startup).await {
            Ok(()) => channel.send_message(outgoing).await.map_err(CliError::from),
            Err(err) => Err(err),
        };

        shutdown(&channel, config).await;
        sent?;
        println!("Message sent");
        Ok(())
    }

    /// Send stdin lines, print inbound messages
    async fn handle_interactive(
        request: DialRequest,
        config: &CliAppConfig,
        scheduler: &Scheduler,
    ) -> Result<()> {
        let channel = open_channel(request, config, scheduler)?;
        println!("Type a message and press enter. /status shows channel state, /quit exits.");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();
        loop {
            stdout.write_all(config.cli.prompt.as_bytes()).await?;
            stdout.flush().await?;

            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else {
                break;
            };

            match line.trim() {
                "" => continue,
                "/quit" => break,
                "/status" => {
                    let stats = channel.stats().await?;
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
                text => {
                    let sent = match outgoing(text, config.cli.json) {
                        Ok(message) => channel.send_message(message).await.map_err(CliError::from),
                        Err(err) => Err(err),
                    };
                    if let Err(err) = sent {
                        eprintln!("Send failed: {}", err);
                    }
                }
            }
        }

        shutdown(&channel, config).await;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn dial_request(url: &str, headers: &[(String, String)]) -> DialRequest {
    headers
        .iter()
        .fold(DialRequest::new(url), |request, (name, value)| {
            request.header(name.clone(), value.clone())
        })
}

fn open_channel(
    request: DialRequest,
    config: &CliAppConfig,
    scheduler: &Scheduler,
) -> Result<PerpetualChannel> {
    let transport = Arc::new(TungsteniteTransport::new(config.transport_config(), scheduler));
    let channel = PerpetualChannel::builder(request)
        .config(config.channel_config())
        .handler(printer(config.cli.json))
        .build(scheduler, transport)?;
    Ok(channel)
}

/// Consumer printing every message on stdout
fn printer(json: bool) -> Arc<dyn ChannelHandler> {
    let builder = HandlerBuilder::<PerpetualChannel>::new()
        .on_available(|channel| {
            info!(channel = %channel.name(), "Channel available");
            Ok(None)
        })
        .on_message(|_, message| {
            print_message(&message)?;
            Ok(None)
        })
        .on_unavailable(|channel| {
            warn!(channel = %channel.name(), "Channel unavailable, reconnecting");
            Ok(None)
        });

    if json {
        builder.json().build()
    } else {
        builder.build()
    }
}

fn print_message(message: &Message) -> anyhow::Result<()> {
    match message {
        Message::Text(text) => println!("{}", text),
        Message::Binary(data) => println!("<{} bytes>", data.len()),
        Message::Json(value) => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn outgoing(text: &str, json: bool) -> Result<Message> {
    if json {
        Ok(Message::Json(serde_json::from_str(text)?))
    } else {
        Ok(Message::from(text))
    }
}

async fn wait_until_available(channel: &PerpetualChannel, limit: Duration) -> Result<()> {
    let mut connections = channel.subscribe_connections();
    let available = async {
        while !channel.is_connected() {
            if connections.changed().await.is_err() {
                break;
            }
        }
    };

    tokio::time::timeout(limit, available).await.map_err(|_| {
        CliError::Timeout(format!(
            "channel {} not available after {:?}",
            channel.name(),
            limit
        ))
    })?;

    if channel.is_connected() {
        Ok(())
    } else {
        Err(SocketError::illegal_state("Not connected").into())
    }
}

async fn shutdown(channel: &PerpetualChannel, config: &CliAppConfig) {
    let limit = Duration::from_secs(config.runtime.shutdown_timeout_secs);
    if tokio::time::timeout(limit, channel.close()).await.is_err() {
        warn!(channel = %channel.name(), "Channel did not close in time");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dial_request_carries_headers() {
        let headers = vec![
            ("Authorization".to_string(), "Bearer abc".to_string()),
            ("X-Client".to_string(), "cli".to_string()),
        ];
        let request = dial_request("ws://localhost/feed", &headers);
        assert_eq!(request.address, "ws://localhost/feed");
        assert_eq!(request.header_value("authorization"), Some("Bearer abc"));
        assert_eq!(request.header_value("x-client"), Some("cli"));
    }

    #[test]
    fn test_outgoing_message_encoding() {
        assert_eq!(outgoing("hi", false).unwrap(), Message::Text("hi".into()));
        assert_eq!(
            outgoing(r#"{"op":"ping"}"#, true).unwrap(),
            Message::Json(json!({ "op": "ping" }))
        );
        assert!(matches!(
            outgoing("not json", true),
            Err(CliError::Serialization(_))
        ));
    }
}
