//! CLI commands for the relay using clap.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::config::{load_settings, Settings};
use crate::core::RelayCoordinator;
use crate::protocol::{Envelope, SendRequest};

/// Store-and-forward relay between a polling mobile client and a core agent.
#[derive(Parser)]
#[command(name = "autsys-relay")]
#[command(version)]
#[command(about = "Durable store-and-forward relay for two polling parties", long_about = None)]
pub struct Commands {
    /// Settings file (default: ~/.autsys-relay/settings.json)
    #[arg(long, global = true, env = "AUTSYS_RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the HTTP relay
    Serve {
        /// Bind host (overrides settings)
        #[arg(long)]
        host: Option<String>,

        /// Bind port (overrides settings)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Queue a message directly on disk
    Send {
        /// Message text
        text: String,

        /// Sender party or alias
        #[arg(long)]
        from: Option<String>,

        /// Recipient party or alias (default: the sender's peer)
        #[arg(long)]
        to: Option<String>,

        /// ID of the message being answered
        #[arg(long = "reply-to")]
        reply_to: Option<String>,

        /// Message ID (generated if omitted)
        #[arg(long)]
        id: Option<String>,
    },

    /// Take messages for a party directly from disk.
    ///
    /// Stop the server first: queue locks are per process.
    Receive {
        /// Party or alias
        who: String,

        /// Drain everything instead of one message
        #[arg(long)]
        all: bool,
    },

    /// Show queue lengths
    Status,

    /// Queue operations
    Queue {
        #[command(subcommand)]
        action: QueueCommand,
    },

    /// Print the effective settings
    Config,

    /// View logs
    Logs {
        /// Only lines containing this text
        #[arg(long)]
        filter: Option<String>,

        /// Number of lines
        #[arg(long, default_value_t = 120)]
        lines: usize,
    },
}

#[derive(Subcommand)]
pub enum QueueCommand {
    /// Show queue statistics
    Stats,

    /// Count messages waiting for a party without removing them
    Peek {
        /// Party or alias
        who: String,
    },
}

impl Commands {
    /// Load settings from `--config` or the default location.
    pub fn settings(&self) -> Result<Settings> {
        load_settings(self.config.as_deref()).context("Failed to load settings")
    }

    /// Run the command.
    pub async fn run(&self, settings: Settings) -> Result<()> {
        match &self.command {
            Command::Serve { host, port } => cmd_serve(settings, host.clone(), *port).await,
            Command::Send {
                text,
                from,
                to,
                reply_to,
                id,
            } => {
                let request = SendRequest {
                    to: to.clone(),
                    from: from.clone(),
                    text: Some(text.clone()),
                    id: id.clone(),
                    correlates_with: reply_to.clone(),
                };
                cmd_send(&settings, request)
            }
            Command::Receive { who, all } => cmd_receive(&settings, who, *all),
            Command::Status => cmd_status(&settings),
            Command::Queue { action } => cmd_queue(&settings, action),
            Command::Config => cmd_config(&settings),
            Command::Logs { filter, lines } => cmd_logs(&settings, filter.as_deref(), *lines),
        }
    }
}

// Command implementations

async fn cmd_serve(mut settings: Settings, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        settings.server.host = host;
    }
    if let Some(port) = port {
        settings.server.port = port;
    }

    crate::web::run_web_server(&settings).await
}

fn cmd_send(settings: &Settings, request: SendRequest) -> Result<()> {
    let relay = RelayCoordinator::from_settings(settings)?;
    let id = relay.send(request)?;
    println!("Queued message: {}", id);
    Ok(())
}

fn cmd_receive(settings: &Settings, who: &str, all: bool) -> Result<()> {
    let relay = RelayCoordinator::from_settings(settings)?;
    if relay.routing().resolve(who).is_none() {
        anyhow::bail!("Unknown party: {}", who);
    }

    let envelopes: Vec<Envelope> = if all {
        relay.receive_all(who)
    } else {
        relay.receive(who).into_iter().collect()
    };

    if let Some(error) = relay.status().last_error {
        anyhow::bail!("{}", error.message);
    }

    if envelopes.is_empty() {
        println!("No messages for {}", who);
    }
    for envelope in &envelopes {
        println!("{}", serde_json::to_string_pretty(envelope)?);
    }
    Ok(())
}

fn cmd_status(settings: &Settings) -> Result<()> {
    let relay = RelayCoordinator::from_settings(settings)?;
    let status = relay.status();

    println!("Relay Status");
    println!("============");
    println!("Data:     {}", relay.store().base_path().display());
    println!("Parties:  {}", relay.routing().parties().join(", "));
    println!("Fallback: {}", relay.routing().fallback());
    println!();
    for (destination, len) in &status.queues {
        println!("  {:<12} {} waiting", destination, len);
    }
    println!();
    for channel in &settings.debounce.channels {
        println!(
            "Debounce: {} -> {} after {} ms quiet{}",
            channel.responder,
            channel.origin,
            channel.quiet_period_ms,
            if channel.coalesce { " (newest only)" } else { "" }
        );
    }
    if let Some(error) = &status.last_error {
        println!("Last error at {}: {}", format_ts(error.ts), error.message);
    }
    Ok(())
}

fn cmd_queue(settings: &Settings, action: &QueueCommand) -> Result<()> {
    let relay = RelayCoordinator::from_settings(settings)?;

    match action {
        QueueCommand::Stats => {
            println!("{}", relay.store().stats()?);
        }
        QueueCommand::Peek { who } => {
            let party = relay
                .routing()
                .resolve(who)
                .ok_or_else(|| anyhow::anyhow!("Unknown party: {}", who))?;
            let len = relay.store().peek_length(party)?;
            println!("{}: {} waiting", party, len);
        }
    }

    Ok(())
}

fn cmd_config(settings: &Settings) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(settings)?);
    Ok(())
}

fn cmd_logs(settings: &Settings, filter: Option<&str>, count: usize) -> Result<()> {
    let log_dir = crate::logging::resolve_log_dir(&settings.logging)?;

    let Some(file) = latest_log_file(&log_dir)? else {
        println!("No log files in {}", log_dir.display());
        return Ok(());
    };

    let content = std::fs::read_to_string(&file)?;
    let mut lines: Vec<&str> = content.lines().collect();
    if let Some(needle) = filter {
        let needle = needle.to_lowercase();
        lines.retain(|l| l.to_lowercase().contains(&needle));
    }

    let start = lines.len().saturating_sub(count);
    for line in &lines[start..] {
        println!("{}", line);
    }
    Ok(())
}

/// Newest daily log file in `dir`.
fn latest_log_file(dir: &Path) -> Result<Option<PathBuf>> {
    if !dir.exists() {
        return Ok(None);
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with("autsys-relay.log"))
        })
        .collect();

    // Daily suffixes are ISO dates, so name order is age order.
    files.sort();
    Ok(files.pop())
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}
