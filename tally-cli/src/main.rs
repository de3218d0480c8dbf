//! tally - command-line front end for the tally tracking client
//!
//! This tool provides commands for:
//! - Checking client configuration and queue status
//! - Tracking events and managing identity and super properties
//! - Flushing queued events to the ingestion endpoint
//!
//! Uses XDG Base Directory specification for file locations:
//! - Snapshots: $XDG_DATA_HOME/tally/ (~/.local/share/tally/)
//! - Config: $XDG_CONFIG_HOME/tally/config.toml (~/.config/tally/config.toml)
//! - Logs: $XDG_STATE_HOME/tally/ (~/.local/state/tally/)

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tally_core::persistence::FileStore;
use tally_core::{ClientOptions, Config, Properties, Tally, Value};

/// How long a command waits for the worker to flush or archive.
const WAIT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Track events and manage the local tally queue")]
#[command(version)]
struct Args {
    /// Verbose output (writes logs to the state directory)
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: $XDG_CONFIG_HOME/tally/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show client configuration and queue status
    Status,

    /// Queue an event
    Track {
        /// Event name
        event: String,

        /// Event property as key=value (repeatable; JSON values are parsed)
        #[arg(short, long = "property", value_name = "KEY=VALUE")]
        properties: Vec<String>,

        /// Flush right after queueing
        #[arg(short, long)]
        flush: bool,
    },

    /// Attribute future events to a distinct id
    Identify { distinct_id: String },

    /// Link an alias to a distinct id
    Alias {
        alias: String,

        /// Distinct id to link to (default: the current one)
        distinct_id: Option<String>,
    },

    /// Register super properties sent with every event
    Register {
        /// Only set properties that are not registered yet
        #[arg(long)]
        once: bool,

        #[arg(value_name = "KEY=VALUE", required = true)]
        properties: Vec<String>,
    },

    /// Remove a super property
    Unregister { name: String },

    /// Start timing an event
    Time { event: String },

    /// Track a push notification payload (JSON object)
    Push { payload: String },

    /// Send queued events now
    Flush,

    /// Forget identity, super properties, timers and queued events
    Reset,
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    // Initialize logging if verbose
    let _log_guard = if args.verbose {
        Some(tally_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Track {
            event,
            properties,
            flush,
        } => cmd_track(&config, event, &properties, flush),
        Command::Identify { distinct_id } => with_client(&config, |tally| {
            tally.identify(distinct_id);
            Ok(())
        }),
        Command::Alias { alias, distinct_id } => with_client(&config, |tally| {
            let distinct_id = match distinct_id {
                Some(id) => id,
                None => tally.distinct_id()?,
            };
            tally.create_alias(alias, distinct_id);
            Ok(())
        }),
        Command::Register { once, properties } => {
            let props = parse_properties(&properties)?;
            with_client(&config, |tally| {
                if once {
                    tally.register_super_properties_once(props, None);
                } else {
                    tally.register_super_properties(props);
                }
                Ok(())
            })
        }
        Command::Unregister { name } => with_client(&config, |tally| {
            tally.unregister_super_property(name);
            Ok(())
        }),
        Command::Time { event } => with_client(&config, |tally| {
            tally.time_event(event);
            Ok(())
        }),
        Command::Push { payload } => {
            let payload = parse_object(&payload)?;
            with_client(&config, |tally| {
                tally.track_push_notification(payload);
                Ok(())
            })
        }
        Command::Flush => cmd_flush(&config),
        Command::Reset => with_client(&config, |tally| {
            tally.reset();
            println!("Client state reset.");
            Ok(())
        }),
    }
}

fn start_client(config: &Config) -> Result<Tally> {
    if !config.client.is_ready() {
        bail!(
            "client.token is not set. Add it to {}:\n\n  [client]\n  token = \"your-project-token\"",
            Config::config_path().display()
        );
    }
    let options = ClientOptions::from_config(&config.client).context("invalid client config")?;
    Tally::builder(options)
        .build()
        .context("failed to start client")
}

/// Run `f` against a client, then persist the result before exiting.
fn with_client(config: &Config, f: impl FnOnce(&Tally) -> Result<()>) -> Result<()> {
    let tally = start_client(config)?;
    f(&tally)?;
    tally
        .archive_and_wait(WAIT)
        .context("failed to save client state")?;
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("Tally Client Configuration");
    println!("==========================");
    println!();

    let client = &config.client;

    println!(
        "Token:           {}",
        if client.token.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!("Server URL:      {}", client.server_url);
    println!("Flush interval:  {}s", client.flush_interval_secs);
    println!("Batch size:      {}", client.batch_size);
    println!("Max queue size:  {}", client.max_queue_size);
    println!("Config file:     {}", Config::config_path().display());
    println!(
        "Log file:        {}",
        tally_core::logging::log_file_path().display()
    );

    let Some(token) = client.token.as_deref() else {
        println!();
        println!("Client is not configured. Add a token to config.toml:");
        println!();
        println!("  [client]");
        println!("  token = \"your-project-token\"");
        return Ok(());
    };

    println!(
        "Snapshot:        {}",
        FileStore::for_token(&Config::data_dir(), token)
            .path()
            .display()
    );
    println!();

    let tally = start_client(config)?;
    println!("Distinct ID:     {}", tally.distinct_id()?);
    println!("Queued events:   {}", tally.queued_count()?);

    let supers = tally.current_super_properties()?;
    if !supers.is_empty() {
        println!();
        println!("Super properties:");
        for (key, value) in &supers {
            println!("  {} = {}", key, value.to_json());
        }
    }

    Ok(())
}

fn cmd_track(config: &Config, event: String, properties: &[String], flush: bool) -> Result<()> {
    let props = parse_properties(properties)?;
    with_client(config, |tally| {
        tally.track_with_properties(event.clone(), props);
        println!("Queued '{}'.", event);
        if flush {
            print_report(&tally.flush_and_wait(WAIT)?);
        }
        Ok(())
    })
}

fn cmd_flush(config: &Config) -> Result<()> {
    with_client(config, |tally| {
        let queued = tally.queued_count()?;
        if queued == 0 {
            println!("No queued events.");
            return Ok(());
        }
        println!("Flushing {} queued events...", queued);
        print_report(&tally.flush_and_wait(WAIT)?);
        Ok(())
    })
}

fn print_report(report: &tally_core::FlushReport) {
    if report.deferred {
        println!("Flush deferred.");
        return;
    }
    println!("  Delivered: {}", report.acknowledged);
    if report.dropped > 0 {
        println!("  Dropped:   {} (rejected by server)", report.dropped);
    }
    if report.requeued > 0 {
        println!("  Requeued:  {}", report.requeued);
    }
    if let Some(delay) = report.backing_off {
        println!("  Next automatic attempt in {}s", delay.as_secs());
    }
}

/// Parse `key=value` pairs; values that are valid JSON keep their type.
fn parse_properties(pairs: &[String]) -> Result<Properties> {
    pairs
        .iter()
        .map(|pair| {
            let (key, raw) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("expected KEY=VALUE, got '{}'", pair))?;
            if key.is_empty() {
                bail!("property name must not be empty in '{}'", pair);
            }
            let value = serde_json::from_str::<serde_json::Value>(raw)
                .map(Value::from)
                .unwrap_or_else(|_| Value::from(raw));
            Ok((key.to_string(), value))
        })
        .collect()
}

fn parse_object(json: &str) -> Result<Properties> {
    let parsed: serde_json::Value =
        serde_json::from_str(json).context("payload is not valid JSON")?;
    match Value::from(parsed) {
        Value::Map(map) => Ok(map),
        _ => bail!("payload must be a JSON object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_properties_types() {
        let props = parse_properties(&[
            "plan=pro".to_string(),
            "seats=3".to_string(),
            "trial=false".to_string(),
            "note=a=b".to_string(),
        ])
        .unwrap();

        assert_eq!(props["plan"], Value::from("pro"));
        assert_eq!(props["seats"], Value::Int(3));
        assert_eq!(props["trial"], Value::Bool(false));
        assert_eq!(props["note"], Value::from("a=b"));
    }

    #[test]
    fn test_parse_properties_rejects_malformed() {
        assert!(parse_properties(&["novalue".to_string()]).is_err());
        assert!(parse_properties(&["=x".to_string()]).is_err());
    }

    #[test]
    fn test_parse_object() {
        let map = parse_object(r#"{"mp": {"m": 1, "c": 2}}"#).unwrap();
        assert!(map.contains_key("mp"));
        assert!(parse_object("[1, 2]").is_err());
    }
}
