//! beacon - command line for a local event queue
//!
//! This tool provides commands for:
//! - Checking queue configuration and backlog
//! - Queueing events by hand
//! - Flushing queued events to the collector
//! - Fetching remote configuration
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/beacon/queue.db (~/.local/share/beacon/queue.db)
//! - Logs: $XDG_STATE_HOME/beacon/beacon.log (~/.local/state/beacon/beacon.log)
//! - Config: $XDG_CONFIG_HOME/beacon/config.toml (~/.config/beacon/config.toml)

use anyhow::{Context, Result};
use beacon_core::{
    Config, ConfigHandler, Database, Environment, EventQueue, EventStore, HostEnvironment,
};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "beacon")]
#[command(about = "Durable, debounced event delivery")]
#[command(version)]
struct Args {
    /// Verbose output (write logs to the state directory)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show queue configuration and backlog
    Status,

    /// Queue one event
    Track {
        /// Event kind, e.g. "track" or "track_signup"
        kind: String,

        /// Event payload as JSON
        #[arg(short, long, default_value = "{}")]
        data: String,

        /// Flush right away instead of leaving the event queued
        #[arg(long)]
        now: bool,
    },

    /// Upload every queued event
    Flush,

    /// Fetch remote configuration and print it
    CheckConfig,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Keep the guard alive for the whole run so buffered lines are written
    let _log_guard = if args.verbose {
        Some(beacon_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Track { kind, data, now } => cmd_track(&config, &kind, &data, now),
        Command::Flush => cmd_flush(&config),
        Command::CheckConfig => cmd_check_config(&config),
    }
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("Beacon Queue Configuration");
    println!("==========================");
    println!();

    let queue = &config.queue;

    println!(
        "Server URL:      {}",
        queue.server_url.as_deref().unwrap_or("<not set>")
    );
    println!(
        "Config URL:      {}",
        queue.config_url.as_deref().unwrap_or("<not set>")
    );
    println!("Batch Size:      {}", queue.effective_batch_size());
    println!("Bulk Threshold:  {}", queue.flush_bulk_size);
    println!("Flush Interval:  {}ms", queue.flush_interval_ms);
    println!("Capacity:        {}", queue.max_entries);
    println!("Timeout:         {}s", queue.timeout_secs);
    println!(
        "Verification:    {}",
        match (queue.verification_mode, queue.dry_run()) {
            (false, _) => "off",
            (true, true) => "on (dry run)",
            (true, false) => "on (write through)",
        }
    );

    println!();
    if queue.is_ready() {
        println!("Status: Ready to upload");
    } else {
        println!("Status: Not ready (server_url is not set)");
    }

    let db_path = Config::database_path();
    println!();
    println!("Database:        {}", db_path.display());
    if db_path.exists() {
        let db = Database::open(&db_path).context("failed to open database")?;
        db.migrate().context("failed to run database migrations")?;
        println!("Backlog:         {}", db.backlog()?);

        let environment =
            HostEnvironment::detect(&db_path).context("failed to check primary process")?;
        println!(
            "Primary:         {}",
            if environment.is_primary_process() {
                "yes"
            } else {
                "no (another process holds the queue)"
            }
        );
    } else {
        println!("Backlog:         0");
    }

    Ok(())
}

fn open_queue(config: &Config) -> Result<EventQueue> {
    let db_path = Config::database_path();
    tracing::info!(path = %db_path.display(), "Opening event queue");
    EventQueue::open(&config.queue, &db_path).context("failed to open event queue")
}

fn cmd_track(config: &Config, kind: &str, data: &str, now: bool) -> Result<()> {
    let data: Value = serde_json::from_str(data).context("--data is not valid JSON")?;

    let queue = open_queue(config)?;
    queue
        .track(kind, data)
        .with_context(|| format!("failed to queue {kind} event"))?;
    if now {
        queue.flush();
    }
    queue.shutdown();

    let stats = queue.stats();
    println!("Queued {} event", kind);
    if stats.uploads > 0 {
        println!(
            "Delivered:       {} ({} discarded)",
            stats.events_delivered, stats.events_discarded
        );
    }
    println!("Backlog:         {}", queue.backlog()?);

    Ok(())
}

fn cmd_flush(config: &Config) -> Result<()> {
    if !config.queue.is_ready() {
        println!("No server_url configured. Run 'status' for details.");
        return Ok(());
    }

    let queue = open_queue(config)?;
    let before = queue.backlog()?;
    if before == 0 {
        println!("Nothing to flush");
        return Ok(());
    }

    println!("Flushing {} event(s)...", before);
    queue.flush();
    queue.shutdown();

    let stats = queue.stats();
    let remaining = queue.backlog()?;

    println!();
    println!("Flush complete:");
    println!("  Uploads:     {}", stats.uploads);
    println!("  Delivered:   {}", stats.events_delivered);
    println!("  Discarded:   {}", stats.events_discarded);
    println!("  Remaining:   {}", remaining);

    if let Some(reason) = stats.last_skip {
        println!();
        println!("Flush skipped: {reason}.");
    } else if remaining > 0 {
        println!();
        println!("Some events were kept for a later flush. Check the logs with --verbose.");
    }

    Ok(())
}

/// Prints remote configuration as it arrives
#[derive(Default)]
struct PrintingHandler {
    received: AtomicBool,
}

impl ConfigHandler for PrintingHandler {
    fn set_event_bindings(&self, bindings: Vec<Value>) {
        println!("Event bindings:  {}", bindings.len());
        for binding in &bindings {
            println!("  {}", binding);
        }
    }

    fn set_remote_server_url(&self, url: &str) {
        self.received.store(true, Ordering::SeqCst);
        println!(
            "Remote server:   {}",
            if url.is_empty() { "<not set>" } else { url }
        );
    }
}

fn cmd_check_config(config: &Config) -> Result<()> {
    if config.queue.config_url.is_none() {
        println!("No config_url configured. Run 'status' for details.");
        return Ok(());
    }

    let queue = open_queue(config)?;
    let handler = Arc::new(PrintingHandler::default());
    queue.check_config(handler.clone());
    queue.shutdown();

    if !handler.received.load(Ordering::SeqCst) {
        println!("No configuration received. Check the logs with --verbose.");
    }

    Ok(())
}
