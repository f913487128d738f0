//! mongodump
//!
//! Streams the documents of a MongoDB deployment, database or collection
//! into BSON files, with collection metadata as JSON and an optional
//! point-in-time oplog capture.
//!
//! # Usage
//!
//! ```bash
//! # Everything except `local`, into ./dump
//! mongodump mongodb://localhost:27017
//!
//! # One database plus the oplog window, into /backups/nightly
//! mongodump mongodb://rs0.example.net:27017 --oplog -o /backups/nightly
//!
//! # One collection to stdout
//! mongodump -d app -c users -o - > users.bson
//! ```

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use mongodump::cli::CliInterface;
use mongodump::connection::{ConnectionManager, redact_uri};
use mongodump::dump::DumpOrchestrator;
use mongodump::error::Result;
use mongodump::source::LiveSource;

/// Application entry point
#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Main application logic
///
/// 1. Parse command-line arguments and load configuration
/// 2. Initialize logging
/// 3. Handle subcommands or run the dump
async fn run() -> Result<()> {
    let cli = CliInterface::new()?;

    initialize_logging(&cli);

    if cli.handle_subcommand()? {
        return Ok(());
    }

    // Option conflicts are reported before any connection is attempted.
    let options = cli.dump_options()?;
    options.validate()?;

    let uri = cli.get_connection_uri();
    let mut manager = ConnectionManager::new(uri.clone(), cli.config().connection.clone());
    manager.connect().await?;

    if let Ok(version) = manager.get_server_version().await {
        info!("Server {} running MongoDB {}", redact_uri(&uri), version);
    }

    let source = LiveSource::new(manager.get_client()?.clone(), cli.config().dump.batch_size);
    let mut orchestrator = DumpOrchestrator::new(Arc::new(source), options, cli.dump_settings());
    let outcome = orchestrator.run().await;

    manager.disconnect().await;
    outcome.map(|_| ())
}

/// Initialize logging system based on verbosity level
///
/// Logs go to stderr so that `--out -` leaves stdout for BSON only.
/// `RUST_LOG` overrides the configured level.
fn initialize_logging(cli: &CliInterface) {
    let level = cli.config().logging.level.to_tracing_level();
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if cli.config().logging.timestamps {
        subscriber.init();
    } else {
        subscriber.without_time().init();
    }
}
