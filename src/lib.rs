//! mongodump library
//!
//! Point-in-time streaming backup of a MongoDB deployment into a directory
//! of BSON files with JSON metadata, optionally including the oplog
//! entries written while the dump ran.
//!
//! # Modules
//!
//! - `cli`: Command-line interface and argument parsing
//! - `config`: Configuration management
//! - `connection`: MongoDB connection management
//! - `dump`: Run orchestration, oplog window, collection pipeline, metadata
//! - `error`: Error types and handling
//! - `source`: Data source capability (live driver and in-memory)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mongodump::{
//!     config::Config,
//!     connection::ConnectionManager,
//!     dump::{DumpOptions, DumpOrchestrator, DumpSettings},
//!     source::LiveSource,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let mut manager = ConnectionManager::new(
//!         "mongodb://localhost:27017".to_string(),
//!         config.connection.clone(),
//!     );
//!     manager.connect().await?;
//!
//!     let source = LiveSource::new(manager.get_client()?.clone(), config.dump.batch_size);
//!     let options = DumpOptions {
//!         db: Some("app".to_string()),
//!         ..Default::default()
//!     };
//!     let summary = DumpOrchestrator::new(Arc::new(source), options, DumpSettings::default())
//!         .run()
//!         .await?;
//!     println!("dumped {} documents", summary.documents);
//!
//!     manager.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod connection;
pub mod dump;
pub mod error;
pub mod source;

// Re-export commonly used types
pub use config::Config;
pub use connection::ConnectionManager;
pub use dump::{DumpOptions, DumpOrchestrator, DumpSettings, DumpSummary};
pub use error::{DumpError, Result};
pub use source::{DumpSource, LiveSource, MemorySource};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library version string
pub fn version() -> &'static str {
    VERSION
}
