//! Dump engine
//!
//! This module turns a set of [`DumpOptions`] into a dump tree:
//!
//! ```text
//! <out>/
//!   oplog.bson
//!   <db>/
//!     <collection>.bson
//!     <collection>.metadata.json
//!     $admin.system.users
//!     $admin.system.roles
//! ```
//!
//! Collections are dumped strictly one after another. Inside a collection
//! dump the cursor reader and the file writer run concurrently, connected
//! by a bounded channel (see [`pipeline`]).

pub mod metadata;
pub mod options;
pub mod oplog;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod sink;

pub use metadata::{CollectionMetadata, IndexDefinition, MetadataExporter};
pub use options::{DumpOptions, DumpScope, OutputTarget, ScanMode, parse_query};
pub use oplog::{CheckPoint, OplogWindow, OplogWindowManager};
pub use orchestrator::{DumpOrchestrator, DumpSettings, DumpSummary};
pub use pipeline::{CollectionDumpPipeline, PipelineSettings, StreamStats};
pub use progress::ProgressTracker;

#[cfg(test)]
mod tests;
