//! Run sequencing
//!
//! Validates options, captures the oplog start, dumps the selected
//! namespaces one after another, copies the oplog window and finally the
//! auth collections of the target database.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bson::doc;
use tracing::{debug, info};

use crate::config::DumpConfig;
use crate::error::{DumpError, Result};
use crate::source::{DumpSource, Namespace};

use super::metadata::MetadataExporter;
use super::oplog::{CheckPoint, OplogWindow, OplogWindowManager};
use super::options::{DumpOptions, DumpScope, ScanMode};
use super::pipeline::{CollectionDumpPipeline, PipelineSettings, StreamStats};
use super::progress::ProgressTracker;
use super::sink::{self, BoxedWriter, STDOUT_LABEL};

/// Collections that describe the catalog and are never dumped as data.
const CATALOG_COLLECTIONS: [&str; 2] = ["system.indexes", "system.namespaces"];

/// Lowest authorization schema that stores users in `admin.system.users`.
const MIN_AUTH_SCHEMA_VERSION: i32 = 3;

/// Runtime settings handed to the orchestrator explicitly
#[derive(Debug, Clone, Copy)]
pub struct DumpSettings {
    pub queue_capacity: usize,
    pub write_buffer_size: usize,
    pub show_progress: bool,
}

impl Default for DumpSettings {
    fn default() -> Self {
        let pipeline = PipelineSettings::default();
        Self {
            queue_capacity: pipeline.queue_capacity,
            write_buffer_size: pipeline.write_buffer_size,
            show_progress: false,
        }
    }
}

impl From<&DumpConfig> for DumpSettings {
    fn from(config: &DumpConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            write_buffer_size: config.write_buffer_size,
            show_progress: config.show_progress,
        }
    }
}

impl DumpSettings {
    fn pipeline(&self) -> PipelineSettings {
        PipelineSettings {
            queue_capacity: self.queue_capacity,
            write_buffer_size: self.write_buffer_size,
        }
    }
}

/// Totals of a finished run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpSummary {
    pub collections: usize,
    pub documents: u64,
    pub bytes: u64,
    /// Oplog entries copied, when oplog capture was requested.
    pub oplog_entries: Option<u64>,
    pub elapsed_ms: u64,
}

impl DumpSummary {
    fn record(&mut self, stats: &StreamStats) {
        self.collections += 1;
        self.documents += stats.documents;
        self.bytes += stats.bytes;
    }
}

/// Sequences one dump run
pub struct DumpOrchestrator {
    source: Arc<dyn DumpSource>,
    options: DumpOptions,
    settings: DumpSettings,
    stdout: Option<BoxedWriter>,
}

impl DumpOrchestrator {
    /// Create an orchestrator
    ///
    /// # Arguments
    /// * `source` - Data source capability
    /// * `options` - Selectors and flags of the run
    /// * `settings` - Buffer sizes and display settings
    pub fn new(source: Arc<dyn DumpSource>, options: DumpOptions, settings: DumpSettings) -> Self {
        Self {
            source,
            options,
            settings,
            stdout: None,
        }
    }

    /// Replace the writer used for stdout mode.
    pub fn with_stdout(mut self, writer: BoxedWriter) -> Self {
        self.stdout = Some(writer);
        self
    }

    /// Check the option combination without touching the source.
    pub fn validate_options(&self) -> Result<DumpScope> {
        self.options.validate()
    }

    /// Execute the run
    ///
    /// # Returns
    /// * `Result<DumpSummary>` - Totals, or the first fatal error
    pub async fn run(&mut self) -> Result<DumpSummary> {
        let start_time = Instant::now();
        let scope = self.validate_options()?;
        let mut summary = DumpSummary::default();

        if self.options.dump_users_and_roles {
            self.check_auth_schema().await?;
        }

        let oplog = OplogWindowManager::new(Arc::clone(&self.source));
        let mut window = if self.options.oplog {
            Some(oplog.capture_start().await?)
        } else {
            None
        };

        match &scope {
            DumpScope::Everything => self.dump_everything(&mut summary).await?,
            DumpScope::Database(db) => self.dump_database(db, &mut summary).await?,
            DumpScope::Collection { db, collection } => {
                let stats = self.dump_collection(&Namespace::new(db, collection)).await?;
                summary.record(&stats);
            }
        }

        if let Some(window) = window.as_mut() {
            summary.oplog_entries = Some(self.dump_oplog(&oplog, window).await?);
        }

        if let DumpScope::Database(db) = &scope {
            if self.options.dump_users_and_roles {
                self.dump_users_and_roles(db).await?;
            }
        }

        summary.elapsed_ms = start_time.elapsed().as_millis() as u64;
        info!(
            "Dump finished: {} collections, {} documents, {} bytes in {} ms",
            summary.collections, summary.documents, summary.bytes, summary.elapsed_ms
        );
        Ok(summary)
    }

    /// Dump every database except `local`.
    async fn dump_everything(&mut self, summary: &mut DumpSummary) -> Result<()> {
        let databases = self
            .source
            .database_names()
            .await
            .map_err(|e| e.with_context("listing databases"))?;

        for db in databases.iter().filter(|db| db.as_str() != "local") {
            self.dump_database(db, summary).await?;
        }
        Ok(())
    }

    /// Dump every collection of `db`.
    async fn dump_database(&mut self, db: &str, summary: &mut DumpSummary) -> Result<()> {
        let collections = self
            .source
            .collection_names(db)
            .await
            .map_err(|e| e.with_context(format!("listing collections of {db}")))?;

        for collection in collections {
            if CATALOG_COLLECTIONS.contains(&collection.as_str()) {
                debug!("Skipping catalog collection {db}.{collection}");
                continue;
            }
            if self.options.is_excluded(&collection) {
                info!("Skipping excluded collection {db}.{collection}");
                continue;
            }

            let stats = self.dump_collection(&Namespace::new(db, collection)).await?;
            summary.record(&stats);
        }
        Ok(())
    }

    /// Dump one collection and, when writing a directory tree, its metadata.
    async fn dump_collection(&mut self, namespace: &Namespace) -> Result<StreamStats> {
        let scan_mode = self.options.scan_mode();
        let filter = self.options.query.clone();

        let stats = match self.options.output.directory().map(Path::to_path_buf) {
            None => {
                let stdout = self.stdout.get_or_insert_with(sink::stdout);
                stream_namespace(
                    self.source.as_ref(),
                    namespace,
                    filter,
                    scan_mode,
                    self.settings.pipeline(),
                    ProgressTracker::hidden(),
                    stdout,
                    Path::new(STDOUT_LABEL),
                )
                .await?
            }
            Some(out_dir) => {
                info!("Writing {} to {}", namespace, out_dir.join(&namespace.db).display());
                let path = sink::collection_path(&out_dir, &namespace.db, &namespace.collection);
                let file = sink::create_file(&path).await?;
                let stats = stream_namespace(
                    self.source.as_ref(),
                    namespace,
                    filter,
                    scan_mode,
                    self.settings.pipeline(),
                    ProgressTracker::new(&namespace.to_string(), self.settings.show_progress),
                    file,
                    &path,
                )
                .await?;

                let metadata_path =
                    sink::metadata_path(&out_dir, &namespace.db, &namespace.collection);
                let metadata_file = sink::create_file(&metadata_path).await?;
                MetadataExporter::new(Arc::clone(&self.source))
                    .export(namespace, metadata_file, &metadata_path)
                    .await?;
                stats
            }
        };

        info!("Done dumping {} ({} documents)", namespace, stats.documents);
        Ok(stats)
    }

    /// Copy oplog entries newer than the window start to `oplog.bson`.
    async fn dump_oplog(&mut self, oplog: &OplogWindowManager, window: &mut OplogWindow) -> Result<u64> {
        oplog.check_window(window, CheckPoint::BeforeCopy).await?;

        let path = sink::oplog_path(&self.output_dir()?);
        let namespace = Namespace::new("local", window.collection.clone());
        info!("Writing captured oplog to {}", path.display());

        let file = sink::create_file(&path).await?;
        let stats = stream_namespace(
            self.source.as_ref(),
            &namespace,
            Some(window.entries_filter()),
            ScanMode::CustomQuery,
            self.settings.pipeline(),
            ProgressTracker::new(&namespace.to_string(), self.settings.show_progress),
            file,
            &path,
        )
        .await?;

        oplog.check_window(window, CheckPoint::AfterCopy).await?;
        info!("Dumped {} oplog entries", stats.documents);
        Ok(stats.documents)
    }

    /// Write the users and roles defined on `db` to dedicated files.
    async fn dump_users_and_roles(&mut self, db: &str) -> Result<()> {
        if db == "admin" {
            info!("Users and roles of admin are part of the admin database dump");
            return Ok(());
        }

        let out_dir = self.output_dir()?;
        for collection in ["system.users", "system.roles"] {
            let namespace = Namespace::new("admin", collection);
            let path = sink::auth_collection_path(&out_dir, db, collection);
            let file = sink::create_file(&path).await?;
            let stats = stream_namespace(
                self.source.as_ref(),
                &namespace,
                Some(doc! { "db": db }),
                ScanMode::CustomQuery,
                self.settings.pipeline(),
                ProgressTracker::hidden(),
                file,
                &path,
            )
            .await?;
            info!("Dumped {} {} entries for {}", stats.documents, collection, db);
        }
        Ok(())
    }

    async fn check_auth_schema(&self) -> Result<()> {
        let version = self
            .source
            .auth_schema_version()
            .await
            .map_err(|e| e.with_context("reading auth schema version"))?;

        match version {
            Some(v) if v >= MIN_AUTH_SCHEMA_VERSION => {
                debug!("Auth schema version {v}");
                Ok(())
            }
            found => Err(DumpError::conflict(format!(
                "backing up users and roles is only supported for deployments with auth \
                 schema versions >= {MIN_AUTH_SCHEMA_VERSION}, found: {}",
                found.map_or_else(|| "none".to_string(), |v| v.to_string())
            ))),
        }
    }

    fn output_dir(&self) -> Result<PathBuf> {
        self.options
            .output
            .directory()
            .map(Path::to_path_buf)
            .ok_or_else(|| DumpError::conflict("this output requires a directory, not stdout"))
    }
}

/// Open, stream and close one namespace, closing the cursor on every path.
#[allow(clippy::too_many_arguments)]
async fn stream_namespace<W>(
    source: &dyn DumpSource,
    namespace: &Namespace,
    filter: Option<bson::Document>,
    scan_mode: ScanMode,
    settings: PipelineSettings,
    tracker: ProgressTracker,
    sink: W,
    path: &Path,
) -> Result<StreamStats>
where
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    let mut pipeline =
        CollectionDumpPipeline::open(source, namespace.clone(), filter, scan_mode, settings)
            .await?
            .with_progress(tracker);

    let streamed = pipeline.stream(sink, path).await;
    let closed = pipeline.close().await;
    let stats = streamed?;
    closed?;
    Ok(stats)
}
