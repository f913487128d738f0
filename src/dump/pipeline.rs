//! Read-ahead pipeline for one namespace
//!
//! A producer task pulls raw documents from the cursor into a bounded
//! channel while the calling task writes them through a buffered writer.
//! Closing the channel marks end of stream. A read error ends the producer
//! and is reported after the consumer has drained everything sent before it.

use std::path::Path;
use std::time::Instant;

use bson::{Document, RawDocumentBuf};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{DumpError, Result};
use crate::source::{DocSource, DumpSource, FindRequest, Namespace};

use super::options::ScanMode;
use super::progress::ProgressTracker;

/// Buffer sizes of one pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// Documents held between the reader and the writer.
    pub queue_capacity: usize,
    pub write_buffer_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            write_buffer_size: 8 * 1024 * 1024,
        }
    }
}

/// Result of streaming one namespace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub documents: u64,
    pub bytes: u64,
    pub elapsed_ms: u64,
}

/// Streams one namespace to a sink in cursor order
pub struct CollectionDumpPipeline {
    namespace: Namespace,
    cursor: Option<Box<dyn DocSource>>,
    settings: PipelineSettings,
    tracker: ProgressTracker,
}

impl CollectionDumpPipeline {
    /// Open the cursor for a namespace
    ///
    /// # Arguments
    /// * `source` - Data source to read from
    /// * `namespace` - Namespace to dump
    /// * `filter` - Optional query filter
    /// * `scan_mode` - Snapshot and prefetch behaviour
    /// * `settings` - Queue and buffer sizes
    ///
    /// # Returns
    /// * `Result<Self>` - Ready pipeline, or a query error
    pub async fn open(
        source: &dyn DumpSource,
        namespace: Namespace,
        filter: Option<Document>,
        scan_mode: ScanMode,
        settings: PipelineSettings,
    ) -> Result<Self> {
        let request = FindRequest::filter(filter.unwrap_or_default()).with_flags(scan_mode.flags());
        debug!("Opening {} with scan mode {:?}", namespace, scan_mode);

        let cursor = source
            .find_docs(&namespace.db, &namespace.collection, request)
            .await
            .map_err(|e| match e {
                query @ DumpError::Query { .. } => query,
                other => DumpError::Query {
                    namespace: namespace.to_string(),
                    message: other.to_string(),
                },
            })?;

        Ok(Self {
            namespace,
            cursor: Some(cursor),
            settings,
            tracker: ProgressTracker::hidden(),
        })
    }

    pub fn with_progress(mut self, tracker: ProgressTracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Copy every document to `sink`, flushing before returning.
    ///
    /// # Arguments
    /// * `sink` - Destination writer
    /// * `path` - Destination name used in write errors
    ///
    /// # Returns
    /// * `Result<StreamStats>` - Counts, or the first write or read error
    pub async fn stream<W>(&mut self, sink: W, path: &Path) -> Result<StreamStats>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut cursor = self.cursor.take().ok_or_else(|| {
            DumpError::Generic(format!("cursor on {} is already closed", self.namespace))
        })?;
        let start_time = Instant::now();

        let (tx, mut rx) = mpsc::channel::<RawDocumentBuf>(self.settings.queue_capacity.max(1));
        let producer = tokio::spawn(async move {
            let outcome = loop {
                match cursor.next_raw().await {
                    Ok(Some(doc)) => {
                        if tx.send(doc).await.is_err() {
                            // consumer stopped
                            break Ok(());
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            };
            (cursor, outcome)
        });

        let mut writer = BufWriter::with_capacity(self.settings.write_buffer_size, sink);
        let mut stats = StreamStats::default();
        let mut write_error = None;

        while let Some(doc) = rx.recv().await {
            let bytes = doc.as_bytes();
            if let Err(e) = writer.write_all(bytes).await {
                write_error = Some(DumpError::write(path, e));
                break;
            }
            stats.documents += 1;
            stats.bytes += bytes.len() as u64;
            self.tracker.update(stats.documents);
            trace!("Wrote document {} of {}", stats.documents, self.namespace);
        }

        if let Err(e) = writer.flush().await {
            write_error.get_or_insert(DumpError::write(path, e));
        }
        drop(rx);

        let (cursor, read_outcome) = producer.await.map_err(|e| {
            DumpError::Generic(format!("reader task for {} failed: {e}", self.namespace))
        })?;
        self.cursor = Some(cursor);

        self.tracker.finish();
        stats.elapsed_ms = start_time.elapsed().as_millis() as u64;

        if let Some(err) = write_error {
            return Err(err);
        }
        read_outcome.map_err(|e| e.with_context(format!("reading {}", self.namespace)))?;

        debug!(
            "Streamed {} documents ({} bytes) from {} in {} ms",
            stats.documents, stats.bytes, self.namespace, stats.elapsed_ms
        );
        Ok(stats)
    }

    /// Release the cursor. Safe to call on any path, and more than once.
    pub async fn close(&mut self) -> Result<()> {
        match self.cursor.take() {
            Some(mut cursor) => cursor.close().await,
            None => Ok(()),
        }
    }
}
