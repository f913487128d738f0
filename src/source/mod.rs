//! Data source capability consumed by the dump engine
//!
//! The dump engine never talks to a driver directly. It depends on two
//! object-safe traits:
//!
//! - [`DumpSource`]: commands, single-document lookups, cursors, and catalog
//!   enumeration
//! - [`DocSource`]: a cursor yielding raw BSON document spans
//!
//! Two implementations ship with the crate:
//!
//! - [`LiveSource`]: backed by a connected `mongodb::Client`
//! - [`MemorySource`]: an offline in-memory catalog, used by tests and for
//!   exercising the engine without a server

use std::fmt;

use async_trait::async_trait;
use bson::{Bson, Document, RawDocumentBuf, doc};

use crate::error::Result;

pub mod filter;
pub mod live;
pub mod memory;

pub use live::{CursorDocSource, LiveSource};
pub use memory::MemorySource;

/// Fully qualified `<database>.<collection>` name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.collection)
    }
}

/// Cursor behaviour requested from the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryFlags {
    /// Isolate the scan from documents moving while it runs.
    pub snapshot: bool,
    /// Ask the server to read ahead in large batches.
    pub prefetch: bool,
}

/// Parameters of a multi-document read.
#[derive(Debug, Clone, Default)]
pub struct FindRequest {
    pub skip: u64,
    pub limit: Option<i64>,
    pub query: Document,
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub flags: QueryFlags,
}

impl FindRequest {
    /// A plain filtered read without flags.
    pub fn filter(query: Document) -> Self {
        Self {
            query,
            ..Default::default()
        }
    }

    pub fn with_flags(mut self, flags: QueryFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Cursor over raw document spans.
///
/// `next_raw` returns `Ok(None)` at the end of the stream. An error ends the
/// stream; callers must still call [`DocSource::close`].
#[async_trait]
pub trait DocSource: Send {
    /// Fetch the next raw document
    ///
    /// # Returns
    /// * `Result<Option<RawDocumentBuf>>` - Next document, or None if exhausted
    async fn next_raw(&mut self) -> Result<Option<RawDocumentBuf>>;

    /// Release the cursor. Calling it more than once is a no-op.
    async fn close(&mut self) -> Result<()>;
}

/// Capability interface over a deployment (live connection or offline shim).
#[async_trait]
pub trait DumpSource: Send + Sync {
    /// Run a database command and return its reply.
    async fn run_command(&self, db: &str, command: Document) -> Result<Document>;

    /// Return the first document matching `query` in `sort` order.
    async fn find_one(
        &self,
        db: &str,
        collection: &str,
        query: Document,
        sort: Option<Document>,
    ) -> Result<Option<Document>>;

    /// Open a cursor over `db.collection`.
    async fn find_docs(
        &self,
        db: &str,
        collection: &str,
        request: FindRequest,
    ) -> Result<Box<dyn DocSource>>;

    async fn database_names(&self) -> Result<Vec<String>>;

    async fn collection_names(&self, db: &str) -> Result<Vec<String>>;

    /// Catalog options of a collection, or `None` when it has no catalog entry.
    ///
    /// The default reads the legacy `system.namespaces` catalog.
    async fn collection_options(&self, db: &str, collection: &str) -> Result<Option<Document>> {
        let ns = Namespace::new(db, collection).to_string();
        let entry = self
            .find_one(db, "system.namespaces", doc! { "name": ns }, None)
            .await?;

        Ok(entry.map(|e| e.get_document("options").cloned().unwrap_or_default()))
    }

    /// Index definitions of a collection in catalog order.
    ///
    /// The default reads the legacy `system.indexes` collection.
    async fn index_specs(&self, db: &str, collection: &str) -> Result<Vec<Document>> {
        let ns = Namespace::new(db, collection).to_string();
        let cursor = self
            .find_docs(db, "system.indexes", FindRequest::filter(doc! { "ns": ns }))
            .await?;
        collect_documents(cursor).await
    }

    /// Authorization schema version, or `None` when the deployment has none.
    ///
    /// The default reads `admin.system.version`.
    async fn auth_schema_version(&self) -> Result<Option<i32>> {
        let version = self
            .find_one(
                "admin",
                "system.version",
                doc! { "_id": "authSchema" },
                None,
            )
            .await?;

        Ok(version.and_then(|d| bson_as_i32(d.get("currentVersion"))))
    }
}

/// Drain a cursor into owned documents, closing it on every path.
pub async fn collect_documents(mut cursor: Box<dyn DocSource>) -> Result<Vec<Document>> {
    let mut docs = Vec::new();
    let drained = async {
        while let Some(raw) = cursor.next_raw().await? {
            let doc = raw
                .to_document()
                .map_err(|e| crate::error::DumpError::Serialization(e.to_string()))?;
            docs.push(doc);
        }
        Ok::<_, crate::error::DumpError>(())
    }
    .await;

    let closed = cursor.close().await;
    drained?;
    closed?;
    Ok(docs)
}

/// Read a numeric BSON value as `i32`.
pub(crate) fn bson_as_i32(value: Option<&Bson>) -> Option<i32> {
    match value? {
        Bson::Int32(v) => Some(*v),
        Bson::Int64(v) => i32::try_from(*v).ok(),
        Bson::Double(v) if v.fract() == 0.0 => Some(*v as i32),
        _ => None,
    }
}

/// Whether a BSON value counts as false (missing, false, zero, or null).
pub(crate) fn bson_is_falsy(value: Option<&Bson>) -> bool {
    match value {
        None | Some(Bson::Null) => true,
        Some(Bson::Boolean(b)) => !b,
        Some(Bson::Int32(v)) => *v == 0,
        Some(Bson::Int64(v)) => *v == 0,
        Some(Bson::Double(v)) => *v == 0.0,
        Some(_) => false,
    }
}
