//! Offline in-memory implementation of the data source capability
//!
//! Keeps a catalog of databases and collections in process memory and
//! answers the same calls a server would, including the legacy
//! `system.namespaces` / `system.indexes` catalog and the topology probe.
//! Faults can be injected per namespace to exercise error paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use bson::{Document, RawDocumentBuf, doc};
use tracing::debug;

use crate::error::{DumpError, Result};

use super::filter::{check_filter, compare_by_sort, matches, natural_direction};
use super::{DocSource, DumpSource, FindRequest, Namespace};

/// Injected failure for a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    /// Opening a cursor fails.
    Open,
    /// The cursor yields this many documents, then fails.
    ReadAfter(usize),
}

#[derive(Debug, Default)]
struct Catalog {
    databases: BTreeMap<String, BTreeMap<String, Vec<Document>>>,
    hello: Document,
    faults: HashMap<Namespace, Fault>,
}

impl Catalog {
    fn collection_mut(&mut self, db: &str, collection: &str) -> &mut Vec<Document> {
        self.databases
            .entry(db.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default()
    }

    fn upsert_catalog_entry(&mut self, db: &str, collection: &str, options: Document) {
        let ns = Namespace::new(db, collection).to_string();
        let entries = self.collection_mut(db, "system.namespaces");
        match entries.iter_mut().find(|e| e.get_str("name").is_ok_and(|n| n == ns)) {
            Some(entry) => {
                entry.insert("options", options);
            }
            None => entries.push(doc! { "name": ns, "options": options }),
        }
    }

    /// Documents of `db.collection` matching the request, in result order.
    fn select(&self, db: &str, collection: &str, request: &FindRequest) -> Result<Vec<Document>> {
        check_filter(&request.query)?;
        let Some(stored) = self.databases.get(db).and_then(|d| d.get(collection)) else {
            return Ok(Vec::new());
        };

        let mut selected: Vec<Document> = stored
            .iter()
            .filter(|d| matches(d, &request.query))
            .cloned()
            .collect();

        if let Some(sort) = &request.sort {
            if natural_direction(sort).is_some_and(|d| d < 0) {
                selected.reverse();
            }
            selected.sort_by(|a, b| compare_by_sort(a, b, sort));
        }

        let skip = usize::try_from(request.skip).unwrap_or(usize::MAX);
        let mut selected: Vec<Document> = selected.into_iter().skip(skip).collect();
        if let Some(limit) = request.limit.filter(|l| *l != 0) {
            selected.truncate(usize::try_from(limit.unsigned_abs()).unwrap_or(usize::MAX));
        }
        Ok(selected)
    }
}

/// In-memory deployment
///
/// Clones share the same catalog, so a test can keep a handle and mutate
/// data while the dump engine reads through another.
#[derive(Debug, Clone)]
pub struct MemorySource {
    catalog: Arc<RwLock<Catalog>>,
    open_cursors: Arc<AtomicUsize>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    /// Create an empty standalone deployment.
    pub fn new() -> Self {
        let catalog = Catalog {
            hello: doc! { "ismaster": true, "maxWireVersion": 21 },
            ..Default::default()
        };
        Self {
            catalog: Arc::new(RwLock::new(catalog)),
            open_cursors: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Catalog> {
        self.catalog.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Catalog> {
        self.catalog.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer the topology probe as a replica set member.
    pub fn replica_set(self, set_name: &str) -> Self {
        self.with_hello(doc! {
            "ismaster": true,
            "setName": set_name,
            "hosts": ["localhost:27017"],
            "maxWireVersion": 21,
        })
    }

    /// Answer the topology probe as a node that is not a master.
    pub fn not_master(self) -> Self {
        self.with_hello(doc! { "ismaster": false, "maxWireVersion": 21 })
    }

    /// Replace the topology probe reply.
    pub fn with_hello(self, hello: Document) -> Self {
        self.write().hello = hello;
        self
    }

    /// Add documents to a collection and register it in the catalog.
    pub fn with_collection(self, db: &str, collection: &str, docs: Vec<Document>) -> Self {
        {
            let mut catalog = self.write();
            catalog.collection_mut(db, collection).extend(docs);
            let ns = Namespace::new(db, collection).to_string();
            let cataloged = catalog
                .databases
                .get(db)
                .and_then(|d| d.get("system.namespaces"))
                .is_some_and(|entries| {
                    entries.iter().any(|e| e.get_str("name").is_ok_and(|n| n == ns))
                });
            if !cataloged {
                catalog.upsert_catalog_entry(db, collection, Document::new());
            }
        }
        self
    }

    /// Add documents to a collection without a catalog entry, the way
    /// virtual and some system collections appear.
    pub fn with_uncataloged_collection(
        self,
        db: &str,
        collection: &str,
        docs: Vec<Document>,
    ) -> Self {
        self.write().collection_mut(db, collection).extend(docs);
        self
    }

    /// Set the catalog options of a collection.
    pub fn with_collection_options(self, db: &str, collection: &str, options: Document) -> Self {
        self.write().upsert_catalog_entry(db, collection, options);
        self
    }

    /// Register an index definition in `system.indexes`.
    pub fn with_index(self, db: &str, collection: &str, name: &str, key: Document) -> Self {
        let ns = Namespace::new(db, collection).to_string();
        self.write()
            .collection_mut(db, "system.indexes")
            .push(doc! { "v": 2, "key": key, "name": name, "ns": ns });
        self
    }

    /// Record the authorization schema version in `admin.system.version`.
    pub fn with_auth_schema_version(self, version: i32) -> Self {
        self.write()
            .collection_mut("admin", "system.version")
            .push(doc! { "_id": "authSchema", "currentVersion": version });
        self
    }

    /// Fill `local.<collection>` with oplog entries, oldest first.
    pub fn with_oplog(self, collection: &str, entries: Vec<Document>) -> Self {
        self.with_uncataloged_collection("local", collection, entries)
    }

    /// Make every cursor open on the namespace fail.
    pub fn with_failing_open(self, db: &str, collection: &str) -> Self {
        self.write()
            .faults
            .insert(Namespace::new(db, collection), Fault::Open);
        self
    }

    /// Make cursors on the namespace fail after yielding `after` documents.
    pub fn with_failing_read(self, db: &str, collection: &str, after: usize) -> Self {
        self.write()
            .faults
            .insert(Namespace::new(db, collection), Fault::ReadAfter(after));
        self
    }

    /// Append a document to a collection.
    pub fn insert(&self, db: &str, collection: &str, document: Document) {
        self.write().collection_mut(db, collection).push(document);
    }

    /// Drop the oldest `count` documents of a collection, as a capped
    /// collection does when it wraps.
    pub fn truncate_front(&self, db: &str, collection: &str, count: usize) {
        let mut catalog = self.write();
        let docs = catalog.collection_mut(db, collection);
        let count = count.min(docs.len());
        docs.drain(..count);
    }

    /// Stored documents of a collection in insertion order.
    pub fn documents(&self, db: &str, collection: &str) -> Vec<Document> {
        self.read()
            .databases
            .get(db)
            .and_then(|d| d.get(collection))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of cursors opened and not yet closed.
    pub fn open_cursor_count(&self) -> usize {
        self.open_cursors.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DumpSource for MemorySource {
    async fn run_command(&self, _db: &str, command: Document) -> Result<Document> {
        let name = command.keys().next().cloned().unwrap_or_default();
        match name.as_str() {
            "isMaster" | "ismaster" | "hello" => {
                let mut reply = self.read().hello.clone();
                reply.insert("ok", 1.0);
                Ok(reply)
            }
            "ping" => Ok(doc! { "ok": 1.0 }),
            other => Err(DumpError::Generic(format!(
                "command '{other}' is not supported by the in-memory source"
            ))),
        }
    }

    async fn find_one(
        &self,
        db: &str,
        collection: &str,
        query: Document,
        sort: Option<Document>,
    ) -> Result<Option<Document>> {
        let request = FindRequest {
            query,
            sort,
            limit: Some(1),
            ..Default::default()
        };
        Ok(self.read().select(db, collection, &request)?.into_iter().next())
    }

    async fn find_docs(
        &self,
        db: &str,
        collection: &str,
        request: FindRequest,
    ) -> Result<Box<dyn DocSource>> {
        let namespace = Namespace::new(db, collection);
        let (selected, fault) = {
            let catalog = self.read();
            let fault = catalog.faults.get(&namespace).copied();
            if fault == Some(Fault::Open) {
                return Err(DumpError::Query {
                    namespace: namespace.to_string(),
                    message: "injected cursor open failure".to_string(),
                });
            }
            let selected = catalog.select(db, collection, &request).map_err(|e| {
                DumpError::Query {
                    namespace: namespace.to_string(),
                    message: e.to_string(),
                }
            })?;
            (selected, fault)
        };

        let documents = selected
            .iter()
            .map(|d| {
                RawDocumentBuf::from_document(d)
                    .map_err(|e| DumpError::Serialization(format!("{namespace}: {e}")))
            })
            .collect::<Result<VecDeque<_>>>()?;

        debug!(
            "Opened in-memory cursor on {} with {} documents",
            namespace,
            documents.len()
        );

        self.open_cursors.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryDocSource {
            documents,
            fail_after: match fault {
                Some(Fault::ReadAfter(n)) => Some(n),
                _ => None,
            },
            yielded: 0,
            namespace,
            open_cursors: Arc::clone(&self.open_cursors),
            closed: false,
        }))
    }

    async fn database_names(&self) -> Result<Vec<String>> {
        Ok(self.read().databases.keys().cloned().collect())
    }

    async fn collection_names(&self, db: &str) -> Result<Vec<String>> {
        Ok(self
            .read()
            .databases
            .get(db)
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default())
    }
}

/// Cursor over a materialized snapshot of matching documents
pub struct MemoryDocSource {
    documents: VecDeque<RawDocumentBuf>,
    fail_after: Option<usize>,
    yielded: usize,
    namespace: Namespace,
    open_cursors: Arc<AtomicUsize>,
    closed: bool,
}

#[async_trait]
impl DocSource for MemoryDocSource {
    async fn next_raw(&mut self) -> Result<Option<RawDocumentBuf>> {
        if self.closed {
            return Ok(None);
        }
        if self.fail_after.is_some_and(|n| self.yielded >= n) {
            return Err(DumpError::Generic(format!(
                "injected read failure on {} after {} documents",
                self.namespace, self.yielded
            )));
        }
        let next = self.documents.pop_front();
        if next.is_some() {
            self.yielded += 1;
        }
        Ok(next)
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.documents.clear();
            self.open_cursors.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MemoryDocSource {
    fn drop(&mut self) {
        if !self.closed {
            self.open_cursors.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::collect_documents;

    fn sample() -> MemorySource {
        MemorySource::new().with_collection(
            "app",
            "items",
            vec![doc! { "n": 1 }, doc! { "n": 2 }, doc! { "n": 3 }],
        )
    }

    #[tokio::test]
    async fn test_natural_order_both_directions() {
        let source = sample();
        let first = source
            .find_one("app", "items", doc! {}, Some(doc! { "$natural": 1 }))
            .await
            .unwrap();
        let last = source
            .find_one("app", "items", doc! {}, Some(doc! { "$natural": -1 }))
            .await
            .unwrap();
        assert_eq!(first, Some(doc! { "n": 1 }));
        assert_eq!(last, Some(doc! { "n": 3 }));
    }

    #[tokio::test]
    async fn test_unsupported_operator_fails_the_open() {
        let source = sample();
        let request = FindRequest::filter(doc! { "n": { "$mod": [2, 0] } });
        let err = source.find_docs("app", "items", request).await.err().unwrap();
        assert!(matches!(err, DumpError::Query { ref namespace, .. } if namespace == "app.items"));
        assert!(err.to_string().contains("$mod"));
        assert_eq!(source.open_cursor_count(), 0);

        let request = FindRequest::filter(doc! { "n": { "$nin": [1, 3] } });
        let cursor = source.find_docs("app", "items", request).await.unwrap();
        assert_eq!(collect_documents(cursor).await.unwrap(), vec![doc! { "n": 2 }]);
    }

    #[tokio::test]
    async fn test_find_docs_filters_skips_and_limits() {
        let source = sample();
        let request = FindRequest {
            query: doc! { "n": { "$gte": 2 } },
            ..Default::default()
        };
        let cursor = source.find_docs("app", "items", request).await.unwrap();
        let docs = collect_documents(cursor).await.unwrap();
        assert_eq!(docs, vec![doc! { "n": 2 }, doc! { "n": 3 }]);

        let request = FindRequest {
            skip: 1,
            limit: Some(1),
            ..Default::default()
        };
        let cursor = source.find_docs("app", "items", request).await.unwrap();
        assert_eq!(collect_documents(cursor).await.unwrap(), vec![doc! { "n": 2 }]);
        assert_eq!(source.open_cursor_count(), 0);
    }

    #[tokio::test]
    async fn test_catalog_lists_registered_collections() {
        let source = sample().with_uncataloged_collection("app", "view", vec![]);
        let names = source.collection_names("app").await.unwrap();
        assert_eq!(names, vec!["items", "system.namespaces", "view"]);
        assert_eq!(source.database_names().await.unwrap(), vec!["app"]);
        assert_eq!(source.collection_options("app", "view").await.unwrap(), None);
        assert_eq!(
            source.collection_options("app", "items").await.unwrap(),
            Some(Document::new())
        );
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let source = sample().with_failing_open("app", "items");
        let err = source
            .find_docs("app", "items", FindRequest::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DumpError::Query { .. }));

        let source = sample().with_failing_read("app", "items", 2);
        let mut cursor = source
            .find_docs("app", "items", FindRequest::default())
            .await
            .unwrap();
        assert!(cursor.next_raw().await.unwrap().is_some());
        assert!(cursor.next_raw().await.unwrap().is_some());
        assert!(cursor.next_raw().await.is_err());
        cursor.close().await.unwrap();
        assert_eq!(source.open_cursor_count(), 0);
    }

    #[tokio::test]
    async fn test_truncate_front_and_shared_handles() {
        let source = sample();
        let handle = source.clone();
        handle.truncate_front("app", "items", 2);
        handle.insert("app", "items", doc! { "n": 4 });
        assert_eq!(
            source.documents("app", "items"),
            vec![doc! { "n": 3 }, doc! { "n": 4 }]
        );
    }

    #[tokio::test]
    async fn test_topology_probe_replies() {
        let reply = MemorySource::new()
            .replica_set("rs0")
            .run_command("admin", doc! { "isMaster": 1 })
            .await
            .unwrap();
        assert!(reply.contains_key("hosts"));

        let reply = MemorySource::new()
            .not_master()
            .run_command("admin", doc! { "isMaster": 1 })
            .await
            .unwrap();
        assert!(!reply.get_bool("ismaster").unwrap());

        assert!(
            MemorySource::new()
                .run_command("admin", doc! { "fsync": 1 })
                .await
                .is_err()
        );
    }
}
