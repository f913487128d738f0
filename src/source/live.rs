//! Live MongoDB implementation of the data source capability
//!
//! Cursors are opened over `Collection<RawDocumentBuf>` so every document is
//! handed to the writer as the exact bytes the server sent.

use async_trait::async_trait;
use bson::{Document, RawDocumentBuf, doc};
use futures::TryStreamExt;
use mongodb::options::{FindOneOptions, FindOptions, Hint};
use mongodb::{Client, Collection, Cursor};
use tracing::debug;

use crate::error::{DumpError, Result, extract_error_info};

use super::{DocSource, DumpSource, FindRequest, Namespace, bson_as_i32};

/// Data source backed by a connected MongoDB client.
#[derive(Clone)]
pub struct LiveSource {
    client: Client,
    batch_size: u32,
}

impl LiveSource {
    /// Create a live source
    ///
    /// # Arguments
    /// * `client` - Connected MongoDB client
    /// * `batch_size` - Cursor batch size used when prefetching
    pub fn new(client: Client, batch_size: u32) -> Self {
        Self { client, batch_size }
    }

    /// Translate a generic read request into driver find options.
    fn find_options(request: &FindRequest, batch_size: u32) -> FindOptions {
        let mut options = FindOptions::default();
        if request.skip > 0 {
            options.skip = Some(request.skip);
        }
        options.limit = request.limit;
        options.projection = request.projection.clone();
        options.sort = request.sort.clone();

        // The server removed the snapshot option; walking the _id index gives
        // the same guarantee that a moved document is not returned twice.
        if request.flags.snapshot {
            options.hint = Some(Hint::Keys(doc! { "_id": 1 }));
        }
        if request.flags.prefetch {
            options.batch_size = Some(batch_size);
        }
        options
    }

    /// Whether a snapshot scan may walk the `_id` index.
    ///
    /// Views, time-series collections and collections created without an
    /// `_id` index (such as `system.profile`) reject the hint.
    fn id_hint_supported(spec: Option<&Document>, indexes: &[Document]) -> bool {
        let Some(spec) = spec else {
            return false;
        };
        if spec.get_str("type").unwrap_or("collection") != "collection" {
            return false;
        }
        indexes.iter().any(|index| {
            index
                .get_document("key")
                .is_ok_and(|key| key.len() == 1 && bson_as_i32(key.get("_id")) == Some(1))
        })
    }

    /// `listCollections` entry of one collection.
    async fn collection_spec(&self, db: &str, collection: &str) -> Result<Option<Document>> {
        let reply = self
            .run_command(
                db,
                doc! { "listCollections": 1, "filter": { "name": collection } },
            )
            .await?;
        Ok(Self::first_batch(&reply).into_iter().next())
    }

    /// Drop the snapshot flag for namespaces that cannot honour it.
    async fn resolve_flags(&self, namespace: &Namespace, request: &mut FindRequest) {
        if !request.flags.snapshot {
            return;
        }

        let lookup = async {
            let spec = self.collection_spec(&namespace.db, &namespace.collection).await?;
            let indexes = match &spec {
                Some(_) => self.index_specs(&namespace.db, &namespace.collection).await?,
                None => Vec::new(),
            };
            Ok::<_, DumpError>(Self::id_hint_supported(spec.as_ref(), &indexes))
        };

        match lookup.await {
            Ok(true) => {}
            Ok(false) => {
                debug!("{namespace} has no usable _id index, scanning without snapshot");
                request.flags.snapshot = false;
            }
            Err(e) => {
                debug!("Could not inspect {namespace} ({e}), scanning without snapshot");
                request.flags.snapshot = false;
            }
        }
    }

    /// First batch of a cursor-returning command reply.
    fn first_batch(reply: &Document) -> Vec<Document> {
        reply
            .get_document("cursor")
            .ok()
            .and_then(|c| c.get_array("firstBatch").ok())
            .map(|batch| {
                batch
                    .iter()
                    .filter_map(|b| b.as_document().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl DumpSource for LiveSource {
    async fn run_command(&self, db: &str, command: Document) -> Result<Document> {
        Ok(self.client.database(db).run_command(command).await?)
    }

    async fn find_one(
        &self,
        db: &str,
        collection: &str,
        query: Document,
        sort: Option<Document>,
    ) -> Result<Option<Document>> {
        let coll: Collection<Document> = self.client.database(db).collection(collection);

        let mut options = FindOneOptions::default();
        options.sort = sort;

        Ok(coll.find_one(query).with_options(options).await?)
    }

    async fn find_docs(
        &self,
        db: &str,
        collection: &str,
        request: FindRequest,
    ) -> Result<Box<dyn DocSource>> {
        let namespace = Namespace::new(db, collection);
        let mut request = request;
        self.resolve_flags(&namespace, &mut request).await;

        let coll: Collection<RawDocumentBuf> = self.client.database(db).collection(collection);
        let options = Self::find_options(&request, self.batch_size);

        debug!(
            "Opening cursor on {} (snapshot: {}, prefetch: {})",
            namespace, request.flags.snapshot, request.flags.prefetch
        );

        let cursor = coll
            .find(request.query)
            .with_options(options)
            .await
            .map_err(|e| DumpError::Query {
                namespace: namespace.to_string(),
                message: e.to_string(),
            })?;

        Ok(Box::new(CursorDocSource::new(cursor, namespace)))
    }

    async fn database_names(&self) -> Result<Vec<String>> {
        Ok(self.client.list_database_names().await?)
    }

    async fn collection_names(&self, db: &str) -> Result<Vec<String>> {
        Ok(self.client.database(db).list_collection_names().await?)
    }

    async fn collection_options(&self, db: &str, collection: &str) -> Result<Option<Document>> {
        Ok(self
            .collection_spec(db, collection)
            .await?
            .map(|spec| spec.get_document("options").cloned().unwrap_or_default()))
    }

    async fn index_specs(&self, db: &str, collection: &str) -> Result<Vec<Document>> {
        // A collection holds at most 64 indexes, well under the default first batch.
        match self.run_command(db, doc! { "listIndexes": collection }).await {
            Ok(reply) => Ok(Self::first_batch(&reply)),
            Err(DumpError::MongoDb(e)) if extract_error_info(&e).code == Some(26) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn auth_schema_version(&self) -> Result<Option<i32>> {
        let reply = self
            .run_command(
                "admin",
                doc! { "getParameter": 1, "authSchemaVersion": 1 },
            )
            .await?;
        Ok(bson_as_i32(reply.get("authSchemaVersion")))
    }
}

/// Raw-document cursor over a live collection
pub struct CursorDocSource {
    cursor: Option<Cursor<RawDocumentBuf>>,
    namespace: Namespace,
    total_fetched: u64,
    closed: bool,
}

impl CursorDocSource {
    /// Wrap a driver cursor
    ///
    /// # Arguments
    /// * `cursor` - Cursor from a find operation
    /// * `namespace` - Namespace being read, for logging
    pub fn new(cursor: Cursor<RawDocumentBuf>, namespace: Namespace) -> Self {
        Self {
            cursor: Some(cursor),
            namespace,
            total_fetched: 0,
            closed: false,
        }
    }
}

#[async_trait]
impl DocSource for CursorDocSource {
    async fn next_raw(&mut self) -> Result<Option<RawDocumentBuf>> {
        if self.closed {
            return Ok(None);
        }

        let cursor = match self.cursor.as_mut() {
            Some(c) => c,
            None => return Ok(None),
        };

        match cursor.try_next().await {
            Ok(Some(doc)) => {
                self.total_fetched += 1;
                Ok(Some(doc))
            }
            Ok(None) => {
                debug!(
                    "Cursor on {} exhausted after {} documents",
                    self.namespace, self.total_fetched
                );
                Ok(None)
            }
            Err(e) => {
                // On error, drop cursor to release server resources
                self.cursor = None;
                Err(DumpError::MongoDb(e).with_context(format!("reading {}", self.namespace)))
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.cursor = None;
            self.closed = true;
            debug!(
                "Closed cursor on {} after fetching {} documents",
                self.namespace, self.total_fetched
            );
        }
        Ok(())
    }
}

impl Drop for CursorDocSource {
    fn drop(&mut self) {
        if !self.closed {
            debug!("CursorDocSource on {} dropped without explicit close", self.namespace);
            self.cursor = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::QueryFlags;

    #[test]
    fn test_snapshot_maps_to_id_hint() {
        let request = FindRequest::default().with_flags(QueryFlags {
            snapshot: true,
            prefetch: true,
        });
        let options = LiveSource::find_options(&request, 500);
        assert!(matches!(options.hint, Some(Hint::Keys(ref keys)) if *keys == doc! { "_id": 1 }));
        assert_eq!(options.batch_size, Some(500));
        assert_eq!(options.skip, None);
    }

    #[test]
    fn test_prefetch_only_has_no_hint() {
        let request = FindRequest::filter(doc! { "ts": { "$gt": 1 } }).with_flags(QueryFlags {
            snapshot: false,
            prefetch: true,
        });
        let options = LiveSource::find_options(&request, 1000);
        assert!(options.hint.is_none());
        assert_eq!(options.batch_size, Some(1000));
    }

    #[test]
    fn test_skip_and_sort_are_forwarded() {
        let request = FindRequest {
            skip: 10,
            sort: Some(doc! { "$natural": -1 }),
            ..Default::default()
        };
        let options = LiveSource::find_options(&request, 1000);
        assert_eq!(options.skip, Some(10));
        assert_eq!(options.sort, Some(doc! { "$natural": -1 }));
        assert_eq!(options.batch_size, None);
    }

    #[test]
    fn test_id_hint_only_for_collections_with_id_index() {
        let id_index = vec![doc! { "v": 2, "key": { "_id": 1 }, "name": "_id_" }];
        let plain = doc! { "name": "users", "type": "collection", "options": {} };
        assert!(LiveSource::id_hint_supported(Some(&plain), &id_index));

        let legacy = doc! { "name": "users", "options": {} };
        assert!(LiveSource::id_hint_supported(Some(&legacy), &id_index));

        let profile = doc! { "name": "system.profile", "type": "collection", "options": { "capped": true } };
        assert!(!LiveSource::id_hint_supported(Some(&profile), &[]));

        let compound = vec![doc! { "v": 2, "key": { "_id": 1, "ts": -1 }, "name": "_id_ts" }];
        assert!(!LiveSource::id_hint_supported(Some(&plain), &compound));

        let view = doc! { "name": "active_users", "type": "view", "options": { "viewOn": "users" } };
        assert!(!LiveSource::id_hint_supported(Some(&view), &id_index));

        let timeseries = doc! { "name": "metrics", "type": "timeseries", "options": {} };
        assert!(!LiveSource::id_hint_supported(Some(&timeseries), &id_index));

        assert!(!LiveSource::id_hint_supported(None, &id_index));
    }

    #[test]
    fn test_first_batch_extraction() {
        let reply = doc! {
            "cursor": {
                "id": 0_i64,
                "ns": "app.$cmd.listIndexes",
                "firstBatch": [
                    { "v": 2, "key": { "_id": 1 }, "name": "_id_" },
                    { "v": 2, "key": { "email": 1 }, "name": "email_1", "unique": true },
                ],
            },
            "ok": 1.0,
        };
        let batch = LiveSource::first_batch(&reply);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].get_str("name").unwrap(), "email_1");
        assert!(LiveSource::first_batch(&doc! { "ok": 1.0 }).is_empty());
    }
}
