//! Collection metadata sidecar
//!
//! Writes `<collection>.metadata.json` holding the catalog options and the
//! index definitions needed to recreate a collection.

use std::path::Path;
use std::sync::Arc;

use bson::{Bson, Document};
use serde_json::{Map, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use crate::error::{DumpError, Result};
use crate::source::{DumpSource, Namespace, bson_as_i32};

/// One index definition
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDefinition {
    pub name: String,
    pub namespace: String,
    pub version: Option<i32>,
    /// Ordered field to direction (or index type) pairs.
    pub key: Document,
    /// Remaining index options such as `unique` or `expireAfterSeconds`.
    pub options: Document,
}

impl IndexDefinition {
    /// Split a catalog index document into its parts.
    ///
    /// Servers that omit `ns` get the collection namespace filled in.
    pub fn from_spec(mut spec: Document, namespace: &Namespace) -> Self {
        let version = bson_as_i32(spec.get("v"));
        let name = match spec.remove("name") {
            Some(Bson::String(name)) => name,
            _ => String::new(),
        };
        let key = match spec.remove("key") {
            Some(Bson::Document(key)) => key,
            _ => Document::new(),
        };
        let ns = match spec.remove("ns") {
            Some(Bson::String(ns)) => ns,
            _ => namespace.to_string(),
        };
        spec.remove("v");

        Self {
            name,
            namespace: ns,
            version,
            key,
            options: spec,
        }
    }

    fn to_json(&self) -> Value {
        let mut map = Map::new();
        if let Some(v) = self.version {
            map.insert("v".into(), Value::from(v));
        }
        map.insert("key".into(), extjson(self.key.clone()));
        map.insert("name".into(), Value::from(self.name.clone()));
        map.insert("ns".into(), Value::from(self.namespace.clone()));
        for (field, value) in &self.options {
            map.insert(field.clone(), value.clone().into_relaxed_extjson());
        }
        Value::Object(map)
    }
}

/// Options and indexes of one collection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionMetadata {
    pub options: Document,
    pub indexes: Vec<IndexDefinition>,
}

impl CollectionMetadata {
    /// `{"options": {...}, "indexes": [...]}`; `indexes` is an array even when empty.
    pub fn to_json(&self) -> Value {
        let indexes = self.indexes.iter().map(IndexDefinition::to_json).collect();

        let mut map = Map::new();
        map.insert("options".into(), extjson(self.options.clone()));
        map.insert("indexes".into(), Value::Array(indexes));
        Value::Object(map)
    }
}

fn extjson(doc: Document) -> Value {
    Bson::Document(doc).into_relaxed_extjson()
}

/// Builds and writes metadata sidecars
pub struct MetadataExporter {
    source: Arc<dyn DumpSource>,
}

impl MetadataExporter {
    pub fn new(source: Arc<dyn DumpSource>) -> Self {
        Self { source }
    }

    /// Look up options, then indexes, of a collection.
    ///
    /// A failed or empty options lookup is logged and yields empty metadata.
    pub async fn collect(&self, namespace: &Namespace) -> Result<CollectionMetadata> {
        let lookup = self
            .source
            .collection_options(&namespace.db, &namespace.collection)
            .await;

        let options = match lookup {
            Ok(Some(options)) => options,
            Ok(None) => {
                return Ok(degraded(namespace, "collection has no catalog entry"));
            }
            Err(e) => return Ok(degraded(namespace, &e.to_string())),
        };

        let indexes = self
            .source
            .index_specs(&namespace.db, &namespace.collection)
            .await
            .map_err(|e| e.with_context(format!("reading indexes of {namespace}")))?
            .into_iter()
            .map(|spec| IndexDefinition::from_spec(spec, namespace))
            .collect::<Vec<_>>();

        debug!("Collected {} index definitions for {}", indexes.len(), namespace);
        Ok(CollectionMetadata { options, indexes })
    }

    /// Collect metadata and write it to `sink` as JSON.
    ///
    /// # Arguments
    /// * `namespace` - Collection to describe
    /// * `sink` - Destination writer, flushed before returning
    /// * `path` - Destination name used in write errors
    pub async fn export<W>(&self, namespace: &Namespace, sink: W, path: &Path) -> Result<CollectionMetadata>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let metadata = self.collect(namespace).await?;
        let json = serde_json::to_vec(&metadata.to_json())?;

        let mut writer = BufWriter::new(sink);
        writer
            .write_all(&json)
            .await
            .map_err(|e| DumpError::write(path, e))?;
        writer.flush().await.map_err(|e| DumpError::write(path, e))?;

        Ok(metadata)
    }
}

fn degraded(namespace: &Namespace, reason: &str) -> CollectionMetadata {
    let err = DumpError::MetadataLookup {
        namespace: namespace.to_string(),
        message: reason.to_string(),
    };
    warn!("{err}; writing empty metadata");
    CollectionMetadata::default()
}
