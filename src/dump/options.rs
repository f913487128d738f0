//! Dump option surface and validation
//!
//! [`DumpOptions`] holds the selectors and flags of one run. Validating them
//! fixes the [`DumpScope`] before any I/O happens.

use std::path::{Path, PathBuf};

use bson::{Bson, Document};

use crate::error::{ConfigError, DumpError, Result};
use crate::source::QueryFlags;

/// What a run extracts, fixed at validation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpScope {
    /// Every database except `local`.
    Everything,
    /// All collections of one database.
    Database(String),
    /// Exactly one collection.
    Collection { db: String, collection: String },
}

/// Cursor strategy for one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Snapshot and prefetch.
    Normal,
    /// Prefetch only; tolerates damaged or unindexed collections.
    TableScan,
    /// Prefetch only; explicit queries never run in snapshot mode.
    CustomQuery,
}

impl ScanMode {
    /// Pick the scan mode from the presence of a filter and the table-scan flag.
    pub fn select(has_query: bool, force_table_scan: bool) -> Self {
        if has_query {
            ScanMode::CustomQuery
        } else if force_table_scan {
            ScanMode::TableScan
        } else {
            ScanMode::Normal
        }
    }

    pub fn flags(self) -> QueryFlags {
        QueryFlags {
            snapshot: self == ScanMode::Normal,
            prefetch: true,
        }
    }
}

/// Where dump output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Raw BSON of a single collection on standard output.
    Stdout,
    /// `<dir>/<db>/<collection>.bson` tree.
    Directory(PathBuf),
}

impl OutputTarget {
    /// Parse an `--out` value; `-` means standard output.
    pub fn parse(value: &str) -> Self {
        if value == "-" {
            OutputTarget::Stdout
        } else {
            OutputTarget::Directory(PathBuf::from(value))
        }
    }

    pub fn is_stdout(&self) -> bool {
        matches!(self, OutputTarget::Stdout)
    }

    /// Output directory, if writing to a directory tree.
    pub fn directory(&self) -> Option<&Path> {
        match self {
            OutputTarget::Directory(dir) => Some(dir),
            OutputTarget::Stdout => None,
        }
    }
}

impl Default for OutputTarget {
    fn default() -> Self {
        OutputTarget::Directory(PathBuf::from("dump"))
    }
}

/// Selectors and flags for one dump run.
#[derive(Debug, Clone, Default)]
pub struct DumpOptions {
    pub db: Option<String>,
    pub collection: Option<String>,
    pub query: Option<Document>,
    pub force_table_scan: bool,
    pub output: OutputTarget,
    pub oplog: bool,
    pub dump_users_and_roles: bool,
    pub excluded_collections: Vec<String>,
    pub excluded_collection_prefixes: Vec<String>,
}

impl DumpOptions {
    fn db(&self) -> Option<&str> {
        self.db.as_deref().filter(|s| !s.is_empty())
    }

    fn collection(&self) -> Option<&str> {
        self.collection.as_deref().filter(|s| !s.is_empty())
    }

    /// Check the option combination and derive the scope.
    ///
    /// # Returns
    /// * `Result<DumpScope>` - Scope of the run, or a configuration error
    pub fn validate(&self) -> Result<DumpScope> {
        let db = self.db();
        let collection = self.collection();

        if self.output.is_stdout() && collection.is_none() {
            return Err(DumpError::conflict(
                "can only dump a single collection to stdout",
            ));
        }
        if collection.is_some() && db.is_none() {
            return Err(DumpError::requires("--collection", "--db"));
        }
        if self.query.is_some() && collection.is_none() {
            return Err(DumpError::requires("--query", "--collection"));
        }
        if self.dump_users_and_roles && db.is_none() {
            return Err(DumpError::requires("--dumpDbUsersAndRoles", "--db"));
        }
        if self.dump_users_and_roles && collection.is_some() {
            return Err(DumpError::conflict(
                "cannot specify a collection when running with --dumpDbUsersAndRoles",
            ));
        }
        if self.oplog && (db.is_some() || collection.is_some()) {
            return Err(DumpError::conflict(
                "--oplog mode is only supported on full dumps",
            ));
        }

        Ok(match (db, collection) {
            (Some(db), Some(collection)) => DumpScope::Collection {
                db: db.to_string(),
                collection: collection.to_string(),
            },
            (Some(db), None) => DumpScope::Database(db.to_string()),
            _ => DumpScope::Everything,
        })
    }

    /// Whether a collection is excluded by name or prefix.
    pub fn is_excluded(&self, collection: &str) -> bool {
        self.excluded_collections.iter().any(|c| c == collection)
            || self
                .excluded_collection_prefixes
                .iter()
                .any(|p| collection.starts_with(p.as_str()))
    }

    pub fn scan_mode(&self) -> ScanMode {
        ScanMode::select(self.query.is_some(), self.force_table_scan)
    }
}

/// Parse a `--query` value written as (relaxed or canonical) extended JSON.
pub fn parse_query(text: &str) -> Result<Document> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ConfigError::InvalidQuery(format!("{text}: {e}")))?;

    match Bson::try_from(value) {
        Ok(Bson::Document(doc)) => Ok(doc),
        Ok(other) => Err(ConfigError::InvalidQuery(format!(
            "query must be a document, found {:?}",
            other.element_type()
        ))
        .into()),
        Err(e) => Err(ConfigError::InvalidQuery(format!("{text}: {e}")).into()),
    }
}
