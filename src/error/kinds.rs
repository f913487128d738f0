use std::path::PathBuf;
use std::{fmt, io};

use crate::error::mongo::format_mongodb_error;

/// Crate-wide `Result` type using [`DumpError`] as the error.
///
/// This alias is re-exported by the parent `error` module and is intended
/// to be used throughout the crate for fallible operations.
pub type Result<T> = std::result::Result<T, DumpError>;

/// Top-level error type for dump operations.
///
/// Every variant except [`DumpError::MetadataLookup`] aborts the run. The
/// metadata variant is produced internally and downgraded to a warning by
/// the metadata exporter.
#[derive(Debug)]
pub enum DumpError {
    /// Invalid option combination or configuration, detected before any I/O.
    Config(ConfigError),

    /// The topology probe reported a node that is not a master.
    NotMaster(String),

    /// The oplog could not be read or is empty.
    OplogRead(String),

    /// The oplog rolled over while the dump was running.
    Overflow {
        /// Oplog collection that was checked (`oplog.rs` or `oplog.$main`).
        collection: String,
        /// Start timestamp that no longer exists in the oplog.
        timestamp: bson::Timestamp,
    },

    /// Opening a cursor failed.
    Query { namespace: String, message: String },

    /// Filesystem failure while creating or writing output.
    Write { path: PathBuf, source: io::Error },

    /// Collection options could not be read (non-fatal, logged).
    MetadataLookup { namespace: String, message: String },

    /// Failure reported by the data source, tagged with the phase that hit it.
    Source {
        phase: String,
        source: Box<DumpError>,
    },

    /// MongoDB driver errors.
    MongoDb(mongodb::error::Error),

    /// BSON / JSON encoding errors.
    Serialization(String),

    /// I/O errors without a known path (stdout, pipes).
    Io(io::Error),

    /// Generic error with a free-form message.
    Generic(String),
}

/// Configuration-specific errors.
#[derive(Debug)]
pub enum ConfigError {
    /// Config file not found.
    FileNotFound(String),

    /// Invalid config format.
    InvalidFormat(String),

    /// Invalid field value.
    InvalidValue { field: String, value: String },

    /// Two options that cannot be used together.
    Conflict(String),

    /// An option that requires another one that was not given.
    MissingDependency { option: String, requires: String },

    /// The `--query` value is not valid extended JSON.
    InvalidQuery(String),
}

impl DumpError {
    /// Attach the phase (usually a namespace plus an action) to an error.
    ///
    /// Errors that already carry their own namespace or path are returned
    /// unchanged.
    pub fn with_context(self, phase: impl Into<String>) -> Self {
        match self {
            err @ (DumpError::Config(_)
            | DumpError::Overflow { .. }
            | DumpError::Query { .. }
            | DumpError::Write { .. }
            | DumpError::Source { .. }) => err,
            other => DumpError::Source {
                phase: phase.into(),
                source: Box::new(other),
            },
        }
    }

    /// Strip phase wrappers and return the underlying error.
    pub fn root(&self) -> &DumpError {
        match self {
            DumpError::Source { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_overflow(&self) -> bool {
        matches!(self.root(), DumpError::Overflow { .. })
    }

    pub fn is_config(&self) -> bool {
        matches!(self.root(), DumpError::Config(_))
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        DumpError::Write {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn conflict(msg: impl Into<String>) -> Self {
        DumpError::Config(ConfigError::Conflict(msg.into()))
    }

    pub(crate) fn requires(option: &str, requires: &str) -> Self {
        DumpError::Config(ConfigError::MissingDependency {
            option: option.to_string(),
            requires: requires.to_string(),
        })
    }
}

/* ========================= Display & Error impls ========================= */

impl fmt::Display for DumpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DumpError::Config(e) => write!(f, "Configuration error: {e}"),
            DumpError::NotMaster(msg) => write!(f, "Not connected to master: {msg}"),
            DumpError::OplogRead(msg) => write!(f, "Unable to read oplog: {msg}"),
            DumpError::Overflow {
                collection,
                timestamp,
            } => write!(
                f,
                "oplog overflow: local.{collection} rolled over past Timestamp({}, {}) \
                 while the dump was running; the backup is not consistent, re-run with a \
                 larger oplog or during lower write load",
                timestamp.time, timestamp.increment
            ),
            DumpError::Query { namespace, message } => {
                write!(f, "Failed to query {namespace}: {message}")
            }
            DumpError::Write { path, source } => {
                write!(f, "Failed to write {}: {source}", path.display())
            }
            DumpError::MetadataLookup { namespace, message } => {
                write!(f, "Failed to read metadata for {namespace}: {message}")
            }
            DumpError::Source { phase, source } => write!(f, "{phase}: {source}"),
            DumpError::MongoDb(e) => format_mongodb_error(f, e),
            DumpError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            DumpError::Io(e) => write!(f, "I/O error: {e}"),
            DumpError::Generic(msg) => write!(f, "{msg}"),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {path}"),
            ConfigError::InvalidFormat(msg) => write!(f, "Invalid config format: {msg}"),
            ConfigError::InvalidValue { field, value } => {
                write!(f, "Invalid value '{value}' for field '{field}'")
            }
            ConfigError::Conflict(msg) => write!(f, "{msg}"),
            ConfigError::MissingDependency { option, requires } => {
                write!(f, "cannot use {option} without {requires}")
            }
            ConfigError::InvalidQuery(msg) => write!(f, "Invalid query: {msg}"),
        }
    }
}

impl std::error::Error for DumpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DumpError::Config(e) => Some(e),
            DumpError::Write { source, .. } => Some(source),
            DumpError::Source { source, .. } => Some(source.as_ref()),
            DumpError::MongoDb(e) => Some(e),
            DumpError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for ConfigError {}

/* ========================= Conversions to DumpError ========================= */

impl From<io::Error> for DumpError {
    fn from(err: io::Error) -> Self {
        DumpError::Io(err)
    }
}

impl From<mongodb::error::Error> for DumpError {
    fn from(err: mongodb::error::Error) -> Self {
        DumpError::MongoDb(err)
    }
}

impl From<ConfigError> for DumpError {
    fn from(err: ConfigError) -> Self {
        DumpError::Config(err)
    }
}

impl From<bson::raw::Error> for DumpError {
    fn from(err: bson::raw::Error) -> Self {
        DumpError::Serialization(format!("invalid raw document: {err}"))
    }
}

impl From<bson::de::Error> for DumpError {
    fn from(err: bson::de::Error) -> Self {
        DumpError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for DumpError {
    fn from(err: serde_json::Error) -> Self {
        DumpError::Serialization(err.to_string())
    }
}

impl From<String> for DumpError {
    fn from(msg: String) -> Self {
        DumpError::Generic(msg)
    }
}

impl From<&str> for DumpError {
    fn from(msg: &str) -> Self {
        DumpError::Generic(msg.to_owned())
    }
}
