//! Oplog replay window
//!
//! Captures the newest oplog timestamp before any collection is dumped and
//! verifies, around the oplog copy, that the timestamp has not rolled off
//! the capped collection.

use std::fmt;
use std::sync::Arc;

use bson::{Document, Timestamp, doc};
use tracing::{debug, info};

use crate::error::{DumpError, Result};
use crate::source::{DumpSource, bson_is_falsy};

/// Oplog collection of replica set members.
pub const REPLICA_SET_OPLOG: &str = "oplog.rs";
/// Oplog collection of legacy master/slave deployments.
pub const MASTER_SLAVE_OPLOG: &str = "oplog.$main";

const OPLOG_DB: &str = "local";

/// Moment at which the window is verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckPoint {
    BeforeCopy,
    AfterCopy,
}

impl fmt::Display for CheckPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckPoint::BeforeCopy => write!(f, "before oplog copy"),
            CheckPoint::AfterCopy => write!(f, "after oplog copy"),
        }
    }
}

/// Replay window of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct OplogWindow {
    /// `oplog.rs` or `oplog.$main`, fixed by the topology probe.
    pub collection: String,
    /// Newest oplog entry at capture time.
    pub start: Timestamp,
    /// Set once both check points passed.
    pub validated: bool,
    checks: u8,
}

impl OplogWindow {
    /// Filter selecting entries written after the start timestamp.
    pub fn entries_filter(&self) -> Document {
        doc! { "ts": { "$gt": self.start } }
    }
}

/// Resolves the oplog collection and guards the replay window.
pub struct OplogWindowManager {
    source: Arc<dyn DumpSource>,
}

impl OplogWindowManager {
    pub fn new(source: Arc<dyn DumpSource>) -> Self {
        Self { source }
    }

    /// Probe the topology and pick the oplog collection.
    ///
    /// # Returns
    /// * `Result<String>` - `oplog.rs` for replica sets, `oplog.$main` otherwise
    pub async fn resolve_oplog_collection(&self) -> Result<String> {
        let reply = self
            .source
            .run_command("admin", doc! { "isMaster": 1 })
            .await
            .map_err(|e| e.with_context("probing topology"))?;

        if reply.contains_key("hosts") {
            debug!("Topology probe reported a replica set, using local.{REPLICA_SET_OPLOG}");
            return Ok(REPLICA_SET_OPLOG.to_string());
        }
        if bson_is_falsy(reply.get("ismaster")) {
            return Err(DumpError::NotMaster(
                "oplog capture requires a replica set member or a master".to_string(),
            ));
        }

        debug!("No replica set hosts in topology probe, using local.{MASTER_SLAVE_OPLOG}");
        Ok(MASTER_SLAVE_OPLOG.to_string())
    }

    /// Resolve the oplog collection and record its newest timestamp.
    pub async fn capture_start(&self) -> Result<OplogWindow> {
        let collection = self.resolve_oplog_collection().await?;

        let newest = self
            .source
            .find_one(OPLOG_DB, &collection, doc! {}, Some(doc! { "$natural": -1 }))
            .await
            .map_err(|e| DumpError::OplogRead(format!("{OPLOG_DB}.{collection}: {e}")))?
            .ok_or_else(|| {
                DumpError::OplogRead(format!("{OPLOG_DB}.{collection} has no entries"))
            })?;

        let start = entry_timestamp(&newest, &collection)?;
        info!(
            "Captured oplog start {} from {OPLOG_DB}.{collection}",
            display_timestamp(start)
        );

        Ok(OplogWindow {
            collection,
            start,
            validated: false,
            checks: 0,
        })
    }

    /// Whether `ts` is still covered by the oplog.
    ///
    /// True iff the oldest surviving entry is at or before `ts`. An empty
    /// oplog covers nothing.
    pub async fn still_exists(&self, collection: &str, ts: Timestamp) -> Result<bool> {
        let oldest = self
            .source
            .find_one(OPLOG_DB, collection, doc! {}, Some(doc! { "$natural": 1 }))
            .await
            .map_err(|e| DumpError::OplogRead(format!("{OPLOG_DB}.{collection}: {e}")))?;

        let Some(oldest) = oldest else {
            return Ok(false);
        };
        let oldest = entry_timestamp(&oldest, collection)?;
        debug!(
            "Oldest oplog entry {} against start {}",
            display_timestamp(oldest),
            display_timestamp(ts)
        );
        Ok((oldest.time, oldest.increment) <= (ts.time, ts.increment))
    }

    /// Fail with an overflow error when the window start has rolled off.
    pub async fn check_window(&self, window: &mut OplogWindow, point: CheckPoint) -> Result<()> {
        let exists = self.still_exists(&window.collection, window.start).await?;
        window.checks += 1;

        if !exists {
            return Err(DumpError::Overflow {
                collection: window.collection.clone(),
                timestamp: window.start,
            });
        }

        debug!("Oplog window intact {point}");
        if point == CheckPoint::AfterCopy && window.checks >= 2 {
            window.validated = true;
        }
        Ok(())
    }
}

fn entry_timestamp(entry: &Document, collection: &str) -> Result<Timestamp> {
    entry.get_timestamp("ts").map_err(|_| {
        DumpError::OplogRead(format!(
            "entry in {OPLOG_DB}.{collection} has no timestamp"
        ))
    })
}

/// Render a timestamp with its wall-clock time for logs.
pub fn display_timestamp(ts: Timestamp) -> String {
    match chrono::DateTime::from_timestamp(i64::from(ts.time), 0) {
        Some(at) => format!("Timestamp({}, {}) [{}]", ts.time, ts.increment, at.to_rfc3339()),
        None => format!("Timestamp({}, {})", ts.time, ts.increment),
    }
}
