//! End-to-end runs of the dump engine against the in-memory source

use super::*;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bson::{Document, RawDocumentBuf, Timestamp, doc};
use tokio_test::io::Builder;

use crate::error::{DumpError, Result};
use crate::source::{DocSource, DumpSource, FindRequest, MemorySource, Namespace};

use super::oplog::REPLICA_SET_OPLOG;

// ===== Helpers =====

fn ts(time: u32, increment: u32) -> Timestamp {
    Timestamp { time, increment }
}

fn oplog_entry(time: u32, increment: u32) -> Document {
    doc! { "ts": ts(time, increment), "op": "i", "ns": "app.a", "o": { "_id": i64::from(time) } }
}

fn to_dir(out: &Path) -> DumpOptions {
    DumpOptions {
        output: OutputTarget::Directory(out.to_path_buf()),
        ..Default::default()
    }
}

fn orchestrator(source: impl DumpSource + 'static, options: DumpOptions) -> DumpOrchestrator {
    DumpOrchestrator::new(Arc::new(source), options, DumpSettings::default())
}

fn concat(docs: &[Document]) -> Vec<u8> {
    docs.iter()
        .flat_map(|d| RawDocumentBuf::from_document(d).unwrap().into_bytes())
        .collect()
}

fn read_bson(path: &Path) -> Vec<Document> {
    let bytes = std::fs::read(path).unwrap();
    let len = bytes.len() as u64;
    let mut reader = std::io::Cursor::new(bytes);
    let mut docs = Vec::new();
    while reader.position() < len {
        docs.push(Document::from_reader(&mut reader).unwrap());
    }
    docs
}

/// Relative paths of every file under `root`.
fn files_under(root: &Path) -> BTreeSet<String> {
    fn walk(dir: &Path, root: &Path, found: &mut BTreeSet<String>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(&path, root, found);
            } else {
                let relative = path.strip_prefix(root).unwrap();
                found.insert(relative.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    let mut found = BTreeSet::new();
    walk(root, root, &mut found);
    found
}

/// Names directly inside `dir`.
fn entries_of(dir: &Path) -> BTreeSet<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

type Hook = Arc<dyn Fn(&MemorySource, &Namespace) + Send + Sync>;

/// Delegating source that runs a hook after every cursor open, used to
/// change the deployment while a dump is in progress.
struct Hooked {
    inner: MemorySource,
    on_open: Hook,
}

#[async_trait]
impl DumpSource for Hooked {
    async fn run_command(&self, db: &str, command: Document) -> Result<Document> {
        self.inner.run_command(db, command).await
    }

    async fn find_one(
        &self,
        db: &str,
        collection: &str,
        query: Document,
        sort: Option<Document>,
    ) -> Result<Option<Document>> {
        self.inner.find_one(db, collection, query, sort).await
    }

    async fn find_docs(
        &self,
        db: &str,
        collection: &str,
        request: FindRequest,
    ) -> Result<Box<dyn DocSource>> {
        let cursor = self.inner.find_docs(db, collection, request).await?;
        (self.on_open)(&self.inner, &Namespace::new(db, collection));
        Ok(cursor)
    }

    async fn database_names(&self) -> Result<Vec<String>> {
        self.inner.database_names().await
    }

    async fn collection_names(&self, db: &str) -> Result<Vec<String>> {
        self.inner.collection_names(db).await
    }
}

fn two_collections() -> MemorySource {
    MemorySource::new()
        .with_collection("app", "a", vec![doc! { "_id": 1 }, doc! { "_id": 2 }])
        .with_collection("app", "b", vec![doc! { "_id": "x", "tags": ["red"] }])
        .with_index("app", "a", "_id_", doc! { "_id": 1 })
}

fn replica_set_with_data() -> MemorySource {
    two_collections()
        .replica_set("rs0")
        .with_oplog(REPLICA_SET_OPLOG, vec![oplog_entry(90, 1), oplog_entry(100, 1)])
}

// ===== Scopes and layout =====

#[tokio::test]
async fn test_database_dump_layout() {
    let dir = tempfile::tempdir().unwrap();
    let options = DumpOptions {
        db: Some("app".into()),
        ..to_dir(dir.path())
    };

    let summary = orchestrator(two_collections(), options).run().await.unwrap();

    assert_eq!(
        files_under(dir.path()),
        set(&["app/a.bson", "app/a.metadata.json", "app/b.bson", "app/b.metadata.json"])
    );
    assert_eq!(summary.collections, 2);
    assert_eq!(summary.documents, 3);
    assert_eq!(summary.oplog_entries, None);

    let a = read_bson(&dir.path().join("app/a.bson"));
    assert_eq!(a, vec![doc! { "_id": 1 }, doc! { "_id": 2 }]);

    let metadata: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("app/a.metadata.json")).unwrap())
            .unwrap();
    assert_eq!(metadata["indexes"][0]["name"], "_id_");

    let metadata: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("app/b.metadata.json")).unwrap())
            .unwrap();
    assert_eq!(metadata["indexes"], serde_json::json!([]));
}

#[tokio::test]
async fn test_everything_skips_local() {
    let dir = tempfile::tempdir().unwrap();
    let source = two_collections()
        .with_collection("shop", "orders", vec![doc! { "_id": 7 }])
        .with_collection("local", "startup_log", vec![doc! { "_id": "host" }]);

    orchestrator(source, to_dir(dir.path())).run().await.unwrap();

    let files = files_under(dir.path());
    assert!(files.contains("app/a.bson"));
    assert!(files.contains("shop/orders.bson"));
    assert!(files.iter().all(|f| !f.starts_with("local/")));
}

#[tokio::test]
async fn test_local_dumped_when_named() {
    let dir = tempfile::tempdir().unwrap();
    let source = MemorySource::new().with_collection("local", "startup_log", vec![doc! { "_id": "host" }]);
    let options = DumpOptions {
        db: Some("local".into()),
        ..to_dir(dir.path())
    };

    orchestrator(source, options).run().await.unwrap();
    assert!(files_under(dir.path()).contains("local/startup_log.bson"));
}

#[tokio::test]
async fn test_excluded_collections_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let source = two_collections()
        .with_collection("app", "tmp_import", vec![doc! { "_id": 1 }])
        .with_collection("app", "audit", vec![doc! { "_id": 1 }]);
    let options = DumpOptions {
        db: Some("app".into()),
        excluded_collections: vec!["audit".into()],
        excluded_collection_prefixes: vec!["tmp_".into()],
        ..to_dir(dir.path())
    };

    let summary = orchestrator(source, options).run().await.unwrap();
    assert_eq!(summary.collections, 2);

    let files = files_under(dir.path());
    assert!(!files.contains("app/audit.bson"));
    assert!(!files.contains("app/tmp_import.bson"));
    assert!(!files.contains("app/system.namespaces.bson"));
    assert!(!files.contains("app/system.indexes.bson"));
}

#[tokio::test]
async fn test_single_collection_with_query() {
    let dir = tempfile::tempdir().unwrap();
    let source = MemorySource::new().with_collection(
        "app",
        "people",
        vec![doc! { "_id": 1, "age": 17 }, doc! { "_id": 2, "age": 30 }, doc! { "_id": 3, "age": 45 }],
    );
    let options = DumpOptions {
        db: Some("app".into()),
        collection: Some("people".into()),
        query: Some(parse_query(r#"{"age": {"$gte": 18}}"#).unwrap()),
        ..to_dir(dir.path())
    };

    let summary = orchestrator(source, options).run().await.unwrap();
    assert_eq!(summary.documents, 2);
    assert_eq!(
        read_bson(&dir.path().join("app/people.bson")),
        vec![doc! { "_id": 2, "age": 30 }, doc! { "_id": 3, "age": 45 }]
    );
    assert!(dir.path().join("app/people.metadata.json").exists());
}

#[tokio::test]
async fn test_stdout_dump_emits_cursor_bytes_only() {
    let docs = vec![doc! { "_id": 1, "v": "one" }, doc! { "_id": 2, "v": "two" }];
    let opened = Arc::new(std::sync::Mutex::new(Vec::new()));
    let recorder = Arc::clone(&opened);
    let source = Hooked {
        inner: MemorySource::new()
            .with_collection("app", "a", docs.clone())
            .with_index("app", "a", "_id_", doc! { "_id": 1 }),
        on_open: Arc::new(move |_: &MemorySource, ns: &Namespace| {
            recorder.lock().unwrap().push(ns.to_string());
        }),
    };
    let options = DumpOptions {
        db: Some("app".into()),
        collection: Some("a".into()),
        output: OutputTarget::Stdout,
        ..Default::default()
    };
    let cwd = std::env::current_dir().unwrap();
    let before = entries_of(&cwd);

    let stdout = Builder::new().write(&concat(&docs)).build();
    let mut dump = orchestrator(source, options).with_stdout(Box::new(stdout));
    let summary = dump.run().await.unwrap();

    assert_eq!(summary.collections, 1);
    assert_eq!(summary.documents, 2);
    // dropping the mock asserts every expected byte was written
    drop(dump);

    // only the data cursor is opened, never the index catalog
    assert_eq!(*opened.lock().unwrap(), vec!["app.a".to_string()]);
    assert_eq!(entries_of(&cwd), before);
    assert!(!cwd.join("dump").join("app").exists());
}

// ===== Oplog window =====

#[tokio::test]
async fn test_oplog_contains_only_newer_entries() {
    let dir = tempfile::tempdir().unwrap();
    let source = Hooked {
        inner: replica_set_with_data(),
        on_open: Arc::new(|src: &MemorySource, ns: &Namespace| {
            if ns.db == "app" && !ns.collection.starts_with("system.") {
                let next = src.documents("local", REPLICA_SET_OPLOG).len() as u32;
                src.insert("local", REPLICA_SET_OPLOG, oplog_entry(200 + next, 1));
            }
        }),
    };
    let options = DumpOptions {
        oplog: true,
        ..to_dir(dir.path())
    };

    let summary = orchestrator(source, options).run().await.unwrap();
    assert_eq!(summary.oplog_entries, Some(2));

    let entries = read_bson(&dir.path().join("oplog.bson"));
    assert_eq!(entries.len(), 2);
    for entry in &entries {
        let entry_ts = entry.get_timestamp("ts").unwrap();
        assert!((entry_ts.time, entry_ts.increment) > (100, 1));
    }
    assert!(files_under(dir.path()).contains("app/a.bson"));
}

#[tokio::test]
async fn test_oplog_with_no_new_entries_is_empty_file() {
    let dir = tempfile::tempdir().unwrap();
    let options = DumpOptions {
        oplog: true,
        ..to_dir(dir.path())
    };

    let summary = orchestrator(replica_set_with_data(), options).run().await.unwrap();
    assert_eq!(summary.oplog_entries, Some(0));
    assert_eq!(std::fs::metadata(dir.path().join("oplog.bson")).unwrap().len(), 0);
}

#[tokio::test]
async fn test_rollover_during_oplog_copy_fails_run() {
    let dir = tempfile::tempdir().unwrap();
    let source = Hooked {
        inner: replica_set_with_data(),
        on_open: Arc::new(|src: &MemorySource, ns: &Namespace| {
            if ns.db == "local" {
                let existing = src.documents("local", REPLICA_SET_OPLOG).len();
                src.insert("local", REPLICA_SET_OPLOG, oplog_entry(300, 1));
                src.truncate_front("local", REPLICA_SET_OPLOG, existing);
            }
        }),
    };
    let options = DumpOptions {
        oplog: true,
        ..to_dir(dir.path())
    };

    let err = orchestrator(source, options).run().await.unwrap_err();
    assert!(err.is_overflow());

    let files = files_under(dir.path());
    assert!(files.contains("app/a.bson"));
    assert!(files.contains("app/b.bson"));
    assert!(files.contains("oplog.bson"));
}

#[tokio::test]
async fn test_rollover_during_collection_dump_fails_before_copy() {
    let dir = tempfile::tempdir().unwrap();
    let source = Hooked {
        inner: replica_set_with_data(),
        on_open: Arc::new(|src: &MemorySource, ns: &Namespace| {
            if ns.db == "app" && ns.collection == "b" {
                src.insert("local", REPLICA_SET_OPLOG, oplog_entry(150, 1));
                src.truncate_front("local", REPLICA_SET_OPLOG, 2);
            }
        }),
    };
    let options = DumpOptions {
        oplog: true,
        ..to_dir(dir.path())
    };

    let err = orchestrator(source, options).run().await.unwrap_err();
    assert!(matches!(err, DumpError::Overflow { ref collection, .. } if collection == REPLICA_SET_OPLOG));
    assert!(!dir.path().join("oplog.bson").exists());
}

#[tokio::test]
async fn test_oplog_on_non_master_fails_before_dumping() {
    let dir = tempfile::tempdir().unwrap();
    let options = DumpOptions {
        oplog: true,
        ..to_dir(dir.path())
    };

    let err = orchestrator(two_collections().not_master(), options)
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, DumpError::NotMaster(_)));
    assert!(files_under(dir.path()).is_empty());
}

#[tokio::test]
async fn test_master_slave_uses_main_oplog() {
    let dir = tempfile::tempdir().unwrap();
    let source = two_collections().with_oplog("oplog.$main", vec![oplog_entry(10, 1)]);
    let options = DumpOptions {
        oplog: true,
        ..to_dir(dir.path())
    };

    let summary = orchestrator(source, options).run().await.unwrap();
    assert_eq!(summary.oplog_entries, Some(0));
    assert!(dir.path().join("oplog.bson").exists());
}

// ===== Users and roles =====

fn with_auth_data(schema: i32) -> MemorySource {
    two_collections()
        .with_auth_schema_version(schema)
        .with_collection(
            "admin",
            "system.users",
            vec![
                doc! { "_id": "app.alice", "user": "alice", "db": "app" },
                doc! { "_id": "shop.bob", "user": "bob", "db": "shop" },
            ],
        )
        .with_collection(
            "admin",
            "system.roles",
            vec![doc! { "_id": "app.reader", "role": "reader", "db": "app" }],
        )
}

#[tokio::test]
async fn test_users_and_roles_filtered_to_database() {
    let dir = tempfile::tempdir().unwrap();
    let options = DumpOptions {
        db: Some("app".into()),
        dump_users_and_roles: true,
        ..to_dir(dir.path())
    };

    orchestrator(with_auth_data(5), options).run().await.unwrap();

    let users = read_bson(&dir.path().join("app/$admin.system.users"));
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].get_str("user").unwrap(), "alice");

    let roles = read_bson(&dir.path().join("app/$admin.system.roles"));
    assert_eq!(roles.len(), 1);
}

#[tokio::test]
async fn test_users_and_roles_require_schema_v3() {
    let dir = tempfile::tempdir().unwrap();
    let options = DumpOptions {
        db: Some("app".into()),
        dump_users_and_roles: true,
        ..to_dir(dir.path())
    };

    let err = orchestrator(with_auth_data(1), options).run().await.unwrap_err();
    assert!(err.is_config());
    assert!(err.to_string().contains("found: 1"));
    assert!(files_under(dir.path()).is_empty());
}

#[tokio::test]
async fn test_users_and_roles_skipped_for_admin() {
    let dir = tempfile::tempdir().unwrap();
    let options = DumpOptions {
        db: Some("admin".into()),
        dump_users_and_roles: true,
        ..to_dir(dir.path())
    };

    orchestrator(with_auth_data(5), options).run().await.unwrap();

    let files = files_under(dir.path());
    assert!(files.contains("admin/system.users.bson"));
    assert!(!files.contains("admin/$admin.system.users"));
}

// ===== Failures =====

#[tokio::test]
async fn test_invalid_options_touch_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let out: PathBuf = dir.path().join("dump");
    let cases = [
        DumpOptions {
            collection: Some("a".into()),
            ..to_dir(&out)
        },
        DumpOptions {
            db: Some("app".into()),
            query: Some(doc! { "a": 1 }),
            ..to_dir(&out)
        },
        DumpOptions {
            db: Some("app".into()),
            oplog: true,
            ..to_dir(&out)
        },
        DumpOptions {
            db: Some("app".into()),
            collection: Some("a".into()),
            dump_users_and_roles: true,
            ..to_dir(&out)
        },
    ];

    for options in cases {
        let err = orchestrator(two_collections(), options).run().await.unwrap_err();
        assert!(err.is_config(), "unexpected error: {err}");
    }
    assert!(!out.exists());
}

#[tokio::test]
async fn test_read_error_leaves_partial_file_and_closes_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let source = MemorySource::new()
        .with_collection("app", "a", (0..5).map(|i| doc! { "_id": i }).collect())
        .with_failing_read("app", "a", 2);
    let handle = source.clone();
    let options = DumpOptions {
        db: Some("app".into()),
        ..to_dir(dir.path())
    };

    let err = orchestrator(source, options).run().await.unwrap_err();
    assert!(err.to_string().contains("app.a"));

    let partial = read_bson(&dir.path().join("app/a.bson"));
    assert_eq!(partial, vec![doc! { "_id": 0 }, doc! { "_id": 1 }]);
    assert!(!dir.path().join("app/a.metadata.json").exists());
    assert_eq!(handle.open_cursor_count(), 0);
}

#[tokio::test]
async fn test_open_failure_is_query_error() {
    let dir = tempfile::tempdir().unwrap();
    let source = two_collections().with_failing_open("app", "b");
    let options = DumpOptions {
        db: Some("app".into()),
        ..to_dir(dir.path())
    };

    let err = orchestrator(source, options).run().await.unwrap_err();
    assert!(matches!(err, DumpError::Query { ref namespace, .. } if namespace == "app.b"));
    assert!(dir.path().join("app/a.bson").exists());
}

#[tokio::test]
async fn test_unsupported_query_operator_is_query_error() {
    let dir = tempfile::tempdir().unwrap();
    let options = DumpOptions {
        db: Some("app".into()),
        collection: Some("a".into()),
        query: Some(doc! { "_id": { "$regex": "^1" } }),
        ..to_dir(dir.path())
    };

    let err = orchestrator(two_collections(), options).run().await.unwrap_err();
    assert!(matches!(err, DumpError::Query { ref namespace, .. } if namespace == "app.a"));
}

#[tokio::test]
async fn test_missing_catalog_entry_writes_empty_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let source = two_collections().with_uncataloged_collection(
        "app",
        "virtual",
        vec![doc! { "_id": 1 }, doc! { "_id": 2 }],
    );
    let options = DumpOptions {
        db: Some("app".into()),
        ..to_dir(dir.path())
    };

    let summary = orchestrator(source, options).run().await.unwrap();
    assert_eq!(summary.collections, 3);
    assert_eq!(
        read_bson(&dir.path().join("app/virtual.bson")),
        vec![doc! { "_id": 1 }, doc! { "_id": 2 }]
    );

    let metadata: serde_json::Value = serde_json::from_slice(
        &std::fs::read(dir.path().join("app/virtual.metadata.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(metadata, serde_json::json!({ "options": {}, "indexes": [] }));

    // cataloged collections of the same run keep their indexes
    let metadata: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("app/a.metadata.json")).unwrap())
            .unwrap();
    assert_eq!(metadata["indexes"][0]["name"], "_id_");
}

#[tokio::test]
async fn test_all_cursors_closed_after_success() {
    let dir = tempfile::tempdir().unwrap();
    let source = replica_set_with_data();
    let handle = source.clone();
    let options = DumpOptions {
        oplog: true,
        ..to_dir(dir.path())
    };

    orchestrator(source, options).run().await.unwrap();
    assert_eq!(handle.open_cursor_count(), 0);
}
