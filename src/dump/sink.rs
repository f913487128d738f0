//! Output locations and file creation for the dump tree

use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::AsyncWrite;

use crate::error::{DumpError, Result};

/// Type-erased byte sink (a file, standard output, or a test double).
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Label used in write errors for standard output.
pub const STDOUT_LABEL: &str = "<stdout>";

pub fn collection_path(out_dir: &Path, db: &str, collection: &str) -> PathBuf {
    out_dir.join(db).join(format!("{collection}.bson"))
}

pub fn metadata_path(out_dir: &Path, db: &str, collection: &str) -> PathBuf {
    out_dir.join(db).join(format!("{collection}.metadata.json"))
}

pub fn oplog_path(out_dir: &Path) -> PathBuf {
    out_dir.join("oplog.bson")
}

/// `<out>/<db>/$admin.<collection>` for auth collections filtered to `db`.
pub fn auth_collection_path(out_dir: &Path, db: &str, collection: &str) -> PathBuf {
    out_dir.join(db).join(format!("$admin.{collection}"))
}

/// Create (or truncate) a file, creating missing parent directories.
pub async fn create_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| DumpError::write(parent, e))?;
    }
    File::create(path).await.map_err(|e| DumpError::write(path, e))
}

pub fn stdout() -> BoxedWriter {
    Box::new(tokio::io::stdout())
}
