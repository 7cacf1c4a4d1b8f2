//! tandem-store: staged filesystem object store.
//!
//! Each object lives in its own directory under `{root}/objects/{id}` and
//! moves through a staged lifecycle: `create` makes the directory and a
//! control record, `put_blob` streams the payload into `blob.tmp` while
//! hashing it, `put_manifest` writes the client-authored manifest, and
//! `commit` atomically renames `blob.tmp` to `blob` and flips the committed
//! bit. The rename is the only operation that makes a blob readable, so a
//! crash mid-upload leaves nothing visible; the control record itself is
//! always replaced via write-then-rename.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

const OBJECTS_DIR: &str = "objects";
const BLOB: &str = "blob";
const BLOB_TMP: &str = "blob.tmp";
const MANIFEST: &str = "manifest.json";
const META: &str = "meta.json";

const COPY_BUF: usize = 64 * 1024;

/// Control record persisted as `meta.json` next to the object files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub size: u64,
    pub etag: String,
    #[serde(rename = "createdAt", with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub committed: bool,
}

/// Store failures.
#[derive(Debug)]
pub enum StoreError {
    /// The object (or a required staged file) does not exist.
    NotFound,
    /// Filesystem failure.
    Io(io::Error),
    /// `meta.json` could not be decoded.
    Meta(serde_json::Error),
}

impl StoreError {
    /// Whether this maps to a missing resource rather than a server fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

impl core::fmt::Display for StoreError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "object not found"),
            Self::Io(e) => write!(f, "storage I/O error: {e}"),
            Self::Meta(e) => write!(f, "meta record corrupt: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Meta(e) => Some(e),
            Self::NotFound => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            Self::NotFound
        } else {
            Self::Io(e)
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Meta(e)
    }
}

/// Filesystem-backed staged object store.
///
/// Concurrent uploads to the same id are not serialized here; the client
/// contract is one uploader per id.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(OBJECTS_DIR)).await?;
        Ok(Self { root })
    }

    fn obj_dir(&self, id: &str) -> PathBuf {
        self.root.join(OBJECTS_DIR).join(id)
    }

    /// Path of the committed blob, for handing to a file-serving primitive.
    pub fn blob_path(&self, id: &str) -> PathBuf {
        self.obj_dir(id).join(BLOB)
    }

    fn blob_tmp(&self, id: &str) -> PathBuf {
        self.obj_dir(id).join(BLOB_TMP)
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.obj_dir(id).join(MANIFEST)
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.obj_dir(id).join(META)
    }

    // Ids are minted as UUIDs; anything else never touches the filesystem.
    fn check_id(id: &str) -> Result<(), StoreError> {
        Uuid::parse_str(id).map(drop).map_err(|_| StoreError::NotFound)
    }

    /// Allocate a fresh object: a new directory plus an uncommitted control
    /// record. Returns the object id.
    pub async fn create(&self) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        fs::create_dir_all(self.obj_dir(&id)).await?;
        let meta = Meta {
            size: 0,
            etag: String::new(),
            created_at: OffsetDateTime::now_utc(),
            committed: false,
        };
        self.write_meta(&id, &meta).await?;
        debug!(object = %id, "object created");
        Ok(id)
    }

    /// Stream `reader` into the staging file while hashing it. Updates the
    /// control record's size and etag but does not commit. Returns
    /// `(size, etag)` where the etag is the lowercase hex SHA-256 of the
    /// payload.
    pub async fn put_blob(
        &self,
        id: &str,
        mut reader: impl AsyncRead + Unpin,
    ) -> Result<(u64, String), StoreError> {
        Self::check_id(id)?;
        let mut file = fs::File::create(self.blob_tmp(id)).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUF];
        let mut size: u64 = 0;
        loop {
            let n = reader.read(&mut buf).await.map_err(StoreError::Io)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            size += n as u64;
        }
        file.sync_all().await?;
        let etag = hex::encode(hasher.finalize());

        let mut meta = self.read_meta(id).await?;
        meta.size = size;
        meta.etag = etag.clone();
        self.write_meta(id, &meta).await?;
        debug!(object = %id, size, "blob staged");
        Ok((size, etag))
    }

    /// Stream `reader` into `manifest.json`. The manifest is opaque and may
    /// be rewritten, so no rename dance here, just an fsync.
    pub async fn put_manifest(
        &self,
        id: &str,
        mut reader: impl AsyncRead + Unpin,
    ) -> Result<(), StoreError> {
        Self::check_id(id)?;
        let mut file = fs::File::create(self.manifest_path(id)).await?;
        let mut buf = vec![0u8; COPY_BUF];
        loop {
            let n = reader.read(&mut buf).await.map_err(StoreError::Io)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
        }
        file.sync_all().await?;
        Ok(())
    }

    /// Make the staged blob readable: requires both `blob.tmp` and
    /// `manifest.json`, renames the blob into place (atomic on POSIX), and
    /// persists the committed control record. Returns the final record.
    pub async fn commit(&self, id: &str) -> Result<Meta, StoreError> {
        Self::check_id(id)?;
        let mut meta = self.read_meta(id).await?;
        fs::metadata(self.blob_tmp(id)).await?;
        fs::metadata(self.manifest_path(id)).await?;
        fs::rename(self.blob_tmp(id), self.blob_path(id)).await?;
        meta.committed = true;
        self.write_meta(id, &meta).await?;
        info!(object = %id, size = meta.size, "object committed");
        Ok(meta)
    }

    /// Control record for an object that has a blob in any stage.
    ///
    /// Returns the record when either the committed blob or the staging file
    /// exists, so the HTTP layer can distinguish "not committed yet" (409)
    /// from "gone" (404). A crash after the commit rename but before the
    /// meta flip reads as not-committed here.
    pub async fn stat_blob(&self, id: &str) -> Result<Meta, StoreError> {
        Self::check_id(id)?;
        let meta = self.read_meta(id).await?;
        if fs::try_exists(self.blob_path(id)).await? || fs::try_exists(self.blob_tmp(id)).await? {
            return Ok(meta);
        }
        Err(StoreError::NotFound)
    }

    /// Open the manifest for a streaming read.
    pub async fn open_manifest(&self, id: &str) -> Result<fs::File, StoreError> {
        Self::check_id(id)?;
        Ok(fs::File::open(self.manifest_path(id)).await?)
    }

    /// Remove the whole object directory. Removing an object that is
    /// already gone is not an error.
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        Self::check_id(id)?;
        match fs::remove_dir_all(self.obj_dir(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Sweep every object whose control record is unreadable or older than
    /// `ttl`, committed or not. Returns the number of objects removed.
    pub async fn gc(&self, ttl: Duration) -> Result<usize, StoreError> {
        let base = self.root.join(OBJECTS_DIR);
        let mut entries = fs::read_dir(&base).await?;
        let now = OffsetDateTime::now_utc();
        let mut removed = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            let expired = match self.read_meta(&id).await {
                Ok(meta) => now - meta.created_at >= ttl,
                Err(e) => {
                    warn!(object = %id, error = %e, "unreadable meta, sweeping");
                    true
                }
            };
            if expired {
                // Sweep directly; ids on disk may predate the UUID check.
                if let Err(e) = fs::remove_dir_all(entry.path()).await {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!(object = %id, error = %e, "gc removal failed");
                        continue;
                    }
                }
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "object gc swept");
        }
        Ok(removed)
    }

    async fn read_meta(&self, id: &str) -> Result<Meta, StoreError> {
        let bytes = fs::read(self.meta_path(id)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    // Write-then-rename so readers never observe a torn record.
    async fn write_meta(&self, id: &str, meta: &Meta) -> Result<(), StoreError> {
        let path = self.meta_path(id);
        let tmp = tmp_sibling(&path);
        let bytes = serde_json::to_vec_pretty(meta)?;
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}
