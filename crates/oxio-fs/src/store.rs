use std::path::PathBuf;

use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

use oxio_common::error::{OxioError, Result};

use crate::layout::PathLayout;
use crate::session::SessionStore;
use crate::validate;

const SESSIONS_FILE_NAME: &str = "multiparts.json";
const DEFAULT_MIN_FREE_DISK_PERCENT: f64 = 10.0;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct FsConfig {
    pub root_dir: PathBuf,
    /// File the active-session map is persisted to after every mutation.
    pub sessions_file: PathBuf,
    /// Writes are refused once free disk falls to this percentage.
    pub min_free_disk_percent: f64,
}

impl FsConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        let root_dir = root_dir.into();
        let sessions_file = root_dir.join(validate::SYS_DIR_NAME).join(SESSIONS_FILE_NAME);
        Self {
            root_dir,
            sessions_file,
            min_free_disk_percent: DEFAULT_MIN_FREE_DISK_PERCENT,
        }
    }
}

/// Filesystem-backed multipart upload engine.
///
/// All public operations serialize through one engine-wide mutex held for the
/// operation's full duration, streaming included. Sessions are independent
/// per object key, so sharding the lock is a legal future refactor.
#[derive(Debug)]
pub struct FsStore {
    pub(crate) layout: PathLayout,
    pub(crate) min_free_disk_percent: f64,
    pub(crate) state: Mutex<SessionStore>,
}

impl FsStore {
    pub async fn new(config: FsConfig) -> Result<Self> {
        fs::create_dir_all(&config.root_dir).await?;
        if let Some(parent) = config.sessions_file.parent() {
            fs::create_dir_all(parent).await?;
        }
        let sessions = SessionStore::load(config.sessions_file).await?;

        info!(root = %config.root_dir.display(), "multipart engine ready");
        Ok(Self {
            layout: PathLayout::new(config.root_dir),
            min_free_disk_percent: config.min_free_disk_percent,
            state: Mutex::new(sessions),
        })
    }

    /// Buckets are plain directories under the storage root; the multipart
    /// engine itself only ever checks that they exist.
    pub async fn make_bucket(&self, bucket: &str) -> Result<()> {
        if !validate::is_valid_bucket_name(bucket) {
            return Err(OxioError::BucketNameInvalid(bucket.to_string()));
        }

        let bucket_path = self.layout.bucket_path(bucket);
        match fs::metadata(&bucket_path).await {
            Ok(_) => return Err(OxioError::BucketAlreadyExists(bucket.to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(OxioError::Io(err)),
        }

        fs::create_dir_all(&bucket_path).await?;
        Ok(())
    }

    pub(crate) async fn ensure_bucket_exists(&self, bucket: &str) -> Result<()> {
        match fs::metadata(self.layout.bucket_path(bucket)).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(OxioError::BucketNotFound(bucket.to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(OxioError::BucketNotFound(bucket.to_string()))
            }
            Err(err) => Err(OxioError::InternalError(format!(
                "stat bucket {bucket}: {err}"
            ))),
        }
    }
}
