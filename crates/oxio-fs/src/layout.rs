use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub(crate) const SESSION_JOURNAL_SUFFIX: &str = "$multiparts";

/// Maps (bucket, object, part) tuples onto the storage root.
///
/// Part files and the per-object session journal are siblings of the final
/// object path, tagged with the reserved `$` sentinel: `R/B/O$<n>` and
/// `R/B/O$multiparts`. The name validator rejects object keys that could
/// collide with these.
#[derive(Debug, Clone)]
pub struct PathLayout {
    root: PathBuf,
}

impl PathLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bucket_path(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    pub fn object_path(&self, bucket: &str, object: &str) -> PathBuf {
        self.bucket_path(bucket).join(object)
    }

    pub fn part_path(&self, bucket: &str, object: &str, part_number: i32) -> PathBuf {
        self.with_suffix(bucket, object, &format!("${part_number}"))
    }

    pub fn session_journal_path(&self, bucket: &str, object: &str) -> PathBuf {
        self.with_suffix(bucket, object, SESSION_JOURNAL_SUFFIX)
    }

    fn with_suffix(&self, bucket: &str, object: &str, suffix: &str) -> PathBuf {
        let mut path: OsString = self.object_path(bucket, object).into_os_string();
        path.push(suffix);
        PathBuf::from(path)
    }
}
