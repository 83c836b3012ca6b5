use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Write-then-rename file handle.
///
/// Bytes go to a sibling temp file in the target's directory, so the final
/// rename never crosses a filesystem boundary. `close_and_publish` flushes,
/// fsyncs and renames the temp onto the target in one atomic step;
/// `close_and_purge` discards the temp without touching the target. Exactly
/// one of the two terminal verbs must be called per handle.
#[derive(Debug)]
pub struct AtomicFile {
    file: File,
    temp_path: PathBuf,
    target: PathBuf,
}

impl AtomicFile {
    pub async fn create(target: &Path) -> io::Result<AtomicFile> {
        let file_name = target.file_name().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "target path has no file name")
        })?;

        let mut temp_name = OsString::from(".");
        temp_name.push(file_name);
        temp_name.push(format!(".{}.tmp", Uuid::new_v4()));
        let temp_path = match target.parent() {
            Some(dir) => dir.join(temp_name),
            None => PathBuf::from(temp_name),
        };

        let file = File::create(&temp_path).await?;
        Ok(AtomicFile {
            file,
            temp_path,
            target: target.to_path_buf(),
        })
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await
    }

    /// Flush, fsync and rename the temp file onto the target path.
    pub async fn close_and_publish(self) -> io::Result<()> {
        let AtomicFile {
            mut file,
            temp_path,
            target,
        } = self;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &target).await
    }

    /// Close and delete the temp file, leaving the target path untouched.
    pub async fn close_and_purge(self) -> io::Result<()> {
        let AtomicFile {
            file, temp_path, ..
        } = self;
        drop(file);
        fs::remove_file(&temp_path).await
    }
}
