//! Multipart session descriptors, the per-object journal and the persisted
//! session map.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use oxio_common::error::{OxioError, Result};
use oxio_common::time;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::atomic::AtomicFile;

/// One uploaded part, as recorded in the session journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PartMetadata {
    pub part_number: i32,
    #[serde(rename = "ETag")]
    pub etag: String,
    pub size: i64,
    pub last_modified: DateTime<Utc>,
}

/// One in-flight multipart upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MultipartSession {
    #[serde(rename = "UploadID")]
    pub upload_id: String,
    pub initiated: DateTime<Utc>,
    pub parts: Vec<PartMetadata>,
    pub total_parts: i32,
}

impl MultipartSession {
    pub fn new(upload_id: String) -> Self {
        Self {
            upload_id,
            initiated: time::now(),
            parts: Vec::new(),
            total_parts: 0,
        }
    }

    /// Insert or replace a part record, keeping `parts` sorted by part
    /// number. Re-uploading an existing part number replaces the old record;
    /// `total_parts` counts distinct part numbers.
    pub fn upsert_part(&mut self, part: PartMetadata) {
        match self
            .parts
            .binary_search_by_key(&part.part_number, |p| p.part_number)
        {
            Ok(idx) => self.parts[idx] = part,
            Err(idx) => {
                self.parts.insert(idx, part);
                self.total_parts += 1;
            }
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionMap {
    #[serde(rename = "ActiveSession")]
    active: HashMap<String, MultipartSession>,
}

/// The process-wide map of active sessions, rewritten to one well-known file
/// after every mutation so in-flight uploads survive a restart.
#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    map: SessionMap,
}

impl SessionStore {
    /// Load the persisted map; a missing file is an empty map.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let map = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
                OxioError::InternalError(format!(
                    "corrupt session map {}: {err}",
                    path.display()
                ))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => SessionMap::default(),
            Err(err) => return Err(OxioError::Io(err)),
        };
        Ok(Self { path, map })
    }

    pub fn get(&self, object: &str) -> Option<&MultipartSession> {
        self.map.active.get(object)
    }

    pub fn insert(&mut self, object: String, session: MultipartSession) {
        self.map.active.insert(object, session);
    }

    pub fn remove(&mut self, object: &str) -> Option<MultipartSession> {
        self.map.active.remove(object)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MultipartSession)> {
        self.map.active.iter()
    }

    /// Persist the whole map, temp-file + rename so a crash never leaves a
    /// truncated map behind.
    pub async fn save(&self) -> Result<()> {
        let bytes = serde_json::to_vec(&self.map).map_err(|err| {
            OxioError::InternalError(format!("failed to serialize session map: {err}"))
        })?;
        let mut file = AtomicFile::create(&self.path).await?;
        file.write_all(&bytes).await?;
        file.close_and_publish().await?;
        Ok(())
    }
}

/// Read the per-object session journal. The journal always holds exactly one
/// JSON document.
pub async fn read_journal(path: &Path) -> Result<MultipartSession> {
    let bytes = fs::read(path).await?;
    serde_json::from_slice(&bytes).map_err(|err| {
        OxioError::InternalError(format!(
            "corrupt session journal {}: {err}",
            path.display()
        ))
    })
}

/// Rewrite the session journal in full: truncate, encode, fsync.
pub async fn write_journal(path: &Path, session: &MultipartSession) -> Result<()> {
    let bytes = serde_json::to_vec(session).map_err(|err| {
        OxioError::InternalError(format!("failed to serialize session journal: {err}"))
    })?;
    let mut file = File::create(path).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    Ok(())
}
