//! The multipart upload operations: initiate, write parts, list, commit,
//! abort.

use std::path::Path;

use base64::engine::general_purpose::{STANDARD as BASE64_STANDARD, URL_SAFE as BASE64_URL_SAFE};
use base64::Engine;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Sha256, Sha512};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use oxio_common::error::{OxioError, Result};
use oxio_common::time;
use oxio_common::types::ObjectMetadata;
use oxio_common::verify::PayloadVerifier;

use crate::atomic::AtomicFile;
use crate::disk;
use crate::session::{self, MultipartSession, PartMetadata, SessionStore};
use crate::store::FsStore;
use crate::validate;

const UPLOAD_ID_LEN: usize = 47;
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const COPY_BUF_SIZE: usize = 64 * 1024;
const DEFAULT_MAX_UPLOADS: usize = 1000;
const DEFAULT_MAX_PARTS: usize = 1000;

#[derive(Debug, Clone)]
pub struct ListMultipartUploadsQuery {
    pub prefix: String,
    pub key_marker: String,
    pub upload_id_marker: String,
    pub max_uploads: usize,
}

impl Default for ListMultipartUploadsQuery {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            key_marker: String::new(),
            upload_id_marker: String::new(),
            max_uploads: DEFAULT_MAX_UPLOADS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadMetadata {
    pub object: String,
    pub upload_id: String,
    pub initiated: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ListMultipartUploadsResult {
    pub uploads: Vec<UploadMetadata>,
    pub is_truncated: bool,
    pub next_key_marker: Option<String>,
    pub next_upload_id_marker: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ListObjectPartsQuery {
    pub upload_id: String,
    pub part_number_marker: i32,
    pub max_parts: usize,
}

impl ListObjectPartsQuery {
    pub fn for_upload(upload_id: impl Into<String>) -> Self {
        Self {
            upload_id: upload_id.into(),
            part_number_marker: 0,
            max_parts: DEFAULT_MAX_PARTS,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListObjectPartsResult {
    pub parts: Vec<PartMetadata>,
    pub is_truncated: bool,
    pub next_part_number_marker: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename = "CompleteMultipartUpload")]
struct CompleteMultipartUploadXml {
    #[serde(rename = "Part", default)]
    parts: Vec<CompletePartXml>,
}

#[derive(Debug, Deserialize)]
struct CompletePartXml {
    #[serde(rename = "PartNumber")]
    part_number: i32,
    #[serde(rename = "ETag")]
    etag: String,
}

impl FsStore {
    /// Initiate a multipart session for (bucket, object) and return its
    /// upload id. A live session for the same key is superseded: its part
    /// files and journal are removed before the new session is installed.
    pub async fn new_multipart_upload(&self, bucket: &str, object: &str) -> Result<String> {
        let mut state = self.state.lock().await;

        disk::check_free(self.layout.root(), self.min_free_disk_percent)?;
        Self::check_bucket_name(bucket)?;
        Self::check_object_name(bucket, object)?;
        self.ensure_bucket_exists(bucket).await?;

        let object_path = self.layout.object_path(bucket, object);
        if let Some(dir) = object_path.parent() {
            fs::create_dir_all(dir).await?;
        }

        if let Some(prior) = state.remove(object) {
            self.remove_session_files_best_effort(bucket, object, &prior)
                .await;
            info!(
                bucket,
                object,
                upload_id = %prior.upload_id,
                "superseded in-flight multipart session"
            );
        }

        let upload_id = new_upload_id(bucket, object);
        let session = MultipartSession::new(upload_id.clone());
        session::write_journal(
            &self.layout.session_journal_path(bucket, object),
            &session,
        )
        .await?;
        state.insert(object.to_string(), session);
        state.save().await?;

        info!(bucket, object, upload_id = %upload_id, "initiated multipart upload");
        Ok(upload_id)
    }

    /// Stream one part to disk, verifying its digests before it becomes
    /// visible. Returns the part's ETag, the lowercase hex MD5 of the bytes
    /// written.
    ///
    /// `expected_md5` is the base64 `Content-MD5` header value; `data` must
    /// yield exactly `size` bytes. Re-uploading an existing part number
    /// replaces both the bytes and the journal record.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_object_part<R>(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        expected_md5: Option<&str>,
        part_number: i32,
        size: u64,
        data: R,
        signature: Option<&dyn PayloadVerifier>,
    ) -> Result<String>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut state = self.state.lock().await;

        disk::check_free(self.layout.root(), self.min_free_disk_percent)?;
        if part_number < 1 {
            return Err(OxioError::InvalidPart(part_number));
        }
        Self::check_bucket_name(bucket)?;
        Self::check_object_name(bucket, object)?;
        if !Self::session_matches(&state, object, upload_id) {
            return Err(OxioError::InvalidUploadId(upload_id.to_string()));
        }

        // Decode the declared digest before any byte is read, so a garbled
        // header lets the caller drop the connection eagerly.
        let expected_md5_hex = match expected_md5.map(str::trim).filter(|v| !v.is_empty()) {
            Some(value) => Some(decode_content_md5(value)?),
            None => None,
        };

        self.ensure_bucket_exists(bucket).await?;

        let part_path = self.layout.part_path(bucket, object, part_number);
        let mut part_file = AtomicFile::create(&part_path).await?;

        let (md5_hex, sha256_hex) = match copy_exact(&mut part_file, data, size).await {
            Ok(digests) => digests,
            Err(err) => return purge_on_error(part_file, err.into()).await,
        };

        if let Some(expected) = &expected_md5_hex {
            if !md5_hex_equal(expected, &md5_hex) {
                let err = OxioError::BadDigest {
                    md5: expected.clone(),
                    bucket: bucket.to_string(),
                    object: object.to_string(),
                };
                return purge_on_error(part_file, err).await;
            }
        }

        if let Some(verifier) = signature {
            match verifier.matches(&sha256_hex) {
                Ok(true) => {}
                Ok(false) => {
                    return purge_on_error(part_file, OxioError::SignatureDoesNotMatch).await
                }
                Err(err) => return purge_on_error(part_file, err).await,
            }
        }

        part_file.close_and_publish().await?;

        let stat = fs::metadata(&part_path).await?;
        let part = PartMetadata {
            part_number,
            etag: md5_hex.clone(),
            size: i64::try_from(stat.len()).map_err(|_| {
                OxioError::InternalError(format!("part too large: {bucket}/{object}"))
            })?,
            last_modified: stat
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| time::now()),
        };

        // Journal first, then the shared map: the journal on disk is the
        // authoritative record for this object.
        let journal_path = self.layout.session_journal_path(bucket, object);
        let mut session = session::read_journal(&journal_path).await?;
        session.upsert_part(part);
        session::write_journal(&journal_path, &session).await?;
        state.insert(object.to_string(), session);
        state.save().await?;

        debug!(bucket, object, part_number, size, etag = %md5_hex, "wrote object part");
        Ok(md5_hex)
    }

    /// Assemble the object from its parts, following the client's manifest,
    /// and return the committed object's metadata.
    ///
    /// The object file is published before any cleanup runs: a crash
    /// mid-commit can leave stray part files behind, never a missing object.
    pub async fn complete_multipart_upload<R>(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        manifest: R,
        signature: Option<&dyn PayloadVerifier>,
    ) -> Result<ObjectMetadata>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut state = self.state.lock().await;

        Self::check_bucket_name(bucket)?;
        Self::check_object_name(bucket, object)?;
        if !Self::session_matches(&state, object, upload_id) {
            return Err(OxioError::InvalidUploadId(upload_id.to_string()));
        }
        self.ensure_bucket_exists(bucket).await?;

        let object_path = self.layout.object_path(bucket, object);
        let mut object_file = AtomicFile::create(&object_path).await?;

        let mut manifest_bytes = Vec::new();
        let mut manifest = manifest;
        if let Err(err) = manifest.read_to_end(&mut manifest_bytes).await {
            return purge_on_error(object_file, err.into()).await;
        }

        if let Some(verifier) = signature {
            let manifest_sha256 = hex::encode(Sha256::digest(&manifest_bytes));
            match verifier.matches(&manifest_sha256) {
                Ok(true) => {}
                Ok(false) => {
                    return purge_on_error(object_file, OxioError::SignatureDoesNotMatch).await
                }
                Err(err) => return purge_on_error(object_file, err).await,
            }
        }

        let manifest_parts = match parse_complete_manifest(&manifest_bytes) {
            Ok(parts) => parts,
            Err(err) => return purge_on_error(object_file, err).await,
        };
        if !strictly_ascending(&manifest_parts) {
            return purge_on_error(object_file, OxioError::InvalidPartOrder).await;
        }

        let mut object_md5 = Md5::new();
        for entry in &manifest_parts {
            let part_path = self.layout.part_path(bucket, object, entry.part_number);
            let bytes = match fs::read(&part_path).await {
                Ok(bytes) => bytes,
                Err(err) => return purge_on_error(object_file, err.into()).await,
            };

            let expected = match hex::decode(trim_etag_quotes(&entry.etag)) {
                Ok(digest) => digest,
                Err(_) => {
                    let err = OxioError::InvalidDigest {
                        md5: entry.etag.clone(),
                    };
                    return purge_on_error(object_file, err).await;
                }
            };
            if expected != Md5::digest(&bytes).as_slice() {
                let err = OxioError::BadDigest {
                    md5: entry.etag.clone(),
                    bucket: bucket.to_string(),
                    object: object.to_string(),
                };
                return purge_on_error(object_file, err).await;
            }

            if let Err(err) = object_file.write_all(&bytes).await {
                return purge_on_error(object_file, err.into()).await;
            }
            object_md5.update(&bytes);
        }

        // Publish first; only then forget the session and drop its files.
        object_file.close_and_publish().await?;

        let session = state.remove(object);
        for entry in &manifest_parts {
            self.remove_file_best_effort(&self.layout.part_path(bucket, object, entry.part_number))
                .await;
        }
        if let Some(session) = &session {
            for part in &session.parts {
                self.remove_file_best_effort(&self.layout.part_path(
                    bucket,
                    object,
                    part.part_number,
                ))
                .await;
            }
        }
        self.remove_file_best_effort(&self.layout.session_journal_path(bucket, object))
            .await;
        state.save().await?;

        let stat = fs::metadata(&object_path).await?;
        let size = i64::try_from(stat.len()).map_err(|_| {
            OxioError::InternalError(format!("object too large: {bucket}/{object}"))
        })?;
        info!(bucket, object, upload_id, size, "completed multipart upload");

        Ok(ObjectMetadata {
            bucket: bucket.to_string(),
            object: object.to_string(),
            created: stat
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| time::now()),
            size,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            md5: hex::encode(object_md5.finalize()),
        })
    }

    /// Tear a session down: every recorded part file and the journal are
    /// removed, then the session is forgotten. Missing part files are
    /// tolerated; a second abort fails with `InvalidUploadId`.
    pub async fn abort_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;

        Self::check_bucket_name(bucket)?;
        Self::check_object_name(bucket, object)?;
        if !Self::session_matches(&state, object, upload_id) {
            return Err(OxioError::InvalidUploadId(upload_id.to_string()));
        }
        self.ensure_bucket_exists(bucket).await?;

        let Some(session) = state.remove(object) else {
            return Err(OxioError::InvalidUploadId(upload_id.to_string()));
        };
        for part in &session.parts {
            remove_file_if_exists(&self.layout.part_path(bucket, object, part.part_number))
                .await?;
        }
        remove_file_if_exists(&self.layout.session_journal_path(bucket, object)).await?;
        state.save().await?;

        info!(bucket, object, upload_id, "aborted multipart upload");
        Ok(())
    }

    /// List in-flight sessions whose object key starts with `prefix`,
    /// applying the S3 key/upload-id marker rules. Entries are ordered by
    /// (object key, upload id); when more than `max_uploads` match, exactly
    /// the first `max_uploads` are returned and the next markers point at
    /// the first excluded entry.
    pub async fn list_multipart_uploads(
        &self,
        bucket: &str,
        query: &ListMultipartUploadsQuery,
    ) -> Result<ListMultipartUploadsResult> {
        let state = self.state.lock().await;

        Self::check_bucket_name(bucket)?;
        self.ensure_bucket_exists(bucket).await?;

        let mut matching = state
            .iter()
            .filter(|(object, _)| object.starts_with(&query.prefix))
            .filter(|(object, session)| {
                matches_markers(
                    object,
                    &session.upload_id,
                    &query.key_marker,
                    &query.upload_id_marker,
                )
            })
            .map(|(object, session)| UploadMetadata {
                object: object.clone(),
                upload_id: session.upload_id.clone(),
                initiated: session.initiated,
            })
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| {
            a.object
                .cmp(&b.object)
                .then_with(|| a.upload_id.cmp(&b.upload_id))
        });

        let mut result = ListMultipartUploadsResult::default();
        for upload in matching {
            if result.uploads.len() == query.max_uploads {
                result.is_truncated = true;
                result.next_key_marker = Some(upload.object);
                result.next_upload_id_marker = Some(upload.upload_id);
                break;
            }
            result.uploads.push(upload);
        }
        Ok(result)
    }

    /// List the parts of one session in part-number order, starting at
    /// `part_number_marker`; when more than `max_parts` remain, the next
    /// marker is the first part number not returned.
    pub async fn list_object_parts(
        &self,
        bucket: &str,
        object: &str,
        query: &ListObjectPartsQuery,
    ) -> Result<ListObjectPartsResult> {
        let state = self.state.lock().await;

        Self::check_bucket_name(bucket)?;
        Self::check_object_name(bucket, object)?;
        if !Self::session_matches(&state, object, &query.upload_id) {
            return Err(OxioError::InvalidUploadId(query.upload_id.clone()));
        }
        self.ensure_bucket_exists(bucket).await?;

        let session =
            session::read_journal(&self.layout.session_journal_path(bucket, object)).await?;

        let start = query.part_number_marker.max(1);
        let mut result = ListObjectPartsResult::default();
        for i in start..=session.total_parts {
            if result.parts.len() == query.max_parts {
                result.is_truncated = true;
                result.next_part_number_marker = Some(i);
                break;
            }
            let part = session.parts.get((i - 1) as usize).ok_or_else(|| {
                OxioError::InternalError(format!(
                    "session journal for {bucket}/{object} is missing part index {i}"
                ))
            })?;
            result.parts.push(part.clone());
        }
        Ok(result)
    }

    fn check_bucket_name(bucket: &str) -> Result<()> {
        if validate::is_valid_bucket_name(bucket) {
            Ok(())
        } else {
            Err(OxioError::BucketNameInvalid(bucket.to_string()))
        }
    }

    fn check_object_name(bucket: &str, object: &str) -> Result<()> {
        if validate::is_valid_object_name(object) {
            Ok(())
        } else {
            Err(OxioError::ObjectNameInvalid {
                bucket: bucket.to_string(),
                object: object.to_string(),
            })
        }
    }

    fn session_matches(state: &SessionStore, object: &str, upload_id: &str) -> bool {
        state
            .get(object)
            .is_some_and(|session| session.upload_id == upload_id)
    }

    async fn remove_session_files_best_effort(
        &self,
        bucket: &str,
        object: &str,
        session: &MultipartSession,
    ) {
        for part in &session.parts {
            self.remove_file_best_effort(&self.layout.part_path(bucket, object, part.part_number))
                .await;
        }
        self.remove_file_best_effort(&self.layout.session_journal_path(bucket, object))
            .await;
    }

    async fn remove_file_best_effort(&self, path: &Path) {
        if let Err(err) = remove_file_if_exists(path).await {
            warn!(path = %path.display(), %err, "leaving stray multipart file behind");
        }
    }
}

async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(OxioError::Io(err)),
    }
}

async fn purge_on_error<T>(file: AtomicFile, err: OxioError) -> Result<T> {
    if let Err(purge_err) = file.close_and_purge().await {
        warn!(%purge_err, "failed to drop in-flight temp file");
    }
    Err(err)
}

/// 512-bit hash of fresh CSPRNG output, the namespace and the clock, base64
/// URL-safe, truncated to 47 characters.
fn new_upload_id(bucket: &str, object: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(OsRng.next_u64().to_string().as_bytes());
    hasher.update(bucket.as_bytes());
    hasher.update(object.as_bytes());
    hasher.update(time::now().to_rfc3339().as_bytes());

    let mut id = BASE64_URL_SAFE.encode(hasher.finalize());
    id.truncate(UPLOAD_ID_LEN);
    id
}

/// Stream exactly `size` bytes from `data` into `file`, feeding the MD5 and
/// SHA-256 hashers along the way. A source that ends early is an error.
async fn copy_exact<R>(
    file: &mut AtomicFile,
    mut data: R,
    size: u64,
) -> std::io::Result<(String, String)>
where
    R: AsyncRead + Unpin + Send,
{
    let mut md5 = Md5::new();
    let mut sha256 = Sha256::new();
    let mut buf = vec![0_u8; COPY_BUF_SIZE];
    let mut remaining = size;

    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = data.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("part body ended {remaining} bytes short"),
            ));
        }
        file.write_all(&buf[..n]).await?;
        md5.update(&buf[..n]);
        sha256.update(&buf[..n]);
        remaining -= n as u64;
    }

    Ok((hex::encode(md5.finalize()), hex::encode(sha256.finalize())))
}

/// Decode a base64 `Content-MD5` header value to lowercase hex.
fn decode_content_md5(expected: &str) -> Result<String> {
    let decoded = BASE64_STANDARD
        .decode(expected.trim())
        .map_err(|_| OxioError::InvalidDigest {
            md5: expected.to_string(),
        })?;
    Ok(hex::encode(decoded))
}

fn md5_hex_equal(expected_hex: &str, computed_hex: &str) -> bool {
    match (hex::decode(expected_hex), hex::decode(computed_hex)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn trim_etag_quotes(etag: &str) -> &str {
    etag.trim().trim_matches('"')
}

fn parse_complete_manifest(bytes: &[u8]) -> Result<Vec<CompletePartXml>> {
    let text = std::str::from_utf8(bytes).map_err(|_| OxioError::MalformedXml)?;
    let manifest: CompleteMultipartUploadXml =
        quick_xml::de::from_str(text).map_err(|_| OxioError::MalformedXml)?;
    Ok(manifest.parts)
}

fn strictly_ascending(parts: &[CompletePartXml]) -> bool {
    parts
        .windows(2)
        .all(|pair| pair[0].part_number < pair[1].part_number)
}

fn matches_markers(object: &str, upload_id: &str, key_marker: &str, upload_id_marker: &str) -> bool {
    if key_marker.is_empty() {
        return true;
    }
    if upload_id_marker.is_empty() {
        return object > key_marker;
    }
    upload_id > upload_id_marker && object >= key_marker
}
