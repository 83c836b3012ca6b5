use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata of a committed object, as returned by a completed multipart
/// upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub bucket: String,
    pub object: String,
    pub created: DateTime<Utc>,
    pub size: i64,
    pub content_type: String,
    pub md5: String,
}
