use thiserror::Error;

#[derive(Debug, Error)]
pub enum OxioError {
    #[error("invalid bucket name: {0}")]
    BucketNameInvalid(String),
    #[error("invalid object name: {bucket}/{object}")]
    ObjectNameInvalid { bucket: String, object: String },
    #[error("bucket not found: {0}")]
    BucketNotFound(String),
    #[error("bucket already exists: {0}")]
    BucketAlreadyExists(String),
    #[error("root path full: {0}")]
    RootPathFull(String),
    #[error("invalid upload id: {0}")]
    InvalidUploadId(String),
    #[error("invalid digest: {md5}")]
    InvalidDigest { md5: String },
    #[error("digest mismatch for {bucket}/{object}: {md5}")]
    BadDigest {
        md5: String,
        bucket: String,
        object: String,
    },
    #[error("signature does not match")]
    SignatureDoesNotMatch,
    #[error("malformed complete multipart upload body")]
    MalformedXml,
    #[error("part numbers are not in ascending order")]
    InvalidPartOrder,
    #[error("invalid part number: {0}")]
    InvalidPart(i32),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl OxioError {
    pub fn s3_error_code(&self) -> &'static str {
        match self {
            Self::BucketNameInvalid(_) => "InvalidBucketName",
            Self::ObjectNameInvalid { .. } => "InvalidObjectName",
            Self::BucketNotFound(_) => "NoSuchBucket",
            Self::BucketAlreadyExists(_) => "BucketAlreadyExists",
            Self::RootPathFull(_) => "InsufficientStorage",
            Self::InvalidUploadId(_) => "NoSuchUpload",
            Self::InvalidDigest { .. } => "InvalidDigest",
            Self::BadDigest { .. } => "BadDigest",
            Self::SignatureDoesNotMatch => "SignatureDoesNotMatch",
            Self::MalformedXml => "MalformedXML",
            Self::InvalidPartOrder => "InvalidPartOrder",
            Self::InvalidPart(_) => "InvalidPart",
            Self::InternalError(_) | Self::Io(_) => "InternalError",
        }
    }
}

pub type Result<T> = std::result::Result<T, OxioError>;
