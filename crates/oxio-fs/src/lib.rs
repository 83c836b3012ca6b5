pub mod atomic;
pub mod disk;
pub mod layout;
pub mod multipart;
pub mod session;
pub mod store;
pub mod validate;

pub use multipart::{
    ListMultipartUploadsQuery, ListMultipartUploadsResult, ListObjectPartsQuery,
    ListObjectPartsResult, UploadMetadata,
};
pub use session::{MultipartSession, PartMetadata};
pub use store::{FsConfig, FsStore};
