//! Best-effort asynchronous transfer of screenshots and recordings to blob
//! storage.
//!
//! `submit` returns a stable handle immediately; a bounded worker pool does
//! the actual uploads with exponential back-off. Upload failure never fails
//! the producing script, it only lands in the artifact's status.

mod artifact;
mod object_store;
mod uploader;

pub use artifact::Artifact;
pub use object_store::{MemoryStore, ObjectStore, S3Store, UploadError};
pub use uploader::{ArtifactUploader, UploaderConfig};
