//! Durable catalog of browser identities ("profiles").
//!
//! A profile is a Chromium user-data directory plus metadata, registered in a
//! single on-disk index (`profiles.json`). The store owns every mutation of
//! that index and writes it atomically (temp file + rename) so a crash
//! mid-write can never leave a truncated index behind. Reads go through an
//! in-memory snapshot and never touch the disk.

mod archive;
mod errors;
mod model;
mod resolver;
mod store;
mod validate;

pub use errors::{ProfileError, ProfileMiss};
pub use model::{ProfileIndex, ProfileLifecycle, ProfileRecord, ResolvedProfile, INDEX_VERSION};
pub use resolver::resolve_from;
pub use store::{NewProfile, ProfileStore};
pub use validate::{
    validate_user_data_dir, RuntimeValidation, StaticValidation, ValidationReport,
    ValidationStatus,
};
