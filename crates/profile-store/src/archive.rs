//! Profile export/import as gzipped tarballs.
//!
//! Layout inside the archive:
//!   metadata.json   serialized record + export timestamp
//!   user-data/...   the profile's user-data directory contents

use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tar::{Archive, Builder};

use crate::errors::ProfileError;
use crate::model::ProfileRecord;

const METADATA_ENTRY: &str = "metadata.json";
const USER_DATA_PREFIX: &str = "user-data";

#[derive(Debug, Serialize, Deserialize)]
struct ExportMetadata {
    profile: ProfileRecord,
    exported_at: DateTime<Utc>,
}

pub(crate) fn export_profile(
    profile: &ProfileRecord,
    export_path: &Path,
) -> Result<PathBuf, ProfileError> {
    let archive_path = if export_path.extension().is_some() {
        export_path.to_path_buf()
    } else {
        export_path.with_extension("tar.gz")
    };
    if let Some(parent) = archive_path.parent() {
        fs::create_dir_all(parent).map_err(|e| ProfileError::io("create export dir", e))?;
    }

    let file = File::create(&archive_path).map_err(|e| ProfileError::io("create archive", e))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);

    let metadata = ExportMetadata {
        profile: profile.clone(),
        exported_at: Utc::now(),
    };
    let payload = serde_json::to_vec_pretty(&metadata)
        .map_err(|e| ProfileError::Archive(format!("serialize metadata: {e}")))?;
    let mut header = tar::Header::new_gnu();
    header.set_size(payload.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, METADATA_ENTRY, payload.as_slice())
        .map_err(|e| ProfileError::io("append metadata", e))?;

    if profile.user_data_dir.is_dir() {
        builder
            .append_dir_all(USER_DATA_PREFIX, &profile.user_data_dir)
            .map_err(|e| ProfileError::io("append user data", e))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| ProfileError::io("finish archive", e))?;
    encoder
        .finish()
        .map_err(|e| ProfileError::io("finish gzip", e))?;

    Ok(archive_path)
}

pub(crate) fn read_archive_metadata(
    archive_path: &Path,
) -> Result<Option<ProfileRecord>, ProfileError> {
    let file = File::open(archive_path).map_err(|e| ProfileError::io("open archive", e))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    let entries = archive
        .entries()
        .map_err(|e| ProfileError::Archive(format!("read entries: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| ProfileError::Archive(format!("read entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| ProfileError::Archive(format!("entry path: {e}")))?;
        if path.as_ref() == Path::new(METADATA_ENTRY) {
            let mut raw = Vec::new();
            entry
                .read_to_end(&mut raw)
                .map_err(|e| ProfileError::io("read metadata", e))?;
            let metadata: ExportMetadata = serde_json::from_slice(&raw)
                .map_err(|e| ProfileError::Archive(format!("parse metadata: {e}")))?;
            return Ok(Some(metadata.profile));
        }
    }
    Ok(None)
}

pub(crate) fn extract_user_data(archive_path: &Path, dest: &Path) -> Result<(), ProfileError> {
    fs::create_dir_all(dest).map_err(|e| ProfileError::UserDataDirUnwritable {
        path: dest.to_path_buf(),
        reason: e.to_string(),
    })?;

    let file = File::open(archive_path).map_err(|e| ProfileError::io("open archive", e))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    let entries = archive
        .entries()
        .map_err(|e| ProfileError::Archive(format!("read entries: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| ProfileError::Archive(format!("read entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| ProfileError::Archive(format!("entry path: {e}")))?
            .into_owned();

        let Ok(relative) = path.strip_prefix(USER_DATA_PREFIX) else {
            continue;
        };
        // Reject path traversal; archives are caller-supplied.
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            return Err(ProfileError::Archive(format!(
                "archive entry escapes destination: {}",
                path.display()
            )));
        }
        let target = dest.join(relative);
        if entry.header().entry_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| ProfileError::io("create dir", e))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| ProfileError::io("create dir", e))?;
            }
            entry
                .unpack(&target)
                .map_err(|e| ProfileError::io("unpack entry", e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn export_then_inspect_metadata() {
        let dir = tempdir().unwrap();
        let user_data = dir.path().join("profile-data");
        fs::create_dir_all(user_data.join("Default")).unwrap();
        fs::write(user_data.join("Default").join("Preferences"), b"{}").unwrap();

        let mut profile = ProfileRecord::new("archived", user_data);
        profile.tags = vec!["backup".into()];

        let archive = export_profile(&profile, &dir.path().join("out")).unwrap();
        assert!(archive.to_string_lossy().ends_with(".tar.gz"));

        let restored = read_archive_metadata(&archive).unwrap().unwrap();
        assert_eq!(restored.name, "archived");
        assert_eq!(restored.tags, vec!["backup".to_string()]);
    }

    #[test]
    fn extraction_recreates_the_tree() {
        let dir = tempdir().unwrap();
        let user_data = dir.path().join("src-data");
        fs::create_dir_all(user_data.join("Default").join("Network")).unwrap();
        fs::write(
            user_data.join("Default").join("Network").join("Cookies"),
            b"jar",
        )
        .unwrap();

        let profile = ProfileRecord::new("tree", user_data);
        let archive = export_profile(&profile, &dir.path().join("tree-export")).unwrap();

        let dest = dir.path().join("restored");
        extract_user_data(&archive, &dest).unwrap();
        let cookie = dest.join("Default").join("Network").join("Cookies");
        assert_eq!(fs::read(cookie).unwrap(), b"jar");
    }
}
