use chrono::{DateTime, Utc};
use wheelhouse_core_types::{ArtifactId, ArtifactKind, SessionId};

/// One binary payload produced during step execution.
#[derive(Clone, Debug)]
pub struct Artifact {
    pub id: ArtifactId,
    pub kind: ArtifactKind,
    pub session: SessionId,
    /// Step that produced it; -1 for the starting-page pseudo-step.
    pub step_index: i64,
    pub created_at: DateTime<Utc>,
    pub content_type: String,
    pub filename: String,
    pub bytes: Vec<u8>,
    pub tags: Vec<String>,
}

impl Artifact {
    pub fn screenshot(session: SessionId, step_index: i64, bytes: Vec<u8>) -> Self {
        Self {
            id: ArtifactId::new(),
            kind: ArtifactKind::Screenshot,
            session,
            step_index,
            created_at: Utc::now(),
            content_type: "image/png".to_string(),
            filename: format!("step-{step_index}.png"),
            bytes,
            tags: Vec::new(),
        }
    }

    pub fn recording(session: SessionId, bytes: Vec<u8>, filename: impl Into<String>) -> Self {
        Self {
            id: ArtifactId::new(),
            kind: ArtifactKind::Recording,
            session,
            step_index: -1,
            created_at: Utc::now(),
            content_type: "video/webm".to_string(),
            filename: filename.into(),
            bytes,
            tags: Vec::new(),
        }
    }

    /// Deterministic destination key so a duplicate submit overwrites
    /// instead of duplicating: `{session}/{category}/{timestamp}/{filename}`.
    pub fn object_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.session,
            self.kind.category(),
            self.created_at.format("%Y%m%dT%H%M%S%3fZ"),
            self.filename
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_is_stable_for_one_artifact() {
        let artifact = Artifact::screenshot(SessionId::new(), 3, vec![1, 2, 3]);
        assert_eq!(artifact.object_key(), artifact.object_key());
        assert!(artifact.object_key().contains("/screenshots/"));
        assert!(artifact.object_key().ends_with("step-3.png"));
    }
}
