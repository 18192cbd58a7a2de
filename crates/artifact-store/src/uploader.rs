use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use wheelhouse_core_types::{ArtifactId, ArtifactRef, UploadState};

use crate::artifact::Artifact;
use crate::object_store::ObjectStore;

#[derive(Clone, Debug)]
pub struct UploaderConfig {
    pub workers: usize,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub queue_capacity: usize,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 5,
            base_backoff: Duration::from_millis(200),
            queue_capacity: 256,
        }
    }
}

/// Background uploader shared by every session.
///
/// With no object store configured (`artifact_bucket` absent), artifacts are
/// registered as `Local` and never leave the process.
pub struct ArtifactUploader {
    store: Option<Arc<dyn ObjectStore>>,
    statuses: Arc<DashMap<ArtifactId, UploadState>>,
    queue: Option<mpsc::Sender<Artifact>>,
    workers: Vec<JoinHandle<()>>,
}

impl ArtifactUploader {
    pub fn new(store: Option<Arc<dyn ObjectStore>>, config: UploaderConfig) -> Self {
        let statuses: Arc<DashMap<ArtifactId, UploadState>> = Arc::new(DashMap::new());

        let Some(store) = store else {
            return Self {
                store: None,
                statuses,
                queue: None,
                workers: Vec::new(),
            };
        };

        let (tx, rx) = mpsc::channel::<Artifact>(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(config.workers.max(1));
        for worker_id in 0..config.workers.max(1) {
            let rx = Arc::clone(&rx);
            let store = Arc::clone(&store);
            let statuses = Arc::clone(&statuses);
            let config = config.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let artifact = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(artifact) = artifact else {
                        break;
                    };
                    Self::upload_with_retries(worker_id, &*store, &statuses, artifact, &config)
                        .await;
                }
            }));
        }

        Self {
            store: Some(store),
            statuses,
            queue: Some(tx),
            workers,
        }
    }

    /// Disabled uploader: everything stays local.
    pub fn disabled() -> Self {
        Self::new(None, UploaderConfig::default())
    }

    pub fn uploads_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Register an artifact and hand back its stable reference immediately.
    /// The upload happens in the background; failures only mark the status.
    pub fn submit(&self, artifact: Artifact) -> ArtifactRef {
        let id = artifact.id.clone();
        let kind = artifact.kind;

        let state = match &self.queue {
            None => UploadState::Local,
            Some(queue) => match queue.try_send(artifact) {
                Ok(()) => UploadState::UploadPending,
                Err(err) => {
                    warn!(target: "artifact-store", %id, "upload queue rejected artifact: {err}");
                    UploadState::UploadFailed {
                        reason: "upload queue full or closed".to_string(),
                    }
                }
            },
        };
        self.statuses.insert(id.clone(), state.clone());

        ArtifactRef {
            id,
            kind,
            upload: state,
        }
    }

    pub fn status(&self, id: &ArtifactId) -> Option<UploadState> {
        self.statuses.get(id).map(|entry| entry.clone())
    }

    /// Number of artifacts still waiting on their upload.
    pub fn backlog(&self) -> usize {
        self.statuses
            .iter()
            .filter(|entry| matches!(entry.value(), UploadState::UploadPending))
            .count()
    }

    /// Test helper: wait until no upload is pending (or the timeout passes).
    pub async fn wait_idle(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.backlog() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop accepting work and let in-flight uploads finish.
    pub async fn shutdown(mut self) {
        drop(self.queue.take());
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
    }

    async fn upload_with_retries(
        worker_id: usize,
        store: &dyn ObjectStore,
        statuses: &DashMap<ArtifactId, UploadState>,
        artifact: Artifact,
        config: &UploaderConfig,
    ) {
        let key = artifact.object_key();
        let mut backoff = config.base_backoff;
        let mut last_error = String::new();

        for attempt in 1..=config.max_attempts.max(1) {
            match store
                .put(&key, artifact.bytes.clone(), &artifact.content_type)
                .await
            {
                Ok(uri) => {
                    info!(
                        target: "artifact-store",
                        worker = worker_id,
                        id = %artifact.id,
                        %uri,
                        attempt,
                        "artifact uploaded"
                    );
                    statuses.insert(artifact.id.clone(), UploadState::Uploaded { uri });
                    return;
                }
                Err(err) => {
                    last_error = err.to_string();
                    warn!(
                        target: "artifact-store",
                        worker = worker_id,
                        id = %artifact.id,
                        attempt,
                        error = %last_error,
                        "artifact upload attempt failed"
                    );
                    if attempt < config.max_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                }
            }
        }

        statuses.insert(
            artifact.id.clone(),
            UploadState::UploadFailed { reason: last_error },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::MemoryStore;
    use wheelhouse_core_types::SessionId;

    fn fast_config(workers: usize) -> UploaderConfig {
        UploaderConfig {
            workers,
            max_attempts: 3,
            base_backoff: Duration::from_millis(5),
            queue_capacity: 16,
        }
    }

    #[tokio::test]
    async fn submit_returns_immediately_and_uploads_in_background() {
        let store = Arc::new(MemoryStore::new());
        let uploader = ArtifactUploader::new(Some(store.clone()), fast_config(2));

        let artifact = Artifact::screenshot(SessionId::new(), 0, vec![1, 2, 3]);
        let key = artifact.object_key();
        let handle = uploader.submit(artifact);
        assert_eq!(handle.upload, UploadState::UploadPending);

        uploader.wait_idle(Duration::from_secs(2)).await;
        match uploader.status(&handle.id).unwrap() {
            UploadState::Uploaded { uri } => assert_eq!(uri, format!("mem://{key}")),
            other => panic!("unexpected state: {other:?}"),
        }
        assert_eq!(store.get(&key).unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next(2);
        let uploader = ArtifactUploader::new(Some(store.clone()), fast_config(1));

        let handle = uploader.submit(Artifact::screenshot(SessionId::new(), 1, vec![9]));
        uploader.wait_idle(Duration::from_secs(2)).await;
        assert!(matches!(
            uploader.status(&handle.id).unwrap(),
            UploadState::Uploaded { .. }
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn persistent_failure_surfaces_in_status_only() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next(100);
        let uploader = ArtifactUploader::new(Some(store.clone()), fast_config(1));

        let handle = uploader.submit(Artifact::screenshot(SessionId::new(), 2, vec![7]));
        uploader.wait_idle(Duration::from_secs(2)).await;
        assert!(matches!(
            uploader.status(&handle.id).unwrap(),
            UploadState::UploadFailed { .. }
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn disabled_uploader_keeps_artifacts_local() {
        let uploader = ArtifactUploader::disabled();
        let handle = uploader.submit(Artifact::screenshot(SessionId::new(), 0, vec![1]));
        assert_eq!(handle.upload, UploadState::Local);
        assert_eq!(uploader.backlog(), 0);
    }
}
