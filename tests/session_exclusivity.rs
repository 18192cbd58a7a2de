//! Concurrent sessions against the same persistent profile.

use std::sync::Arc;

use tempfile::tempdir;
use wheelhouse_artifact_store::ArtifactUploader;
use wheelhouse_core_types::{LocatorSpec, Script, ScriptStatus, SessionRequirements, Step, StepKind};
use wheelhouse_profile_store::{NewProfile, ProfileStore};
use wheelhouse_session_center::{
    CenterConfig, SessionCenter, SessionError, SessionOptions, StubFactory,
};

fn center_with_profile() -> (tempfile::TempDir, Arc<SessionCenter>, Arc<ProfileStore>) {
    let dir = tempdir().unwrap();
    let store = Arc::new(ProfileStore::open(dir.path().join("profiles")).unwrap());
    store
        .create(NewProfile::named("P").with_tags(["shared"]))
        .unwrap();
    let factory = Arc::new(StubFactory::with(|driver| driver.with_element("#step")));
    let center = SessionCenter::new(
        Arc::clone(&store),
        Arc::new(ArtifactUploader::disabled()),
        factory,
        None,
        None,
        CenterConfig::default(),
    );
    (dir, center, store)
}

fn one_step_script(name: &str) -> Script {
    Script::new(
        name,
        vec![Step::new(StepKind::Click {
            locator: Some(LocatorSpec::selector("#step")),
            escalation: None,
        })],
    )
}

#[tokio::test]
async fn second_non_cloned_session_fails_with_profile_busy() {
    let (_dir, center, _store) = center_with_profile();
    let requirements = SessionRequirements::named("P");

    let s1 = center
        .open(SessionOptions::headless(requirements.clone()))
        .await
        .unwrap();
    let err = center
        .open(SessionOptions::headless(requirements))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::ProfileBusy { .. }));
    center.close(&s1.id).await.unwrap();
}

#[tokio::test]
async fn cloned_session_is_admitted_and_runs_independently() {
    let (_dir, center, store) = center_with_profile();

    let s1 = center
        .open(SessionOptions::headless(SessionRequirements::named("P")))
        .await
        .unwrap();
    let usage_after_s1 = store.get("P").unwrap();

    let mut cloned = SessionRequirements::named("P");
    cloned.clone_for_parallel = true;
    let s2 = center
        .open(SessionOptions::headless(cloned))
        .await
        .unwrap();

    assert_ne!(s1.user_data_dir, s2.user_data_dir);

    // Both sessions run steps without interfering.
    let r1 = center
        .run_script(&s1, one_step_script("s1"), None)
        .await
        .unwrap();
    let r2 = center
        .run_script(&s2, one_step_script("s2"), None)
        .await
        .unwrap();
    assert_eq!(r1.status, ScriptStatus::Completed);
    assert_eq!(r2.status, ScriptStatus::Completed);

    // The clone's activity leaves the profile's usage accounting alone.
    let usage_after_s2 = store.get("P").unwrap();
    assert_eq!(usage_after_s1.last_used_at, usage_after_s2.last_used_at);
    assert_eq!(usage_after_s1.usage_count, usage_after_s2.usage_count);

    center.close(&s1.id).await.unwrap();
    center.close(&s2.id).await.unwrap();
}
