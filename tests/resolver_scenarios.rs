//! Tag-based resolution against a real on-disk catalog.

use tempfile::tempdir;
use wheelhouse_core_types::SessionRequirements;
use wheelhouse_profile_store::{NewProfile, ProfileError, ProfileStore, ResolvedProfile};

fn seeded_store() -> (tempfile::TempDir, ProfileStore) {
    let dir = tempdir().unwrap();
    let store = ProfileStore::open(dir.path().join("profiles")).unwrap();
    store
        .create(NewProfile::named("A").with_tags(["x", "y"]))
        .unwrap();
    store
        .create(NewProfile::named("B").with_tags(["x"]))
        .unwrap();
    store
        .create(NewProfile::named("C").with_tags(["y"]))
        .unwrap();
    (dir, store)
}

#[test]
fn tag_and_request_picks_the_full_match() {
    let (_dir, store) = seeded_store();
    let mut request = SessionRequirements::tagged(["x", "y"]);
    request.allow_temp_profile = Some(false);

    match store.resolve(&request).unwrap() {
        ResolvedProfile::Persistent { profile, .. } => assert_eq!(profile.name, "A"),
        other => panic!("unexpected resolution: {other:?}"),
    }
}

#[test]
fn unsatisfiable_tags_report_missing_tags_per_profile() {
    let (_dir, store) = seeded_store();
    let mut request = SessionRequirements::tagged(["x", "z"]);
    request.allow_temp_profile = Some(false);

    let err = store.resolve(&request).unwrap_err();
    let ProfileError::NoSuitableProfile {
        required_tags,
        available,
    } = err
    else {
        panic!("expected NoSuitableProfile");
    };
    assert_eq!(required_tags, vec!["x".to_string(), "z".to_string()]);

    let missing = |name: &str| {
        available
            .iter()
            .find(|m| m.name == name)
            .unwrap_or_else(|| panic!("profile {name} not listed"))
            .missing_tags
            .clone()
    };
    // Missing tags are relative to the request.
    assert_eq!(missing("A"), vec!["z".to_string()]);
    assert_eq!(missing("B"), vec!["z".to_string()]);
    assert_eq!(missing("C"), vec!["x".to_string(), "z".to_string()]);
    assert_eq!(available.len(), 3);
}

#[test]
fn default_falls_back_to_temporary() {
    let (_dir, store) = seeded_store();
    let request = SessionRequirements::tagged(["x", "z"]);
    assert!(store.resolve(&request).unwrap().is_temporary());
}

#[test]
fn resolution_is_deterministic_for_a_fixed_catalog() {
    let (_dir, store) = seeded_store();
    store.touch("C").unwrap();
    let request = SessionRequirements::tagged(["y"]);
    for _ in 0..5 {
        match store.resolve(&request).unwrap() {
            ResolvedProfile::Persistent { profile, .. } => assert_eq!(profile.name, "C"),
            other => panic!("unexpected resolution: {other:?}"),
        }
    }
}
