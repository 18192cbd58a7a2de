use std::collections::BTreeMap;

use tracing::{debug, warn};
use wheelhouse_core_types::SessionRequirements;

use crate::errors::{ProfileError, ProfileMiss};
use crate::model::{ProfileRecord, ResolvedProfile};

/// Deterministic profile resolution over a snapshot of the catalog.
///
/// Priority order:
/// 1. exact `profile_name` match,
/// 2. tag-AND match (most recently used wins, never-used last),
/// 3. temporary profile when allowed,
/// 4. `NoSuitableProfile` listing every profile with its missing tags.
pub fn resolve_from(
    profiles: &BTreeMap<String, ProfileRecord>,
    requirements: &SessionRequirements,
) -> Result<ResolvedProfile, ProfileError> {
    if let Some(name) = &requirements.profile_name {
        if let Some(profile) = profiles.get(name) {
            debug!(target: "profile-store", profile = %name, "resolved by exact name");
            return Ok(ResolvedProfile::Persistent {
                profile: profile.clone(),
                clone_for_parallel: requirements.clone_for_parallel,
            });
        }
        warn!(
            target: "profile-store",
            profile = %name,
            "requested profile not found, trying tag matching"
        );
    }

    if !requirements.required_tags.is_empty() {
        let mut matched: Vec<&ProfileRecord> = profiles
            .values()
            .filter(|p| p.has_all_tags(&requirements.required_tags))
            .collect();
        sort_by_recency(&mut matched);

        if let Some(best) = matched.first() {
            debug!(
                target: "profile-store",
                profile = %best.name,
                tags = ?requirements.required_tags,
                "resolved by tags"
            );
            return Ok(ResolvedProfile::Persistent {
                profile: (*best).clone(),
                clone_for_parallel: requirements.clone_for_parallel,
            });
        }
        warn!(
            target: "profile-store",
            tags = ?requirements.required_tags,
            "no profile matches all required tags"
        );
    }

    if requirements.allows_temp_profile() {
        debug!(target: "profile-store", "falling back to temporary profile");
        return Ok(ResolvedProfile::Temporary);
    }

    Err(ProfileError::NoSuitableProfile {
        required_tags: requirements.required_tags.clone(),
        available: profiles
            .values()
            .map(|p| ProfileMiss {
                name: p.name.clone(),
                tags: p.tags.clone(),
                missing_tags: p.missing_tags(&requirements.required_tags),
            })
            .collect(),
    })
}

/// Find profiles by tags with AND (`match_all`) or OR semantics, ordered by
/// `last_used_at` descending; never-used profiles sort last.
pub(crate) fn find_by_tags<'a>(
    profiles: &'a BTreeMap<String, ProfileRecord>,
    required_tags: &[String],
    match_all: bool,
) -> Vec<&'a ProfileRecord> {
    let mut matched: Vec<&ProfileRecord> = profiles
        .values()
        .filter(|p| {
            if match_all {
                p.has_all_tags(required_tags)
            } else {
                p.has_any_tag(required_tags)
            }
        })
        .collect();
    sort_by_recency(&mut matched);
    matched
}

fn sort_by_recency(profiles: &mut [&ProfileRecord]) {
    profiles.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::path::PathBuf;

    fn profile(name: &str, tags: &[&str], used_hours_ago: Option<i64>) -> ProfileRecord {
        let mut p = ProfileRecord::new(name, PathBuf::from(format!("/tmp/{name}")));
        p.tags = tags.iter().map(|t| t.to_string()).collect();
        p.last_used_at = used_hours_ago.map(|h| Utc::now() - Duration::hours(h));
        p
    }

    fn catalog(entries: Vec<ProfileRecord>) -> BTreeMap<String, ProfileRecord> {
        entries.into_iter().map(|p| (p.name.clone(), p)).collect()
    }

    #[test]
    fn exact_name_wins_over_tags() {
        let profiles = catalog(vec![
            profile("alpha", &["x"], None),
            profile("beta", &["x", "y"], Some(1)),
        ]);
        let req = SessionRequirements {
            profile_name: Some("alpha".into()),
            required_tags: vec!["x".into(), "y".into()],
            ..Default::default()
        };
        match resolve_from(&profiles, &req).unwrap() {
            ResolvedProfile::Persistent { profile, .. } => assert_eq!(profile.name, "alpha"),
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn tag_and_match_prefers_most_recently_used() {
        let profiles = catalog(vec![
            profile("stale", &["x", "y"], Some(100)),
            profile("fresh", &["x", "y"], Some(1)),
            profile("unused", &["x", "y"], None),
        ]);
        let req = SessionRequirements::tagged(["x", "y"]);
        match resolve_from(&profiles, &req).unwrap() {
            ResolvedProfile::Persistent { profile, .. } => assert_eq!(profile.name, "fresh"),
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn temp_fallback_is_the_default() {
        let profiles = catalog(vec![profile("a", &["x"], None)]);
        let req = SessionRequirements::tagged(["z"]);
        assert!(resolve_from(&profiles, &req).unwrap().is_temporary());
    }

    #[test]
    fn refusing_temp_reports_missing_tags_per_profile() {
        let profiles = catalog(vec![
            profile("a", &["x", "y"], None),
            profile("b", &["x"], None),
            profile("c", &["y"], None),
        ]);
        let mut req = SessionRequirements::tagged(["x", "z"]);
        req.allow_temp_profile = Some(false);
        let err = resolve_from(&profiles, &req).unwrap_err();
        match err {
            ProfileError::NoSuitableProfile {
                required_tags,
                available,
            } => {
                assert_eq!(required_tags, vec!["x".to_string(), "z".to_string()]);
                let miss = |name: &str| {
                    available
                        .iter()
                        .find(|m| m.name == name)
                        .unwrap()
                        .missing_tags
                        .clone()
                };
                assert_eq!(miss("a"), vec!["z".to_string()]);
                assert_eq!(miss("b"), vec!["z".to_string()]);
                assert_eq!(miss("c"), vec!["x".to_string(), "z".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn or_matching_collects_any_overlap() {
        let profiles = catalog(vec![
            profile("a", &["x"], Some(2)),
            profile("b", &["y"], Some(1)),
            profile("c", &["z"], None),
        ]);
        let found = find_by_tags(&profiles, &["x".into(), "y".into()], false);
        let names: Vec<&str> = found.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }
}
