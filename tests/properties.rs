//! Property tests for ordering, filtering and subscription lifecycle.

use featsync::transform::{self, FeatVisibility};
use featsync::{
    Collaborators, Collection, Document, Feat, MemoryBackend, Snapshot, Store, SyncConfig,
    SyncEngine, User, UserType,
};
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;

fn feat_strategy() -> impl Strategy<Value = (String, i64)> {
    (prop::sample::select(vec!["u1", "u2", "u3"]), 0i64..2_000)
        .prop_map(|(user, date)| (user.to_string(), date))
}

fn feats_snapshot(feats: &[(String, i64)]) -> Snapshot {
    Snapshot::Documents(
        feats
            .iter()
            .enumerate()
            .map(|(i, (user, date))| {
                Document::new(format!("f{i}"), json!({"user": user, "date": date}))
            })
            .collect(),
    )
}

fn viewer_strategy() -> impl Strategy<Value = Option<User>> {
    prop::option::of(
        (
            prop::sample::select(vec!["u1", "u2", "u3"]),
            prop::sample::select(vec![UserType::Member, UserType::Team, UserType::Admin]),
        )
            .prop_map(|(id, user_type)| User {
                id: id.to_string(),
                name: id.to_string(),
                user_type,
                points: 0,
            }),
    )
}

proptest! {
    #[test]
    fn prop_filter_is_idempotent(
        feats in prop::collection::vec(feat_strategy(), 0..40),
        cutoff in prop::option::of(0i64..2_000),
        finished in any::<bool>(),
        viewer in viewer_strategy(),
    ) {
        let visibility = FeatVisibility { cutoff, finished, viewer: viewer.as_ref() };
        let once = transform::feats(&feats_snapshot(&feats), &visibility);
        let twice = transform::filter_visible(once.clone(), &visibility);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_filtered_feats_obey_rule(
        feats in prop::collection::vec(feat_strategy(), 0..40),
        cutoff in 0i64..2_000,
        viewer in viewer_strategy(),
    ) {
        let visibility = FeatVisibility { cutoff: Some(cutoff), finished: false, viewer: viewer.as_ref() };
        let visible: Vec<Feat> = transform::feats(&feats_snapshot(&feats), &visibility);
        let privileged = |f: &Feat| viewer.as_ref().map_or(false, |v| v.is_admin() || v.id == f.user);
        for feat in &visible {
            prop_assert!(feat.date <= cutoff || privileged(feat));
        }
        let expected = feats
            .iter()
            .filter(|(user, date)| {
                *date <= cutoff
                    || viewer.as_ref().map_or(false, |v| v.is_admin() || &v.id == user)
            })
            .count();
        prop_assert_eq!(visible.len(), expected);
    }

    #[test]
    fn prop_feats_newest_first(feats in prop::collection::vec(feat_strategy(), 0..40)) {
        let everything = FeatVisibility { finished: true, ..Default::default() };
        let sorted = transform::feats(&feats_snapshot(&feats), &everything);
        prop_assert_eq!(sorted.len(), feats.len());
        for pair in sorted.windows(2) {
            prop_assert!(pair[0].date >= pair[1].date);
        }
    }

    #[test]
    fn prop_users_points_non_increasing(points in prop::collection::vec(-50i64..500, 0..40)) {
        let snapshot = Snapshot::Documents(
            points
                .iter()
                .enumerate()
                .map(|(i, p)| Document::new(format!("u{i}"), json!({"name": "n", "type": "team", "points": p})))
                .collect(),
        );
        let users = transform::users(&snapshot);
        prop_assert_eq!(users.len(), points.len());
        for pair in users.windows(2) {
            prop_assert!(pair[0].points >= pair[1].points);
        }
    }

    #[test]
    fn prop_locations_name_non_decreasing(names in prop::collection::vec("[a-zA-Z]{0,8}", 0..40)) {
        let snapshot = Snapshot::Documents(
            names
                .iter()
                .enumerate()
                .map(|(i, name)| Document::new(format!("l{i}"), json!({"name": name})))
                .collect(),
        );
        let locations = transform::locations(&snapshot);
        for pair in locations.windows(2) {
            prop_assert!(pair[0].name.to_lowercase() <= pair[1].name.to_lowercase());
        }
    }

    #[test]
    fn prop_available_years_reverse_source(years in prop::collection::vec(1990u32..2100, 0..20)) {
        let snapshot = Snapshot::Documents(
            years.iter().map(|y| Document::new(y.to_string(), json!({"year": y}))).collect(),
        );
        let mut expected: Vec<String> = years.iter().map(u32::to_string).collect();
        expected.reverse();
        prop_assert_eq!(transform::available_years(&snapshot), expected);
    }

    #[test]
    fn prop_replace_then_cancel_leaves_nothing(years in prop::collection::vec(2000u32..2005, 1..6)) {
        let backend = MemoryBackend::new();
        let engine = SyncEngine::new(
            SyncConfig::default(),
            Arc::new(Store::new()),
            Collaborators::from_backend(backend.clone()),
        );
        for year in &years {
            engine.registry().replace_all(&year.to_string()).unwrap();
        }
        engine.registry().cancel_all();
        prop_assert_eq!(engine.registry().live_count(), 0);
        prop_assert_eq!(backend.listener_count(), 0);

        let version = engine.store().version();
        for year in &years {
            backend.set_documents(Collection::Feats, &year.to_string(), vec![]);
        }
        prop_assert_eq!(engine.process_pending(), 0);
        prop_assert_eq!(engine.store().version(), version);
    }

    #[test]
    fn prop_token_fan_out(tokens in prop::collection::vec("[a-z0-9]{1,12}", 1..10)) {
        let backend = MemoryBackend::new();
        let engine = SyncEngine::new(
            SyncConfig::default(),
            Arc::new(Store::new()),
            Collaborators::from_backend(backend),
        );
        for token in &tokens {
            engine.session().set_token(token.clone());
            for client in engine.session().clients().iter() {
                let client_token = client.token();
                prop_assert_eq!(client_token.as_deref(), Some(token.as_str()));
            }
        }
    }
}
