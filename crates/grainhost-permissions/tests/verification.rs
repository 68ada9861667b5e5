//! Optimistic verification under concurrent grant changes

#![allow(clippy::unwrap_used, clippy::expect_used)]

use grainhost_core::config::PermissionsConfig;
use grainhost_core::store::TokenStore;
use grainhost_core::{ApiToken, IdentityId, MemoryStore, PermissionSet, Store, TokenId};
use grainhost_permissions::{grain_permissions, Principal};
use grainhost_testkit::{editor, notes_view_info, viewer, HookedStore, World};
use proptest::prelude::*;

fn revoke(store: &MemoryStore, id: &TokenId) {
    store
        .update_token(id, &mut |token: &mut ApiToken| token.revoked = true)
        .unwrap();
}

fn watched(store: &dyn Store, principal: &Principal) -> grainhost_permissions::GrainPermissions {
    grain_permissions(store, principal, &notes_view_info(), true, &PermissionsConfig::default()).unwrap()
}

#[test]
fn a_settled_result_registers_exactly_one_watch() {
    let world = World::new();
    world.add_user("alice");
    let grain = world.add_grain("g", "alice", true);
    world.share(&grain, "t1", "alice", "bob", editor());
    world.share(&grain, "t2", "bob", "carol", viewer());

    let result = watched(world.store.as_ref(), &Principal::identity(grain, IdentityId::new("carol")));
    assert_eq!(result.permissions, Some(PermissionSet::from(vec![true, false])));
    assert!(result.watch.is_some());
    assert_eq!(world.store.active_watch_count(), 1);

    drop(result);
    assert_eq!(world.store.active_watch_count(), 0);
}

#[test]
fn a_denied_result_carries_no_watch() {
    let world = World::new();
    world.add_user("alice");
    let grain = world.add_grain("g", "alice", true);

    let result = watched(world.store.as_ref(), &Principal::identity(grain, IdentityId::new("bob")));
    assert!(result.permissions.is_none());
    assert!(result.watch.is_none());
    assert_eq!(world.store.active_watch_count(), 0);
}

#[test]
fn unrelated_changes_do_not_fire_the_watch() {
    let world = World::new();
    world.add_user("alice");
    let grain = world.add_grain("g", "alice", true);
    world.share(&grain, "t1", "alice", "bob", editor());
    let other = world.share(&grain, "t2", "alice", "carol", editor());

    let result = watched(world.store.as_ref(), &Principal::identity(grain, IdentityId::new("bob")));
    let watch = result.watch.unwrap();
    world.revoke(&other);
    assert!(!watch.is_invalidated());

    world
        .store
        .update_token(&TokenId::new("t1"), &mut |token: &mut ApiToken| token.petname = "renamed".into())
        .unwrap();
    assert!(!watch.is_invalidated());
}

#[test]
fn revocation_during_verification_is_not_missed() {
    let world = World::new();
    world.add_user("alice");
    let grain = world.add_grain("g", "alice", true);
    let t1 = world.share(&grain, "t1", "alice", "bob", editor());

    let store = HookedStore::new(world.store.clone());
    store.before_next_reread(move |inner| revoke(inner, &t1));
    let result = watched(&store, &Principal::identity(grain, IdentityId::new("bob")));
    assert!(result.permissions.is_none());
    assert!(result.watch.is_none());
    assert_eq!(world.store.active_watch_count(), 0);
}

#[test]
fn a_retry_settles_on_the_surviving_path() {
    let world = World::new();
    world.add_user("alice");
    let grain = world.add_grain("g", "alice", true);
    world.share(&grain, "t1", "alice", "bob", viewer());
    let t2 = world.share(&grain, "t2", "alice", "bob", editor());

    let store = HookedStore::new(world.store.clone());
    store.before_next_reread(move |inner| revoke(inner, &t2));
    let result = watched(&store, &Principal::identity(grain, IdentityId::new("bob")));
    assert_eq!(result.permissions, Some(PermissionSet::from(vec![true, false])));
    let watch = result.watch.unwrap();
    assert!(!watch.is_invalidated());
    assert_eq!(world.store.active_watch_count(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Adding a grant never takes permissions away from anyone.
    #[test]
    fn prop_adding_a_grant_is_monotone(
        edges in proptest::collection::vec((0usize..4, 0usize..4, 0u32..3), 1..8),
    ) {
        const PEOPLE: [&str; 4] = ["alice", "bob", "carol", "dave"];
        let roles = [viewer(), editor(), grainhost_core::RoleAssignment::all_access()];

        let world = World::new();
        world.add_user("alice");
        let grain = world.add_grain("g", "alice", true);

        let mut before: Vec<Option<PermissionSet>> = vec![None; PEOPLE.len()];
        for (index, (from, to, role)) in edges.into_iter().enumerate() {
            world.share(&grain, &format!("t{index}"), PEOPLE[from], PEOPLE[to], roles[role as usize].clone());
            for (person, previous) in PEOPLE.iter().zip(before.iter_mut()) {
                let now = grain_permissions(
                    world.store.as_ref(),
                    &Principal::identity(grain.clone(), IdentityId::new(*person)),
                    &notes_view_info(),
                    false,
                    &PermissionsConfig::default(),
                )
                .unwrap()
                .permissions;
                match (previous.as_ref(), now.as_ref()) {
                    (Some(_), None) => prop_assert!(false, "{person} lost access"),
                    (Some(old), Some(new)) => prop_assert!(old.is_subset_of(new)),
                    _ => {}
                }
                *previous = now;
            }
        }
    }
}
