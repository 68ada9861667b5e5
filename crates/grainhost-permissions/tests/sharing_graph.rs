//! Permission resolution over realistic sharing graphs

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::{Duration, Utc};
use grainhost_core::config::PermissionsConfig;
use grainhost_core::store::TokenStore;
use grainhost_core::{
    ApiToken, GrainId, IdentityId, MembraneRequirement, PermissionSet, RoleAssignment, Store, TokenId,
};
use grainhost_permissions::{downstream_tokens, grain_permissions, may_open_grain, Principal};
use grainhost_testkit::{editor, init_tracing, notes_view_info, viewer, World, READ, WRITE};
use std::collections::BTreeSet;

fn permissions_of(store: &dyn Store, principal: &Principal) -> Option<PermissionSet> {
    grain_permissions(
        store,
        principal,
        &notes_view_info(),
        false,
        &PermissionsConfig::default(),
    )
    .unwrap()
    .permissions
}

fn identity(grain: &GrainId, name: &str) -> Principal {
    Principal::identity(grain.clone(), IdentityId::new(name))
}

fn bits(read: bool, write: bool) -> Option<PermissionSet> {
    Some(PermissionSet::from(vec![read, write]))
}

#[test]
fn owner_holds_every_permission() {
    let world = World::new();
    world.add_user("alice");
    let grain = world.add_grain("g", "alice", true);

    assert_eq!(permissions_of(world.store.as_ref(), &identity(&grain, "alice")), bits(true, true));
    assert_eq!(permissions_of(world.store.as_ref(), &identity(&grain, "mallory")), None);
    assert!(!may_open_grain(world.store.as_ref(), &Principal::anonymous(grain)).unwrap());
}

#[test]
fn reshares_never_exceed_the_sharer() {
    init_tracing();
    let world = World::new();
    world.add_user("alice");
    let grain = world.add_grain("g", "alice", true);

    world.share(&grain, "t1", "alice", "bob", viewer());
    world.share(&grain, "t2", "bob", "carol", RoleAssignment::all_access());
    world.share(&grain, "t3", "carol", "dave", editor());

    let store = world.store.as_ref();
    assert_eq!(permissions_of(store, &identity(&grain, "bob")), bits(true, false));
    assert_eq!(permissions_of(store, &identity(&grain, "carol")), bits(true, false));
    assert_eq!(permissions_of(store, &identity(&grain, "dave")), bits(true, false));

    // A second path gives carol write access, which then also reaches dave.
    world.share(&grain, "t4", "alice", "carol", editor());
    assert_eq!(permissions_of(world.store.as_ref(), &identity(&grain, "dave")), bits(true, true));
}

#[test]
fn role_assignment_adds_and_removes_bits() {
    let world = World::new();
    world.add_user("alice");
    let grain = world.add_grain("g", "alice", true);

    let read_only = RoleAssignment::all_access().with_removed(PermissionSet::from_indices([WRITE]));
    world.share(&grain, "t1", "alice", "bob", read_only);
    assert_eq!(permissions_of(world.store.as_ref(), &identity(&grain, "bob")), bits(true, false));

    let none_plus_write = RoleAssignment::none().with_added(PermissionSet::from_indices([WRITE]));
    world.share(&grain, "t2", "alice", "carol", none_plus_write);
    assert_eq!(permissions_of(world.store.as_ref(), &identity(&grain, "carol")), bits(true, true));
}

#[test]
fn webkey_chains_attenuate() {
    let world = World::new();
    world.add_user("alice");
    let grain = world.add_grain("g", "alice", true);

    let (_, parent) = world.webkey(&grain, "alice", viewer());
    let (_, child) = world.child_webkey(&parent, editor());

    let store = world.store.as_ref();
    let parent_token = world.token(&parent);
    let child_token = world.token(&child);
    assert_eq!(permissions_of(store, &Principal::token(&parent_token)), bits(true, false));
    assert_eq!(permissions_of(store, &Principal::token(&child_token)), bits(true, false));

    world.revoke(&parent);
    assert_eq!(permissions_of(world.store.as_ref(), &Principal::token(&child_token)), None);
}

#[test]
fn revoked_and_non_ui_grants_carry_nothing() {
    let world = World::new();
    world.add_user("alice");
    let grain = world.add_grain("g", "alice", true);

    let t1 = world.share(&grain, "t1", "alice", "bob", editor());
    world.revoke(&t1);
    assert_eq!(permissions_of(world.store.as_ref(), &identity(&grain, "bob")), None);

    let mut capability = world.token(&world.share(&grain, "t2", "alice", "carol", editor()));
    world.store.remove_token(&capability.id).unwrap();
    capability.object_id = Some(serde_json::json!({"file": "notes.txt"}));
    world.insert(capability);
    assert_eq!(permissions_of(world.store.as_ref(), &identity(&grain, "carol")), None);
}

#[test]
fn expired_grants_carry_nothing() {
    let world = World::new();
    world.add_user("alice");
    let grain = world.add_grain("g", "alice", true);

    let t1 = world.share(&grain, "t1", "alice", "bob", viewer());
    world.share(&grain, "t2", "bob", "carol", viewer());
    assert_eq!(permissions_of(world.store.as_ref(), &identity(&grain, "carol")), bits(true, false));

    world
        .store
        .update_token(&t1, &mut |token: &mut ApiToken| {
            token.expires = Some(Utc::now() - Duration::hours(1));
        })
        .unwrap();
    assert_eq!(permissions_of(world.store.as_ref(), &identity(&grain, "bob")), None);
    assert_eq!(permissions_of(world.store.as_ref(), &identity(&grain, "carol")), None);

    world
        .store
        .update_token(&t1, &mut |token: &mut ApiToken| {
            token.expires = Some(Utc::now() + Duration::hours(1));
        })
        .unwrap();
    assert_eq!(permissions_of(world.store.as_ref(), &identity(&grain, "bob")), bits(true, false));
}

#[test]
fn added_bits_only_pass_what_the_sharer_holds() {
    let world = World::new();
    world.add_user("alice");
    let grain = world.add_grain("g", "alice", true);

    world.share(&grain, "a", "alice", "amy", RoleAssignment::all_access());
    world.share(&grain, "b", "amy", "ben", viewer());
    world.share(
        &grain,
        "c",
        "ben",
        "cat",
        viewer().with_added(PermissionSet::from_indices([WRITE])),
    );

    let store = world.store.as_ref();
    assert_eq!(permissions_of(store, &identity(&grain, "amy")), bits(true, true));
    assert_eq!(permissions_of(store, &identity(&grain, "ben")), bits(true, false));
    assert_eq!(permissions_of(store, &identity(&grain, "cat")), bits(true, false));
}

#[test]
fn public_grains_give_everyone_the_default_role() {
    let world = World::new();
    world.add_user("alice");
    let grain = world.add_grain("legacy", "alice", false);

    assert_eq!(permissions_of(world.store.as_ref(), &identity(&grain, "bob")), bits(true, false));
    assert_eq!(
        permissions_of(world.store.as_ref(), &Principal::anonymous(grain.clone())),
        bits(true, false)
    );
    assert_eq!(permissions_of(world.store.as_ref(), &identity(&grain, "alice")), bits(true, true));
}

#[test]
fn membranes_gate_on_permissions_held_elsewhere() {
    init_tracing();
    let world = World::new();
    world.add_user("alice");
    world.add_user("dave");
    let grain = world.add_grain("g", "alice", true);
    let other = world.add_grain("h", "dave", true);

    let mut gated = world.token(&world.share(&grain, "t1", "alice", "bob", editor()));
    world.store.remove_token(&gated.id).unwrap();
    gated.requirements = vec![MembraneRequirement::PermissionsHeld {
        grain_id: other.clone(),
        identity_id: IdentityId::new("alice"),
        permissions: PermissionSet::from_indices([READ]),
    }];
    world.insert(gated);

    let bob = identity(&grain, "bob");
    assert_eq!(permissions_of(world.store.as_ref(), &bob), None);

    let h1 = world.share(&other, "h1", "dave", "alice", viewer());
    let result = grain_permissions(
        world.store.as_ref(),
        &bob,
        &notes_view_info(),
        true,
        &PermissionsConfig::default(),
    )
    .unwrap();
    assert_eq!(result.permissions, bits(true, true));
    let watch = result.watch.expect("a proven result is watched");
    assert!(!watch.is_invalidated());

    // The watch covers the grant satisfying the requirement, not just the
    // grant on the path.
    world.revoke(&h1);
    assert!(watch.is_invalidated());
    assert_eq!(permissions_of(world.store.as_ref(), &bob), None);
}

#[test]
fn downstream_follows_chains_and_reshares_but_not_siblings() {
    let world = World::new();
    world.add_user("alice");
    let grain = world.add_grain("g", "alice", true);

    let t1 = world.share(&grain, "t1", "alice", "bob", editor());
    let t2 = world.share(&grain, "t2", "bob", "carol", viewer());
    let t3 = world.share(&grain, "t3", "carol", "dave", viewer());
    let (_, w1) = world.webkey(&grain, "bob", viewer());
    let (_, w2) = world.child_webkey(&w1, viewer());
    world.share(&grain, "t4", "alice", "erin", viewer());
    world.share(&grain, "t5", "erin", "frank", viewer());

    let downstream: BTreeSet<TokenId> = downstream_tokens(world.store.as_ref(), &Principal::token(&world.token(&t1)))
        .unwrap()
        .into_iter()
        .map(|token| token.id)
        .collect();
    assert_eq!(downstream, BTreeSet::from([t2, t3, w1, w2]));

    let from_carol = downstream_tokens(world.store.as_ref(), &identity(&grain, "carol")).unwrap();
    assert_eq!(from_carol.len(), 1);
    assert!(downstream_tokens(world.store.as_ref(), &Principal::anonymous(grain)).unwrap().is_empty());
}

#[test]
fn downstream_of_public_grain_is_empty() {
    let world = World::new();
    world.add_user("alice");
    let grain = world.add_grain("legacy", "alice", false);
    let t1 = world.share(&grain, "t1", "alice", "bob", editor());
    world.share(&grain, "t2", "bob", "carol", viewer());

    let downstream = downstream_tokens(world.store.as_ref(), &Principal::token(&world.token(&t1))).unwrap();
    assert!(downstream.is_empty());
}

#[test]
fn an_anonymous_session_on_a_private_grain_needs_a_webkey() {
    let world = World::new();
    world.add_user("alice");
    let grain = world.add_grain("g", "alice", true);
    let (_, key) = world.webkey(&grain, "alice", RoleAssignment::none());

    assert!(!may_open_grain(world.store.as_ref(), &Principal::anonymous(grain)).unwrap());
    assert!(may_open_grain(world.store.as_ref(), &Principal::token(&world.token(&key))).unwrap());
}
