//! Opening, redeeming and collecting sessions

#![allow(clippy::unwrap_used, clippy::expect_used)]

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use grainhost_backend::{
    gc_sessions, host_id_for_session, keep_session_alive, open_session,
    open_session_from_api_token, GrainManager, WebkeySession,
};
use grainhost_core::store::{SessionStore, TokenStore};
use grainhost_core::{
    AccountId, GrainId, GrainhostError, IdentityId, RoleAssignment, SessionId, TokenOwner,
};
use grainhost_testkit::{init_tracing, viewer, MockApp, MockBackend, World};
use std::sync::Arc;

struct Harness {
    world: World,
    grain: GrainId,
    backend: Arc<MockBackend>,
    manager: GrainManager,
}

fn harness() -> Harness {
    init_tracing();
    let world = World::new();
    world.add_user("alice");
    world.add_user("bob");
    let grain = world.add_grain("g", "alice", true);
    let backend = Arc::new(MockBackend::new(MockApp::default()));
    let manager = GrainManager::new(world.dyn_store(), backend.clone(), Arc::new(world.config.clone()));
    Harness {
        world,
        grain,
        backend,
        manager,
    }
}

fn alice() -> AccountId {
    AccountId::new("alice-account")
}

fn bob() -> AccountId {
    AccountId::new("bob-account")
}

#[tokio::test]
async fn owners_open_sessions_and_the_grain_is_prestarted() {
    let h = harness();
    let opened = open_session(&h.manager, &alice(), &h.grain, None).await.unwrap();

    assert_eq!(opened.host_id, host_id_for_session(&opened.session_id));
    assert_eq!(opened.grain_id, h.grain);
    assert_eq!(h.backend.start_count(), 1);

    let session = h.world.store.get_session(&opened.session_id).unwrap().expect("session stored");
    assert_eq!(session.account_id, Some(alice()));
    assert_eq!(session.identity_id, Some(IdentityId::new("alice")));
    assert!(session.hashed_token.is_none());
    assert!(!session.has_loaded);
    assert!(h.world.grain(&h.grain).last_used.is_some());
}

#[tokio::test]
async fn reconnecting_with_the_salt_reuses_the_session() {
    let h = harness();
    let first = open_session(&h.manager, &alice(), &h.grain, None).await.unwrap();
    let second = open_session(&h.manager, &alice(), &h.grain, Some(first.salt.clone()))
        .await
        .unwrap();

    assert_eq!(first.session_id, second.session_id);
    assert_eq!(first.host_id, second.host_id);

    let fresh = open_session(&h.manager, &alice(), &h.grain, None).await.unwrap();
    assert_ne!(fresh.session_id, first.session_id);
}

#[tokio::test]
async fn strangers_cannot_open_private_grains() {
    let h = harness();
    assert_matches!(
        open_session(&h.manager, &bob(), &h.grain, None).await,
        Err(GrainhostError::PermissionDenied { .. })
    );
    assert_matches!(
        open_session(&h.manager, &AccountId::new("ghost"), &h.grain, None).await,
        Err(GrainhostError::PermissionDenied { .. })
    );
    assert_eq!(h.backend.start_count(), 0);
}

#[tokio::test]
async fn anonymous_webkey_sessions_are_bound_to_the_key() {
    let h = harness();
    let (secret, key) = h.world.webkey(&h.grain, "alice", viewer());

    let opened = open_session_from_api_token(&h.manager, None, &secret, false, None)
        .await
        .unwrap();
    let WebkeySession::Opened(opened) = opened else {
        panic!("anonymous redemption opens a session");
    };
    assert_eq!(opened.title.as_deref(), Some("alice's notes"));

    let session = h.world.store.get_session(&opened.session_id).unwrap().unwrap();
    assert_eq!(session.hashed_token, Some(key));
    assert!(session.identity_id.is_none());
}

#[tokio::test]
async fn logged_in_redemption_grants_the_identity_once() {
    let h = harness();
    let (secret, key) = h.world.webkey(&h.grain, "alice", viewer());

    for _ in 0..2 {
        let outcome = open_session_from_api_token(&h.manager, Some(&bob()), &secret, false, None)
            .await
            .unwrap();
        assert_eq!(outcome, WebkeySession::RedirectToGrain(h.grain.clone()));
    }

    let received: Vec<_> = h
        .world
        .store
        .tokens_for_grain(&h.grain)
        .unwrap()
        .into_iter()
        .filter(|token| token.recipient_identity() == Some(&IdentityId::new("bob")))
        .collect();
    assert_eq!(received.len(), 1);
    let child = &received[0];
    assert_eq!(child.parent_token, Some(key));
    assert_eq!(child.identity_id, Some(IdentityId::new("alice")));
    assert_eq!(child.role_assignment, RoleAssignment::all_access());
    assert_matches!(&child.owner, TokenOwner::User(user) if user.title == "alice's notes");

    // Bob now reaches the grain through his own identity.
    open_session(&h.manager, &bob(), &h.grain, None).await.unwrap();
}

#[tokio::test]
async fn the_owner_and_incognito_visitors_get_no_grant() {
    let h = harness();
    let (secret, _) = h.world.webkey(&h.grain, "alice", viewer());
    let grants_before = h.world.store.tokens_for_grain(&h.grain).unwrap().len();

    let outcome = open_session_from_api_token(&h.manager, Some(&alice()), &secret, false, None)
        .await
        .unwrap();
    assert_eq!(outcome, WebkeySession::RedirectToGrain(h.grain.clone()));

    let outcome = open_session_from_api_token(&h.manager, Some(&bob()), &secret, true, None)
        .await
        .unwrap();
    assert_matches!(outcome, WebkeySession::Opened(_));

    assert_eq!(h.world.store.tokens_for_grain(&h.grain).unwrap().len(), grants_before);
}

#[tokio::test]
async fn dead_webkeys_are_refused() {
    let h = harness();
    let (secret, key) = h.world.webkey(&h.grain, "alice", viewer());
    h.world.revoke(&key);

    assert_matches!(
        open_session_from_api_token(&h.manager, None, &secret, false, None).await,
        Err(GrainhostError::Revoked { .. })
    );
    assert_matches!(
        open_session_from_api_token(&h.manager, None, "never-minted", false, None).await,
        Err(GrainhostError::PermissionDenied { .. })
    );
}

#[tokio::test]
async fn keep_alive_touches_the_session_and_the_grain() {
    let h = harness();
    let opened = open_session(&h.manager, &alice(), &h.grain, None).await.unwrap();
    h.world
        .store
        .update_session(&opened.session_id, &mut |session: &mut grainhost_core::Session| {
            session.timestamp = 0;
        })
        .unwrap();

    assert!(keep_session_alive(&h.manager, &opened.session_id).await.unwrap());
    assert_eq!(h.backend.app().keep_alives(), 1);
    let session = h.world.store.get_session(&opened.session_id).unwrap().unwrap();
    assert!(session.timestamp > 0);

    assert!(!keep_session_alive(&h.manager, &SessionId::new("gone")).await.unwrap());
}

#[tokio::test]
async fn idle_sessions_are_collected() {
    let h = harness();
    let opened = open_session(&h.manager, &alice(), &h.grain, None).await.unwrap();
    let store = h.manager.store().as_ref();

    assert!(gc_sessions(store, Utc::now(), Duration::minutes(3)).unwrap().is_empty());

    let removed = gc_sessions(store, Utc::now() + Duration::minutes(10), Duration::minutes(3)).unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].id, opened.session_id);
    assert!(h.world.store.get_session(&opened.session_id).unwrap().is_none());
}
