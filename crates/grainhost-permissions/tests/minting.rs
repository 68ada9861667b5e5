//! Minting, editing and redeeming grants

#![allow(clippy::unwrap_used, clippy::expect_used)]

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use grainhost_core::config::{MintingConfig, PermissionsConfig};
use grainhost_core::store::TokenStore;
use grainhost_core::{
    api_host_id_for_secret, AccountId, ApiHostOptions, GrainId, GrainhostError, IdentityId,
    PermissionSet, RoleAssignment, StaticResource, TokenId, TokenOwner, UnauthenticatedAccess,
};
use grainhost_permissions::{
    cleanup_self_destructing, create_new_api_token, grain_permissions, update_api_token,
    validate_webkey, MintRequest, OwnerRequest, Principal, Provider, TokenUpdate,
};
use grainhost_testkit::{editor, notes_view_info, viewer, HookedStore, World};
use std::collections::BTreeMap;

fn alice() -> Provider {
    Provider::Identity {
        identity_id: IdentityId::new("alice"),
        account_id: AccountId::new("alice-account"),
    }
}

fn webkey_request(provider: Provider, grain: &GrainId, role: RoleAssignment) -> MintRequest {
    MintRequest {
        provider,
        grain_id: grain.clone(),
        petname: "for the team".into(),
        role_assignment: role,
        owner: OwnerRequest::Webkey {
            for_sharing: false,
            expires_if_unused_after: None,
        },
        unauthenticated: None,
    }
}

fn setup() -> (World, GrainId) {
    let world = World::new();
    world.add_user("alice");
    world.add_user("bob");
    let grain = world.add_grain("g", "alice", true);
    (world, grain)
}

#[test]
fn minted_webkeys_are_stored_hashed() {
    let (world, grain) = setup();
    let minted = create_new_api_token(
        world.store.as_ref(),
        webkey_request(alice(), &grain, viewer()),
        &MintingConfig::default(),
        Utc::now(),
    )
    .unwrap();

    assert_eq!(minted.id, TokenId::from_secret(&minted.token));
    assert!(world.store.get_token(&TokenId::new(minted.token.clone())).unwrap().is_none());
    let stored = world.token(&minted.id);
    assert_eq!(stored.owner, TokenOwner::Webkey);
    assert_eq!(stored.identity_id, Some(IdentityId::new("alice")));
    assert_eq!(stored.petname, "for the team");
    assert!(minted.parent.is_none());
}

#[test]
fn child_grants_inherit_issuer_and_sharing() {
    let (world, grain) = setup();
    let mut request = webkey_request(alice(), &grain, editor());
    request.owner = OwnerRequest::Webkey {
        for_sharing: true,
        expires_if_unused_after: None,
    };
    let parent = create_new_api_token(world.store.as_ref(), request, &MintingConfig::default(), Utc::now()).unwrap();

    let child = create_new_api_token(
        world.store.as_ref(),
        webkey_request(Provider::ParentSecret(parent.token.clone()), &grain, viewer()),
        &MintingConfig::default(),
        Utc::now(),
    )
    .unwrap();

    let stored = world.token(&child.id);
    assert_eq!(stored.parent_token, Some(parent.id.clone()));
    assert_eq!(stored.identity_id, Some(IdentityId::new("alice")));
    assert!(stored.for_sharing);
    assert_eq!(child.parent.map(|p| p.id), Some(parent.id));
}

#[test]
fn user_grants_snapshot_grain_metadata() {
    let (world, grain) = setup();
    let mut request = webkey_request(alice(), &grain, editor());
    request.owner = OwnerRequest::User {
        identity_id: IdentityId::new("bob"),
        title: "Team notes".into(),
    };
    let minted = create_new_api_token(world.store.as_ref(), request, &MintingConfig::default(), Utc::now()).unwrap();

    let stored = world.token(&minted.id);
    let TokenOwner::User(owner) = stored.owner else {
        panic!("expected a user-owned grant");
    };
    assert_eq!(owner.identity_id, IdentityId::new("bob"));
    assert_eq!(owner.title, "Team notes");
    let metadata = owner.denormalized_grain_metadata.expect("metadata snapshot");
    assert_eq!(metadata.app_title.default_text, "Notes");

    let bob = grain_permissions(
        world.store.as_ref(),
        &Principal::identity(grain, IdentityId::new("bob")),
        &notes_view_info(),
        false,
        &PermissionsConfig::default(),
    )
    .unwrap();
    assert_eq!(bob.permissions, Some(PermissionSet::from(vec![true, true])));
}

#[test]
fn minting_rejects_bad_requests() {
    let (world, grain) = setup();
    let config = MintingConfig::default();

    let missing = create_new_api_token(
        world.store.as_ref(),
        webkey_request(alice(), &GrainId::new("nope"), viewer()),
        &config,
        Utc::now(),
    );
    assert_matches!(missing, Err(GrainhostError::NotFound { .. }));

    let unknown_parent = create_new_api_token(
        world.store.as_ref(),
        webkey_request(Provider::ParentSecret("not-a-secret".into()), &grain, viewer()),
        &config,
        Utc::now(),
    );
    assert_matches!(unknown_parent, Err(GrainhostError::PermissionDenied { .. }));

    let mut resources = BTreeMap::new();
    resources.insert(
        "/big".to_string(),
        StaticResource {
            mime_type: "text/plain".into(),
            language: None,
            encoding: None,
            body: "x".repeat(config.unauthenticated_limit_bytes),
        },
    );
    let mut oversized = webkey_request(alice(), &grain, viewer());
    oversized.unauthenticated = Some(UnauthenticatedAccess {
        options: None,
        resources: Some(resources),
    });
    assert_matches!(
        create_new_api_token(world.store.as_ref(), oversized, &config, Utc::now()),
        Err(GrainhostError::PayloadTooLarge { .. })
    );

    let mut bad_dav = webkey_request(alice(), &grain, viewer());
    bad_dav.unauthenticated = Some(UnauthenticatedAccess {
        options: Some(ApiHostOptions {
            dav: vec!["not a class".into()],
        }),
        resources: None,
    });
    assert_matches!(
        create_new_api_token(world.store.as_ref(), bad_dav, &config, Utc::now()),
        Err(GrainhostError::Invalid { .. })
    );
}

#[test]
fn unauthenticated_access_creates_an_api_host() {
    let (world, grain) = setup();
    let mut request = webkey_request(alice(), &grain, viewer());
    request.unauthenticated = Some(UnauthenticatedAccess {
        options: Some(ApiHostOptions {
            dav: vec!["1".into(), "calendar-access".into()],
        }),
        resources: None,
    });
    let minted = create_new_api_token(world.store.as_ref(), request, &MintingConfig::default(), Utc::now()).unwrap();

    assert!(world.token(&minted.id).has_api_host);
    let host = world
        .store
        .get_api_host(&api_host_id_for_secret(&minted.token))
        .unwrap()
        .expect("api host stored");
    assert_eq!(host.options.unwrap().dav, vec!["1", "calendar-access"]);
}

#[test]
fn failed_mints_leave_no_records_behind() {
    let (world, grain) = setup();
    let before = world.store.tokens_for_grain(&grain).unwrap().len();
    let unauthenticated = || {
        let mut request = webkey_request(alice(), &grain, viewer());
        request.unauthenticated = Some(UnauthenticatedAccess {
            options: None,
            resources: None,
        });
        request
    };

    let store = HookedStore::new(world.store.clone());
    store.fail_api_host_inserts(true);
    let result = create_new_api_token(&store, unauthenticated(), &MintingConfig::default(), Utc::now());
    assert!(result.is_err());
    assert_eq!(world.store.tokens_for_grain(&grain).unwrap().len(), before);

    store.fail_api_host_inserts(false);
    store.fail_token_inserts(true);
    let result = create_new_api_token(&store, unauthenticated(), &MintingConfig::default(), Utc::now());
    assert!(result.is_err());
    assert_eq!(world.store.tokens_for_grain(&grain).unwrap().len(), before);

    store.fail_token_inserts(false);
    let minted = create_new_api_token(&store, unauthenticated(), &MintingConfig::default(), Utc::now()).unwrap();
    assert!(world.token(&minted.id).has_api_host);
    assert!(world
        .store
        .get_api_host(&api_host_id_for_secret(&minted.token))
        .unwrap()
        .is_some());
}

#[test]
fn only_the_issuer_may_edit_a_grant() {
    let (world, grain) = setup();
    let (_, key) = world.webkey(&grain, "alice", viewer());

    assert_matches!(
        update_api_token(
            world.store.as_ref(),
            &AccountId::new("bob-account"),
            &key,
            TokenUpdate {
                revoked: Some(true),
                ..TokenUpdate::default()
            },
        ),
        Err(GrainhostError::PermissionDenied { .. })
    );

    let updated = update_api_token(
        world.store.as_ref(),
        &AccountId::new("alice-account"),
        &key,
        TokenUpdate {
            petname: Some("renamed".into()),
            role_assignment: Some(editor()),
            revoked: None,
        },
    )
    .unwrap();
    assert_eq!(updated.petname, "renamed");
    assert_eq!(updated.role_assignment, editor());
    assert!(!updated.revoked);

    assert_matches!(
        update_api_token(
            world.store.as_ref(),
            &AccountId::new("alice-account"),
            &TokenId::new("missing"),
            TokenUpdate::default(),
        ),
        Err(GrainhostError::NotFound { .. })
    );
}

#[test]
fn webkey_validation() {
    let (world, grain) = setup();
    let now = Utc::now();

    let (_, good) = world.webkey(&grain, "alice", viewer());
    assert_eq!(validate_webkey(world.store.as_ref(), &good, None, now).unwrap().id, good);

    assert_matches!(
        validate_webkey(world.store.as_ref(), &TokenId::new("unknown"), None, now),
        Err(GrainhostError::PermissionDenied { .. })
    );

    let (_, revoked) = world.webkey(&grain, "alice", viewer());
    world.revoke(&revoked);
    assert_matches!(
        validate_webkey(world.store.as_ref(), &revoked, None, now),
        Err(GrainhostError::Revoked { .. })
    );

    let user_grant = world.share(&grain, "t1", "alice", "bob", viewer());
    assert_matches!(
        validate_webkey(world.store.as_ref(), &user_grant, None, now),
        Err(GrainhostError::PermissionDenied { .. })
    );

    let mut expired = world.token(&world.webkey(&grain, "alice", viewer()).1);
    world.store.remove_token(&expired.id).unwrap();
    expired.expires = Some(now - Duration::minutes(1));
    let expired = world.insert(expired);
    assert_matches!(
        validate_webkey(world.store.as_ref(), &expired, None, now),
        Err(GrainhostError::Expired { .. })
    );

    let mut capability = world.token(&world.webkey(&grain, "alice", viewer()).1);
    world.store.remove_token(&capability.id).unwrap();
    capability.object_id = Some(serde_json::json!({"calendar": 1}));
    let capability = world.insert(capability);
    assert_matches!(
        validate_webkey(world.store.as_ref(), &capability, None, now),
        Err(GrainhostError::PermissionDenied { .. })
    );
}

#[test]
fn self_destructing_webkeys() {
    let (world, grain) = setup();
    let now = Utc::now();
    let mut request = webkey_request(alice(), &grain, viewer());
    request.owner = OwnerRequest::Webkey {
        for_sharing: false,
        expires_if_unused_after: Some(Duration::minutes(5)),
    };
    let used = create_new_api_token(world.store.as_ref(), request.clone(), &MintingConfig::default(), now).unwrap();
    let unused = create_new_api_token(world.store.as_ref(), request, &MintingConfig::default(), now).unwrap();

    // Redeeming pushes the deadline back.
    let refreshed = now + Duration::minutes(30);
    let token = validate_webkey(world.store.as_ref(), &used.id, Some(refreshed), now + Duration::minutes(1)).unwrap();
    assert_eq!(token.expires_if_unused, Some(refreshed));

    assert_matches!(
        validate_webkey(world.store.as_ref(), &unused.id, None, now + Duration::minutes(6)),
        Err(GrainhostError::Expired { .. })
    );

    let removed = cleanup_self_destructing(world.store.as_ref(), now + Duration::minutes(10)).unwrap();
    assert_eq!(removed, 1);
    assert!(world.store.get_token(&unused.id).unwrap().is_none());
    assert!(world.store.get_token(&used.id).unwrap().is_some());

    // Without a refresh time the key becomes permanent.
    let token = validate_webkey(world.store.as_ref(), &used.id, None, now + Duration::minutes(11)).unwrap();
    assert!(token.expires_if_unused.is_none());
}
