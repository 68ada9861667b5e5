//! Seeded document store

use chrono::Utc;
use grainhost_core::identifiers::random_id;
use grainhost_core::records::EnvVar;
use grainhost_core::store::{GrainStore, PackageStore, TokenStore};
use grainhost_core::{
    Account, AccountId, ApiToken, AppId, Command, Grain, GrainId, GrainhostConfig, IdentityId,
    LocalizedText, Manifest, MemoryStore, Package, PackageId, PermissionDef, RoleAssignment,
    RoleDef, Store, TokenId, TokenOwner, UserOwner, ViewInfo,
};
use std::sync::Arc;

/// Index of the `read` permission in [`notes_view_info`]
pub const READ: usize = 0;
/// Index of the `write` permission in [`notes_view_info`]
pub const WRITE: usize = 1;

/// Package every grain created by [`World::add_grain`] runs
pub const NOTES_PACKAGE: &str = "notes-pkg";
/// App of [`NOTES_PACKAGE`]
pub const NOTES_APP: &str = "notes-app";

/// Permissions `read` and `write`; roles `editor` (both) and `viewer` (read, the default)
pub fn notes_view_info() -> ViewInfo {
    ViewInfo {
        permissions: vec![
            PermissionDef {
                name: "read".into(),
                ..Default::default()
            },
            PermissionDef {
                name: "write".into(),
                ..Default::default()
            },
        ],
        roles: vec![
            RoleDef {
                title: "editor".into(),
                permissions: vec![true, true].into(),
                default: false,
            },
            RoleDef {
                title: "viewer".into(),
                permissions: vec![true, false].into(),
                default: true,
            },
        ],
    }
}

/// Role index of `editor`
pub fn editor() -> RoleAssignment {
    RoleAssignment::role(0)
}

/// Role index of `viewer`
pub fn viewer() -> RoleAssignment {
    RoleAssignment::role(1)
}

/// A store with helpers for building sharing graphs
pub struct World {
    /// Backing store
    pub store: Arc<MemoryStore>,
    /// Configuration handed to the code under test
    pub config: GrainhostConfig,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// Empty store, default configuration and the notes package installed
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        store
            .put_package(Package {
                id: PackageId::new(NOTES_PACKAGE),
                app_id: AppId::new(NOTES_APP),
                manifest: notes_manifest(),
            })
            .unwrap();
        Self {
            store,
            config: GrainhostConfig::default(),
        }
    }

    /// The store as the trait object the kernel consumes
    pub fn dyn_store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Create `{name}-account` with a single identity `name`
    pub fn add_user(&self, name: &str) -> (AccountId, IdentityId) {
        let account_id = AccountId::new(format!("{name}-account"));
        let identity_id = IdentityId::new(name);
        self.store
            .put_account(Account::new(account_id.clone(), vec![identity_id.clone()]))
            .unwrap();
        (account_id, identity_id)
    }

    /// Create a notes grain owned by the user `owner` added with [`World::add_user`]
    pub fn add_grain(&self, id: &str, owner: &str, private: bool) -> GrainId {
        let grain_id = GrainId::new(id);
        self.store
            .put_grain(Grain {
                id: grain_id.clone(),
                owner_account: AccountId::new(format!("{owner}-account")),
                owner_identity: IdentityId::new(owner),
                private,
                cached_view_info: Some(notes_view_info()),
                package_id: PackageId::new(NOTES_PACKAGE),
                app_id: AppId::new(NOTES_APP),
                title: format!("{owner}'s notes"),
                last_used: None,
            })
            .unwrap();
        grain_id
    }

    /// Grant `id` from identity `from` to identity `to`
    pub fn share(&self, grain: &GrainId, id: &str, from: &str, to: &str, role: RoleAssignment) -> TokenId {
        let mut token = ApiToken::new(TokenId::new(id), grain.clone(), Utc::now());
        token.identity_id = Some(IdentityId::new(from));
        token.account_id = Some(AccountId::new(format!("{from}-account")));
        token.role_assignment = role;
        token.owner = user_owner(to);
        self.insert(token)
    }

    /// Bearer webkey issued by identity `from`; returns the secret and the grant id
    pub fn webkey(&self, grain: &GrainId, from: &str, role: RoleAssignment) -> (String, TokenId) {
        let secret = random_id(43);
        let mut token = ApiToken::new(TokenId::from_secret(&secret), grain.clone(), Utc::now());
        token.identity_id = Some(IdentityId::new(from));
        token.account_id = Some(AccountId::new(format!("{from}-account")));
        token.role_assignment = role;
        let id = self.insert(token);
        (secret, id)
    }

    /// Webkey derived from `parent`; returns the secret and the grant id
    pub fn child_webkey(&self, parent: &TokenId, role: RoleAssignment) -> (String, TokenId) {
        let parent = self.token(parent);
        let secret = random_id(43);
        let mut token = ApiToken::new(TokenId::from_secret(&secret), parent.grain_id.clone(), Utc::now());
        token.identity_id = parent.identity_id.clone();
        token.account_id = parent.account_id.clone();
        token.parent_token = Some(parent.id.clone());
        token.role_assignment = role;
        let id = self.insert(token);
        (secret, id)
    }

    /// Grant `id` derived from `parent` and delivered to identity `to`
    pub fn child_share(&self, parent: &TokenId, id: &str, to: &str, role: RoleAssignment) -> TokenId {
        let parent = self.token(parent);
        let mut token = ApiToken::new(TokenId::new(id), parent.grain_id.clone(), Utc::now());
        token.identity_id = parent.identity_id.clone();
        token.account_id = parent.account_id.clone();
        token.parent_token = Some(parent.id.clone());
        token.role_assignment = role;
        token.owner = user_owner(to);
        self.insert(token)
    }

    /// Insert a hand-built grant
    pub fn insert(&self, token: ApiToken) -> TokenId {
        let id = token.id.clone();
        self.store.insert_token(token).unwrap();
        id
    }

    /// Mark a grant revoked
    pub fn revoke(&self, id: &TokenId) {
        self.store
            .update_token(id, &mut |token: &mut ApiToken| token.revoked = true)
            .unwrap()
            .expect("revoked grant exists");
    }

    /// A stored grant
    pub fn token(&self, id: &TokenId) -> ApiToken {
        self.store.get_token(id).unwrap().expect("grant exists")
    }

    /// A stored grain
    pub fn grain(&self, id: &GrainId) -> Grain {
        self.store.get_grain(id).unwrap().expect("grain exists")
    }

    /// A stored account
    pub fn account(&self, id: &AccountId) -> Account {
        self.store.get_account(id).unwrap().expect("account exists")
    }
}

/// Manifest of the notes package
pub fn notes_manifest() -> Manifest {
    Manifest {
        app_title: LocalizedText::plain("Notes"),
        continue_command: Some(Command {
            argv: Some(vec!["/notes".into(), "--continue".into()]),
            environ: vec![EnvVar {
                key: "HOME".into(),
                value: "/var".into(),
            }],
            ..Default::default()
        }),
        grain_icon: None,
    }
}

fn user_owner(identity: &str) -> TokenOwner {
    TokenOwner::User(UserOwner {
        identity_id: IdentityId::new(identity),
        title: String::new(),
        denormalized_grain_metadata: None,
        last_used: None,
    })
}
