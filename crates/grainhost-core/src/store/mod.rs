//! Document-store seam
//!
//! The kernel reads and writes grains, grants, sessions and packages through
//! these synchronous traits. Implementations are expected to be in-memory
//! caches of the backing database: calls return without blocking on I/O, so
//! resolver code may call them freely while it computes.
//!
//! Writers publish [`StoreEvent`]s so long-lived holders of derived state
//! (proxies, cached permission results) can react to changes.

mod memory;
mod watch;

pub use memory::MemoryStore;
pub use watch::{TokenWatch, WatchRegistry};

use crate::errors::Result;
use crate::grant::{ApiHost, ApiToken};
use crate::identifiers::{AccountId, AppId, GrainId, HostId, IdentityId, PackageId, SessionId, TokenId};
use crate::records::{Account, DevApp, Grain, Package, Session};
use tokio::sync::broadcast;

/// Change notification published by a store after a write commits
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A grant was inserted
    TokenInserted(Box<ApiToken>),
    /// A grant was modified
    TokenChanged {
        /// Before the write
        old: Box<ApiToken>,
        /// After the write
        new: Box<ApiToken>,
    },
    /// A grant was deleted
    TokenRemoved(Box<ApiToken>),
    /// A grain was modified
    GrainChanged {
        /// Before the write
        old: Box<Grain>,
        /// After the write
        new: Box<Grain>,
    },
    /// A session was deleted
    SessionRemoved(Box<Session>),
    /// A dev app was registered or replaced
    DevAppChanged(AppId),
}

/// Grain and account records
pub trait GrainStore: Send + Sync {
    /// Fetch a grain
    fn get_grain(&self, id: &GrainId) -> Result<Option<Grain>>;

    /// Insert or replace a grain
    fn put_grain(&self, grain: Grain) -> Result<()>;

    /// Modify a grain in place, returning the new version
    fn update_grain(&self, id: &GrainId, update: &mut dyn FnMut(&mut Grain)) -> Result<Option<Grain>>;

    /// Number of grains owned by an account
    fn count_grains_for_account(&self, account_id: &AccountId) -> Result<usize>;

    /// Grains of an app
    fn grains_for_app(&self, app_id: &AppId) -> Result<Vec<Grain>>;

    /// Fetch an account
    fn get_account(&self, id: &AccountId) -> Result<Option<Account>>;

    /// Account an identity is linked to
    fn account_for_identity(&self, identity_id: &IdentityId) -> Result<Option<Account>>;

    /// Insert or replace an account
    fn put_account(&self, account: Account) -> Result<()>;

    /// Modify an account in place, returning the new version
    fn update_account(
        &self,
        id: &AccountId,
        update: &mut dyn FnMut(&mut Account),
    ) -> Result<Option<Account>>;
}

/// Capability grants
pub trait TokenStore: Send + Sync {
    /// Fetch a grant by id, including revoked grants
    fn get_token(&self, id: &TokenId) -> Result<Option<ApiToken>>;

    /// Insert a new grant; fails if the id is taken
    fn insert_token(&self, token: ApiToken) -> Result<()>;

    /// Modify a grant in place, returning the new version
    fn update_token(
        &self,
        id: &TokenId,
        update: &mut dyn FnMut(&mut ApiToken),
    ) -> Result<Option<ApiToken>>;

    /// Delete one grant
    fn remove_token(&self, id: &TokenId) -> Result<Option<ApiToken>>;

    /// Delete every grant matching the predicate
    fn remove_tokens_where(&self, predicate: &dyn Fn(&ApiToken) -> bool) -> Result<Vec<ApiToken>>;

    /// Every grant on a grain, including revoked ones
    fn tokens_for_grain(&self, grain_id: &GrainId) -> Result<Vec<ApiToken>>;

    /// Live UiView grants on any of the given grains
    fn live_tokens_for_grains(&self, grain_ids: &[GrainId]) -> Result<Vec<ApiToken>>;

    /// Live UiView grants among the given ids
    fn live_tokens_by_ids(&self, ids: &[TokenId]) -> Result<Vec<ApiToken>>;

    /// Register a watch firing when any of `ids` changes authority or is removed
    fn watch_tokens(&self, ids: &[TokenId]) -> TokenWatch;

    /// Store an unauthenticated access descriptor
    fn insert_api_host(&self, host: ApiHost) -> Result<()>;

    /// Fetch an unauthenticated access descriptor
    fn get_api_host(&self, id: &str) -> Result<Option<ApiHost>>;
}

/// Interactive sessions
pub trait SessionStore: Send + Sync {
    /// Fetch a session
    fn get_session(&self, id: &SessionId) -> Result<Option<Session>>;

    /// Fetch the session served on a host
    fn session_by_host(&self, host_id: &HostId) -> Result<Option<Session>>;

    /// Insert a session; fails if the id is taken
    fn insert_session(&self, session: Session) -> Result<()>;

    /// Modify a session in place, returning the new version
    fn update_session(
        &self,
        id: &SessionId,
        update: &mut dyn FnMut(&mut Session),
    ) -> Result<Option<Session>>;

    /// Delete every session matching the predicate
    fn remove_sessions_where(&self, predicate: &dyn Fn(&Session) -> bool) -> Result<Vec<Session>>;
}

/// Installed packages and dev apps
pub trait PackageStore: Send + Sync {
    /// Fetch an installed package
    fn get_package(&self, id: &PackageId) -> Result<Option<Package>>;

    /// Insert or replace a package
    fn put_package(&self, package: Package) -> Result<()>;

    /// Fetch the dev app overriding an app id
    fn get_dev_app(&self, app_id: &AppId) -> Result<Option<DevApp>>;

    /// Insert or replace a dev app
    fn put_dev_app(&self, dev_app: DevApp) -> Result<()>;
}

/// The full document store
pub trait Store: GrainStore + TokenStore + SessionStore + PackageStore {
    /// Subscribe to change events published after each write
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}
