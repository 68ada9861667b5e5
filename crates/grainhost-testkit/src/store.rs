//! Store wrapper for staging races and write failures

use grainhost_core::store::{GrainStore, PackageStore, SessionStore, TokenStore};
use grainhost_core::{
    Account, AccountId, ApiHost, ApiToken, AppId, DevApp, Grain, GrainId, GrainhostError, HostId,
    IdentityId, MemoryStore, Package, PackageId, Result, Session, SessionId, Store, StoreEvent,
    TokenId, TokenWatch,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

type Hook = Box<dyn FnOnce(&MemoryStore) + Send>;

/// Delegates to a [`MemoryStore`], with hooks tests can arm
pub struct HookedStore {
    inner: Arc<MemoryStore>,
    before_reread: Mutex<Option<Hook>>,
    fail_token_inserts: AtomicBool,
    fail_api_host_inserts: AtomicBool,
}

impl HookedStore {
    /// Wrap `inner`; no hooks are armed
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            before_reread: Mutex::new(None),
            fail_token_inserts: AtomicBool::new(false),
            fail_api_host_inserts: AtomicBool::new(false),
        }
    }

    /// Run `hook` on the inner store the next time grants are re-read by id,
    /// i.e. between the two passes of a verification
    pub fn before_next_reread(&self, hook: impl FnOnce(&MemoryStore) + Send + 'static) {
        *self.before_reread.lock() = Some(Box::new(hook));
    }

    /// Make grant inserts fail
    pub fn fail_token_inserts(&self, fail: bool) {
        self.fail_token_inserts.store(fail, Ordering::SeqCst);
    }

    /// Make unauthenticated access descriptor inserts fail
    pub fn fail_api_host_inserts(&self, fail: bool) {
        self.fail_api_host_inserts.store(fail, Ordering::SeqCst);
    }
}

impl GrainStore for HookedStore {
    fn get_grain(&self, id: &GrainId) -> Result<Option<Grain>> {
        self.inner.get_grain(id)
    }

    fn put_grain(&self, grain: Grain) -> Result<()> {
        self.inner.put_grain(grain)
    }

    fn update_grain(&self, id: &GrainId, update: &mut dyn FnMut(&mut Grain)) -> Result<Option<Grain>> {
        self.inner.update_grain(id, update)
    }

    fn count_grains_for_account(&self, account_id: &AccountId) -> Result<usize> {
        self.inner.count_grains_for_account(account_id)
    }

    fn grains_for_app(&self, app_id: &AppId) -> Result<Vec<Grain>> {
        self.inner.grains_for_app(app_id)
    }

    fn get_account(&self, id: &AccountId) -> Result<Option<Account>> {
        self.inner.get_account(id)
    }

    fn account_for_identity(&self, identity_id: &IdentityId) -> Result<Option<Account>> {
        self.inner.account_for_identity(identity_id)
    }

    fn put_account(&self, account: Account) -> Result<()> {
        self.inner.put_account(account)
    }

    fn update_account(
        &self,
        id: &AccountId,
        update: &mut dyn FnMut(&mut Account),
    ) -> Result<Option<Account>> {
        self.inner.update_account(id, update)
    }
}

impl TokenStore for HookedStore {
    fn get_token(&self, id: &TokenId) -> Result<Option<ApiToken>> {
        self.inner.get_token(id)
    }

    fn insert_token(&self, token: ApiToken) -> Result<()> {
        if self.fail_token_inserts.load(Ordering::SeqCst) {
            return Err(GrainhostError::internal("token insert failed"));
        }
        self.inner.insert_token(token)
    }

    fn update_token(
        &self,
        id: &TokenId,
        update: &mut dyn FnMut(&mut ApiToken),
    ) -> Result<Option<ApiToken>> {
        self.inner.update_token(id, update)
    }

    fn remove_token(&self, id: &TokenId) -> Result<Option<ApiToken>> {
        self.inner.remove_token(id)
    }

    fn remove_tokens_where(&self, predicate: &dyn Fn(&ApiToken) -> bool) -> Result<Vec<ApiToken>> {
        self.inner.remove_tokens_where(predicate)
    }

    fn tokens_for_grain(&self, grain_id: &GrainId) -> Result<Vec<ApiToken>> {
        self.inner.tokens_for_grain(grain_id)
    }

    fn live_tokens_for_grains(&self, grain_ids: &[GrainId]) -> Result<Vec<ApiToken>> {
        self.inner.live_tokens_for_grains(grain_ids)
    }

    fn live_tokens_by_ids(&self, ids: &[TokenId]) -> Result<Vec<ApiToken>> {
        let hook = self.before_reread.lock().take();
        if let Some(hook) = hook {
            hook(&self.inner);
        }
        self.inner.live_tokens_by_ids(ids)
    }

    fn watch_tokens(&self, ids: &[TokenId]) -> TokenWatch {
        self.inner.watch_tokens(ids)
    }

    fn insert_api_host(&self, host: ApiHost) -> Result<()> {
        if self.fail_api_host_inserts.load(Ordering::SeqCst) {
            return Err(GrainhostError::internal("api host insert failed"));
        }
        self.inner.insert_api_host(host)
    }

    fn get_api_host(&self, id: &str) -> Result<Option<ApiHost>> {
        self.inner.get_api_host(id)
    }
}

impl SessionStore for HookedStore {
    fn get_session(&self, id: &SessionId) -> Result<Option<Session>> {
        self.inner.get_session(id)
    }

    fn session_by_host(&self, host_id: &HostId) -> Result<Option<Session>> {
        self.inner.session_by_host(host_id)
    }

    fn insert_session(&self, session: Session) -> Result<()> {
        self.inner.insert_session(session)
    }

    fn update_session(
        &self,
        id: &SessionId,
        update: &mut dyn FnMut(&mut Session),
    ) -> Result<Option<Session>> {
        self.inner.update_session(id, update)
    }

    fn remove_sessions_where(&self, predicate: &dyn Fn(&Session) -> bool) -> Result<Vec<Session>> {
        self.inner.remove_sessions_where(predicate)
    }
}

impl PackageStore for HookedStore {
    fn get_package(&self, id: &PackageId) -> Result<Option<Package>> {
        self.inner.get_package(id)
    }

    fn put_package(&self, package: Package) -> Result<()> {
        self.inner.put_package(package)
    }

    fn get_dev_app(&self, app_id: &AppId) -> Result<Option<DevApp>> {
        self.inner.get_dev_app(app_id)
    }

    fn put_dev_app(&self, dev_app: DevApp) -> Result<()> {
        self.inner.put_dev_app(dev_app)
    }
}

impl Store for HookedStore {
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.subscribe()
    }
}
