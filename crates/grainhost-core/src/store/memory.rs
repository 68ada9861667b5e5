//! In-memory document store

use super::{GrainStore, PackageStore, SessionStore, Store, StoreEvent, TokenStore, TokenWatch, WatchRegistry};
use crate::errors::{GrainhostError, Result};
use crate::grant::{ApiHost, ApiToken};
use crate::identifiers::{AccountId, AppId, GrainId, HostId, IdentityId, PackageId, SessionId, TokenId};
use crate::records::{Account, DevApp, Grain, Package, Session};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

#[derive(Default)]
struct Tables {
    grains: HashMap<GrainId, Grain>,
    accounts: HashMap<AccountId, Account>,
    tokens: HashMap<TokenId, ApiToken>,
    api_hosts: HashMap<String, ApiHost>,
    sessions: HashMap<SessionId, Session>,
    packages: HashMap<PackageId, Package>,
    dev_apps: HashMap<AppId, DevApp>,
}

/// Store holding every collection in process memory
pub struct MemoryStore {
    tables: RwLock<Tables>,
    events: broadcast::Sender<StoreEvent>,
    watches: WatchRegistry,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tables: RwLock::new(Tables::default()),
            events,
            watches: WatchRegistry::new(),
        }
    }

    /// Number of registered, unfired token watches
    pub fn active_watch_count(&self) -> usize {
        self.watches.active_count()
    }

    fn publish(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn token_changed(&self, old: ApiToken, new: ApiToken) {
        if old.authority_changed(&new) {
            self.watches.notify(&new.id);
        }
        self.publish(StoreEvent::TokenChanged {
            old: Box::new(old),
            new: Box::new(new),
        });
    }

    fn token_removed(&self, old: ApiToken) {
        self.watches.notify(&old.id);
        self.publish(StoreEvent::TokenRemoved(Box::new(old)));
    }
}

impl GrainStore for MemoryStore {
    fn get_grain(&self, id: &GrainId) -> Result<Option<Grain>> {
        Ok(self.tables.read().grains.get(id).cloned())
    }

    fn put_grain(&self, grain: Grain) -> Result<()> {
        let old = self
            .tables
            .write()
            .grains
            .insert(grain.id.clone(), grain.clone());
        if let Some(old) = old {
            self.publish(StoreEvent::GrainChanged {
                old: Box::new(old),
                new: Box::new(grain),
            });
        }
        Ok(())
    }

    fn update_grain(&self, id: &GrainId, update: &mut dyn FnMut(&mut Grain)) -> Result<Option<Grain>> {
        let changed = {
            let mut tables = self.tables.write();
            let Some(grain) = tables.grains.get_mut(id) else {
                return Ok(None);
            };
            let old = grain.clone();
            update(grain);
            (old, grain.clone())
        };
        let (old, new) = changed;
        self.publish(StoreEvent::GrainChanged {
            old: Box::new(old),
            new: Box::new(new.clone()),
        });
        Ok(Some(new))
    }

    fn count_grains_for_account(&self, account_id: &AccountId) -> Result<usize> {
        Ok(self
            .tables
            .read()
            .grains
            .values()
            .filter(|grain| &grain.owner_account == account_id)
            .count())
    }

    fn grains_for_app(&self, app_id: &AppId) -> Result<Vec<Grain>> {
        Ok(self
            .tables
            .read()
            .grains
            .values()
            .filter(|grain| &grain.app_id == app_id)
            .cloned()
            .collect())
    }

    fn get_account(&self, id: &AccountId) -> Result<Option<Account>> {
        Ok(self.tables.read().accounts.get(id).cloned())
    }

    fn account_for_identity(&self, identity_id: &IdentityId) -> Result<Option<Account>> {
        Ok(self
            .tables
            .read()
            .accounts
            .values()
            .find(|account| account.has_identity(identity_id))
            .cloned())
    }

    fn put_account(&self, account: Account) -> Result<()> {
        self.tables.write().accounts.insert(account.id.clone(), account);
        Ok(())
    }

    fn update_account(
        &self,
        id: &AccountId,
        update: &mut dyn FnMut(&mut Account),
    ) -> Result<Option<Account>> {
        let mut tables = self.tables.write();
        Ok(tables.accounts.get_mut(id).map(|account| {
            update(account);
            account.clone()
        }))
    }
}

impl TokenStore for MemoryStore {
    fn get_token(&self, id: &TokenId) -> Result<Option<ApiToken>> {
        Ok(self.tables.read().tokens.get(id).cloned())
    }

    fn insert_token(&self, token: ApiToken) -> Result<()> {
        {
            let mut tables = self.tables.write();
            if tables.tokens.contains_key(&token.id) {
                return Err(GrainhostError::invalid(format!(
                    "duplicate token id {}",
                    token.id
                )));
            }
            tables.tokens.insert(token.id.clone(), token.clone());
        }
        self.publish(StoreEvent::TokenInserted(Box::new(token)));
        Ok(())
    }

    fn update_token(
        &self,
        id: &TokenId,
        update: &mut dyn FnMut(&mut ApiToken),
    ) -> Result<Option<ApiToken>> {
        let changed = {
            let mut tables = self.tables.write();
            let Some(token) = tables.tokens.get_mut(id) else {
                return Ok(None);
            };
            let old = token.clone();
            update(token);
            token.id = old.id.clone();
            (old, token.clone())
        };
        let (old, new) = changed;
        self.token_changed(old, new.clone());
        Ok(Some(new))
    }

    fn remove_token(&self, id: &TokenId) -> Result<Option<ApiToken>> {
        let removed = self.tables.write().tokens.remove(id);
        if let Some(old) = &removed {
            self.token_removed(old.clone());
        }
        Ok(removed)
    }

    fn remove_tokens_where(&self, predicate: &dyn Fn(&ApiToken) -> bool) -> Result<Vec<ApiToken>> {
        let removed: Vec<ApiToken> = {
            let mut tables = self.tables.write();
            let ids: Vec<TokenId> = tables
                .tokens
                .values()
                .filter(|token| predicate(token))
                .map(|token| token.id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| tables.tokens.remove(id))
                .collect()
        };
        for token in &removed {
            self.token_removed(token.clone());
        }
        Ok(removed)
    }

    fn tokens_for_grain(&self, grain_id: &GrainId) -> Result<Vec<ApiToken>> {
        let mut tokens: Vec<ApiToken> = self
            .tables
            .read()
            .tokens
            .values()
            .filter(|token| &token.grain_id == grain_id)
            .cloned()
            .collect();
        tokens.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(tokens)
    }

    fn live_tokens_for_grains(&self, grain_ids: &[GrainId]) -> Result<Vec<ApiToken>> {
        let now = Utc::now();
        let mut tokens: Vec<ApiToken> = self
            .tables
            .read()
            .tokens
            .values()
            .filter(|token| token.is_live(now) && grain_ids.contains(&token.grain_id))
            .cloned()
            .collect();
        tokens.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tokens)
    }

    fn live_tokens_by_ids(&self, ids: &[TokenId]) -> Result<Vec<ApiToken>> {
        let now = Utc::now();
        let tables = self.tables.read();
        Ok(ids
            .iter()
            .filter_map(|id| tables.tokens.get(id))
            .filter(|token| token.is_live(now))
            .cloned()
            .collect())
    }

    fn watch_tokens(&self, ids: &[TokenId]) -> TokenWatch {
        self.watches.register(ids.iter().cloned())
    }

    fn insert_api_host(&self, host: ApiHost) -> Result<()> {
        self.tables.write().api_hosts.insert(host.id.clone(), host);
        Ok(())
    }

    fn get_api_host(&self, id: &str) -> Result<Option<ApiHost>> {
        Ok(self.tables.read().api_hosts.get(id).cloned())
    }
}

impl SessionStore for MemoryStore {
    fn get_session(&self, id: &SessionId) -> Result<Option<Session>> {
        Ok(self.tables.read().sessions.get(id).cloned())
    }

    fn session_by_host(&self, host_id: &HostId) -> Result<Option<Session>> {
        Ok(self
            .tables
            .read()
            .sessions
            .values()
            .find(|session| &session.host_id == host_id)
            .cloned())
    }

    fn insert_session(&self, session: Session) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.sessions.contains_key(&session.id) {
            return Err(GrainhostError::invalid(format!(
                "duplicate session id {}",
                session.id
            )));
        }
        tables.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    fn update_session(
        &self,
        id: &SessionId,
        update: &mut dyn FnMut(&mut Session),
    ) -> Result<Option<Session>> {
        let mut tables = self.tables.write();
        Ok(tables.sessions.get_mut(id).map(|session| {
            update(session);
            session.clone()
        }))
    }

    fn remove_sessions_where(&self, predicate: &dyn Fn(&Session) -> bool) -> Result<Vec<Session>> {
        let removed: Vec<Session> = {
            let mut tables = self.tables.write();
            let ids: Vec<SessionId> = tables
                .sessions
                .values()
                .filter(|session| predicate(session))
                .map(|session| session.id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| tables.sessions.remove(id))
                .collect()
        };
        for session in &removed {
            self.publish(StoreEvent::SessionRemoved(Box::new(session.clone())));
        }
        Ok(removed)
    }
}

impl PackageStore for MemoryStore {
    fn get_package(&self, id: &PackageId) -> Result<Option<Package>> {
        Ok(self.tables.read().packages.get(id).cloned())
    }

    fn put_package(&self, package: Package) -> Result<()> {
        self.tables.write().packages.insert(package.id.clone(), package);
        Ok(())
    }

    fn get_dev_app(&self, app_id: &AppId) -> Result<Option<DevApp>> {
        Ok(self.tables.read().dev_apps.get(app_id).cloned())
    }

    fn put_dev_app(&self, dev_app: DevApp) -> Result<()> {
        let app_id = dev_app.id.clone();
        self.tables.write().dev_apps.insert(app_id.clone(), dev_app);
        self.publish(StoreEvent::DevAppChanged(app_id));
        Ok(())
    }
}

impl Store for MemoryStore {
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view_info::RoleAssignment;

    fn token(id: &str) -> ApiToken {
        ApiToken::new(TokenId::new(id), GrainId::new("g"), Utc::now())
    }

    #[test]
    fn test_revocation_fires_watch() {
        let store = MemoryStore::new();
        store.insert_token(token("t1")).unwrap();
        let watch = store.watch_tokens(&[TokenId::new("t1")]);

        store
            .update_token(&TokenId::new("t1"), &mut |t: &mut ApiToken| t.petname = "renamed".into())
            .unwrap();
        assert!(!watch.is_invalidated());

        store
            .update_token(&TokenId::new("t1"), &mut |t: &mut ApiToken| t.revoked = true)
            .unwrap();
        assert!(watch.is_invalidated());
        assert_eq!(store.active_watch_count(), 0);
    }

    #[test]
    fn test_role_change_and_removal_fire_watch() {
        let store = MemoryStore::new();
        store.insert_token(token("t1")).unwrap();
        store.insert_token(token("t2")).unwrap();
        let first = store.watch_tokens(&[TokenId::new("t1")]);
        let second = store.watch_tokens(&[TokenId::new("t2")]);

        store
            .update_token(&TokenId::new("t1"), &mut |t: &mut ApiToken| {
                t.role_assignment = RoleAssignment::role(2);
            })
            .unwrap();
        assert!(first.is_invalidated());

        store.remove_token(&TokenId::new("t2")).unwrap();
        assert!(second.is_invalidated());
    }

    #[test]
    fn test_live_token_filtering() {
        let store = MemoryStore::new();
        store.insert_token(token("live")).unwrap();
        let mut revoked = token("revoked");
        revoked.revoked = true;
        store.insert_token(revoked).unwrap();
        let mut object = token("object");
        object.object_id = Some(serde_json::json!({ "file": 1 }));
        store.insert_token(object).unwrap();
        let mut expired = token("expired");
        expired.expires = Some(Utc::now() - chrono::Duration::seconds(1));
        store.insert_token(expired).unwrap();

        let live = store.live_tokens_for_grains(&[GrainId::new("g")]).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, TokenId::new("live"));

        let ids = [TokenId::new("live"), TokenId::new("revoked"), TokenId::new("expired")];
        assert_eq!(store.live_tokens_by_ids(&ids).unwrap().len(), 1);
        assert!(store.insert_token(token("live")).is_err());
    }

    #[tokio::test]
    async fn test_events_published() {
        let store = MemoryStore::new();
        let mut events = store.subscribe();
        store.insert_token(token("t1")).unwrap();
        store.remove_token(&TokenId::new("t1")).unwrap();

        assert!(matches!(events.recv().await.unwrap(), StoreEvent::TokenInserted(_)));
        assert!(matches!(events.recv().await.unwrap(), StoreEvent::TokenRemoved(_)));
    }
}
