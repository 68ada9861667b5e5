//! Live proxies by session host and by API token
//!
//! Both tables use the same pending-slot protocol: a builder first reserves
//! an empty slot, builds the proxy outside the lock and then fills the slot.
//! Anything that invalidates the key meanwhile removes the slot, and the
//! builder then fails instead of publishing a proxy for revoked access.
//! When two builders race on one key, the first to publish wins and the
//! other's proxy is closed.
//!
//! [`ProxyRegistry::spawn_event_loop`] keeps the tables consistent with the
//! store: changing or deleting a grant closes every proxy and session derived
//! from it, and flipping a grain's privacy closes everything but the owner's
//! sessions.

use crate::proxy::Proxy;
use chrono::{Duration, Utc};
use grainhost_backend::GrainManager;
use grainhost_core::{
    ApiToken, Grain, GrainId, GrainhostError, HostId, IdentityId, Result, Session, Store,
    StoreEvent, TokenId,
};
use grainhost_permissions::{downstream_of_grant, may_open_grain, validate_webkey, Principal};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

type Slots<K> = Mutex<HashMap<K, Option<Arc<Proxy>>>>;

/// Owns every live [`Proxy`]
pub struct ProxyRegistry {
    manager: Arc<GrainManager>,
    by_host: Slots<HostId>,
    by_token: Slots<TokenId>,
}

impl std::fmt::Debug for ProxyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (hosts, tokens) = self.proxy_counts();
        f.debug_struct("ProxyRegistry")
            .field("hosts", &hosts)
            .field("tokens", &tokens)
            .finish_non_exhaustive()
    }
}

impl ProxyRegistry {
    /// Empty registry serving grains through `manager`
    pub fn new(manager: Arc<GrainManager>) -> Self {
        Self {
            manager,
            by_host: Mutex::new(HashMap::new()),
            by_token: Mutex::new(HashMap::new()),
        }
    }

    /// Grain manager the proxies use
    pub fn manager(&self) -> &Arc<GrainManager> {
        &self.manager
    }

    fn store(&self) -> &dyn Store {
        self.manager.store().as_ref()
    }

    /// Live proxies on session hosts and on the API host
    pub fn proxy_counts(&self) -> (usize, usize) {
        fn live<K>(slots: &HashMap<K, Option<Arc<Proxy>>>) -> usize {
            slots.values().filter(|slot| slot.is_some()).count()
        }
        (live(&self.by_host.lock()), live(&self.by_token.lock()))
    }

    /// Proxy serving a session host, or `None` if no session uses the host
    pub fn proxy_for_host(&self, host_id: &HostId) -> Result<Option<Arc<Proxy>>> {
        if let Some(proxy) = reserve(&self.by_host, host_id) {
            return Ok(Some(proxy));
        }
        let built = self.build_host_proxy(host_id);
        match built {
            Ok(Some(proxy)) => publish(&self.by_host, host_id, proxy, "session was concurrently closed").map(Some),
            other => {
                abandon(&self.by_host, host_id);
                other
            }
        }
    }

    fn build_host_proxy(&self, host_id: &HostId) -> Result<Option<Arc<Proxy>>> {
        let store = self.store();
        let Some(session) = store.session_by_host(host_id)? else {
            return Ok(None);
        };
        if let Some(token_id) = &session.hashed_token {
            if store.get_token(token_id)?.is_none() {
                return Err(GrainhostError::gone("grant has been deleted"));
            }
        }
        if store.get_grain(&session.grain_id)?.is_none() {
            return Err(GrainhostError::gone("resource has been deleted"));
        }
        // The session's existence means it already passed `may_open_grain`.
        Ok(Some(Arc::new(Proxy::for_session(Arc::clone(&self.manager), &session))))
    }

    /// Proxy serving requests that present the bearer `secret`
    pub fn proxy_for_api_token(&self, secret: &str) -> Result<Arc<Proxy>> {
        let token_id = TokenId::from_secret(secret);
        if let Some(proxy) = reserve(&self.by_token, &token_id) {
            if proxy.is_expired(Utc::now()) {
                return Err(GrainhostError::expired("authorization token expired"));
            }
            return Ok(proxy);
        }
        match self.build_api_proxy(&token_id) {
            Ok(proxy) => publish(&self.by_token, &token_id, proxy, "token was concurrently revoked"),
            Err(err) => {
                abandon(&self.by_token, &token_id);
                Err(err)
            }
        }
    }

    fn build_api_proxy(&self, token_id: &TokenId) -> Result<Arc<Proxy>> {
        let store = self.store();
        let token = validate_webkey(store, token_id, None, Utc::now())?;
        if store.get_grain(&token.grain_id)?.is_none() {
            return Err(GrainhostError::gone("resource has been deleted"));
        }

        let account_id = match (&token.identity_id, token.for_sharing) {
            (Some(identity_id), false) => {
                let account = store
                    .account_for_identity(identity_id)?
                    .ok_or_else(|| GrainhostError::permission_denied("user has been deleted"))?;
                Some(account.id)
            }
            _ => None,
        };
        if !may_open_grain(store, &Principal::token(&token))? {
            return Err(GrainhostError::permission_denied("unauthorized"));
        }
        Ok(Arc::new(Proxy::for_api_token(Arc::clone(&self.manager), &token, account_id)))
    }

    /// Push back the self-destruct time of a webkey by up to `keepalive`
    pub fn refresh_webkey(&self, secret: &str, keepalive: std::time::Duration) -> Result<()> {
        let limit = std::time::Duration::from_secs(self.manager.config().sessions.webkey_keepalive_secs);
        let keepalive = Duration::from_std(keepalive.min(limit))
            .map_err(|err| GrainhostError::invalid(format!("keep-alive out of range: {err}")))?;
        let now = Utc::now();
        validate_webkey(self.store(), &TokenId::from_secret(secret), Some(now + keepalive), now)?;
        Ok(())
    }

    /// Close and forget the proxy on a session host
    pub fn close_host(&self, host_id: &HostId) {
        if let Some(Some(proxy)) = self.by_host.lock().remove(host_id) {
            proxy.close();
        }
    }

    /// Follow store changes until the store shuts down
    pub fn spawn_event_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let mut events = registry.manager.store().subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Err(err) = registry.handle_event(&event) {
                            tracing::error!(error = %err, event = ?event, "failed to apply store change to proxies");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "proxy registry lagged behind store events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Apply one store change
    pub fn handle_event(&self, event: &StoreEvent) -> Result<()> {
        match event {
            StoreEvent::TokenChanged { old, new } if old.authority_changed(new) => {
                self.clear_sessions_and_proxies(new)
            }
            StoreEvent::TokenRemoved(old) => self.clear_sessions_and_proxies(old),
            StoreEvent::GrainChanged { old, new } if old.private != new.private => self.privacy_changed(old),
            StoreEvent::SessionRemoved(session) => {
                self.close_host(&session.host_id);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Close everything reachable from `grant` in the sharing graph
    fn clear_sessions_and_proxies(&self, grant: &ApiToken) -> Result<()> {
        let store = self.store();
        let mut affected = downstream_of_grant(store, grant)?;
        affected.push(grant.clone());

        let mut token_ids = BTreeSet::new();
        let mut identities: BTreeSet<IdentityId> = BTreeSet::new();
        {
            let mut by_token = self.by_token.lock();
            for token in &affected {
                if let Some(Some(proxy)) = by_token.remove(&token.id) {
                    proxy.close();
                }
                token_ids.insert(token.id.clone());
                if let Some(identity_id) = token.recipient_identity() {
                    identities.insert(identity_id.clone());
                }
            }
        }

        let grain_id = grant.grain_id.clone();
        let removed = store.remove_sessions_where(&|session: &Session| {
            session.grain_id == grain_id
                && (session
                    .identity_id
                    .as_ref()
                    .is_some_and(|identity_id| identities.contains(identity_id))
                    || session
                        .hashed_token
                        .as_ref()
                        .is_some_and(|token_id| token_ids.contains(token_id)))
        })?;
        for session in &removed {
            self.close_host(&session.host_id);
        }
        tracing::debug!(
            grain_id = %grant.grain_id,
            token_id = %grant.id,
            grants = affected.len(),
            sessions = removed.len(),
            "closed proxies derived from changed grant"
        );
        Ok(())
    }

    /// Only the owner keeps their sessions when a grain's privacy flips
    fn privacy_changed(&self, grain: &Grain) -> Result<()> {
        let grain_id: GrainId = grain.id.clone();
        let owner = grain.owner_identity.clone();
        let removed = self.store().remove_sessions_where(&|session: &Session| {
            session.grain_id == grain_id && session.identity_id.as_ref() != Some(&owner)
        })?;
        for session in &removed {
            self.close_host(&session.host_id);
        }
        self.by_token.lock().retain(|_, slot| match slot {
            Some(proxy) if proxy.grain_id() == &grain_id => {
                proxy.close();
                false
            }
            _ => true,
        });
        tracing::debug!(grain_id = %grain_id, sessions = removed.len(), "grain privacy changed");
        Ok(())
    }
}

/// A live cached proxy, or else a pending slot for the caller to fill.
/// A slot another builder already reserved stays pending.
fn reserve<K: Eq + Hash + Clone>(slots: &Slots<K>, key: &K) -> Option<Arc<Proxy>> {
    let mut slots = slots.lock();
    match slots.get(key) {
        Some(Some(proxy)) if !proxy.is_closed() => Some(Arc::clone(proxy)),
        Some(None) => None,
        _ => {
            slots.insert(key.clone(), None);
            None
        }
    }
}

/// Fill a reserved slot unless it was removed while the proxy was built.
/// If a concurrent builder published first, its proxy wins and ours is closed.
fn publish<K: Eq + Hash>(slots: &Slots<K>, key: &K, proxy: Arc<Proxy>, removed: &str) -> Result<Arc<Proxy>> {
    match slots.lock().get_mut(key) {
        Some(Some(existing)) if !existing.is_closed() => {
            proxy.close();
            Ok(Arc::clone(existing))
        }
        Some(slot) => {
            *slot = Some(Arc::clone(&proxy));
            Ok(proxy)
        }
        None => {
            proxy.close();
            Err(GrainhostError::permission_denied(removed))
        }
    }
}

/// Drop a slot whose build failed, keeping any proxy a concurrent builder published
fn abandon<K: Eq + Hash>(slots: &Slots<K>, key: &K) {
    let mut slots = slots.lock();
    if matches!(slots.get(key), Some(None)) {
        slots.remove(key);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use grainhost_testkit::{viewer, MockApp, MockBackend, World};

    fn api_proxy(world: &World, manager: &Arc<GrainManager>, token_id: &TokenId) -> Arc<Proxy> {
        let token = world.token(token_id);
        Arc::new(Proxy::for_api_token(Arc::clone(manager), &token, None))
    }

    #[test]
    fn test_concurrent_builders_share_one_proxy() {
        let world = World::new();
        world.add_user("alice");
        let grain = world.add_grain("g", "alice", true);
        let (_, token_id) = world.webkey(&grain, "alice", viewer());
        let manager = Arc::new(GrainManager::new(
            world.dyn_store(),
            Arc::new(MockBackend::new(MockApp::default())),
            Arc::new(world.config.clone()),
        ));
        let slots: Slots<TokenId> = Mutex::new(HashMap::new());

        assert!(reserve(&slots, &token_id).is_none());
        assert!(reserve(&slots, &token_id).is_none());
        assert!(matches!(slots.lock().get(&token_id), Some(None)));

        let first = api_proxy(&world, &manager, &token_id);
        let second = api_proxy(&world, &manager, &token_id);
        let published = publish(&slots, &token_id, Arc::clone(&first), "revoked").unwrap();
        let raced = publish(&slots, &token_id, Arc::clone(&second), "revoked").unwrap();

        assert!(Arc::ptr_eq(&published, &first));
        assert!(Arc::ptr_eq(&raced, &first));
        assert!(second.is_closed());
        assert!(!first.is_closed());
        assert!(Arc::ptr_eq(&reserve(&slots, &token_id).unwrap(), &first));

        // A builder that failed after the slot was filled leaves it alone.
        abandon(&slots, &token_id);
        assert!(matches!(slots.lock().get(&token_id), Some(Some(_))));
    }

    #[test]
    fn test_removed_slots_refuse_publication() {
        let world = World::new();
        world.add_user("alice");
        let grain = world.add_grain("g", "alice", true);
        let (_, token_id) = world.webkey(&grain, "alice", viewer());
        let manager = Arc::new(GrainManager::new(
            world.dyn_store(),
            Arc::new(MockBackend::new(MockApp::default())),
            Arc::new(world.config.clone()),
        ));
        let slots: Slots<TokenId> = Mutex::new(HashMap::new());

        assert!(reserve(&slots, &token_id).is_none());
        abandon(&slots, &token_id);
        assert!(slots.lock().is_empty());

        let proxy = api_proxy(&world, &manager, &token_id);
        assert!(publish(&slots, &token_id, Arc::clone(&proxy), "revoked").is_err());
        assert!(proxy.is_closed());
    }
}
