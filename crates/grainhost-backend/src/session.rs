//! Opening and maintaining interactive sessions

use crate::manager::GrainManager;
use chrono::{DateTime, Duration, Utc};
use grainhost_core::identifiers::random_id;
use grainhost_core::records::denormalized_grain_metadata;
use grainhost_core::{
    now_millis, sha256_hex, AccountId, ApiToken, GrainId, GrainhostError, HostId, IdentityId,
    Result, RoleAssignment, Session, SessionId, Store, TokenId, TokenOwner, UserOwner,
};
use grainhost_permissions::{may_open_grain, validate_webkey, Principal};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A session ready to be served on its host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedSession {
    /// Session id, also the session cookie value
    pub session_id: SessionId,
    /// Per-session host label
    pub host_id: HostId,
    /// Grain the session is on
    pub grain_id: GrainId,
    /// Title to show for the grain, when known
    pub title: Option<String>,
    /// Salt to pass back on reconnect to reuse the session
    pub salt: String,
}

/// Outcome of redeeming a webkey
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebkeySession {
    /// The logged-in caller now holds the grain through their identity
    RedirectToGrain(GrainId),
    /// An anonymous or incognito session
    Opened(OpenedSession),
}

/// Session id derived from the grain, a salt and the account
pub fn generate_session_id(grain_id: &GrainId, account_id: Option<&AccountId>, salt: &str) -> SessionId {
    let mut input = format!("{grain_id}:{salt}");
    if let Some(account_id) = account_id {
        input.push(':');
        input.push_str(account_id.as_str());
    }
    SessionId::new(sha256_hex(input.as_bytes()))
}

/// Host label serving a session
pub fn host_id_for_session(session_id: &SessionId) -> HostId {
    let digest = sha256_hex(session_id.as_str().as_bytes());
    HostId::new(&digest[..32])
}

fn first_identity(store: &dyn Store, account_id: &AccountId) -> Result<IdentityId> {
    store
        .get_account(account_id)?
        .and_then(|account| account.identity_ids.into_iter().next())
        .ok_or_else(|| GrainhostError::permission_denied(format!("account {account_id} has no identity")))
}

/// Open a UI session for a logged-in account
pub async fn open_session(
    manager: &GrainManager,
    account_id: &AccountId,
    grain_id: &GrainId,
    cached_salt: Option<String>,
) -> Result<OpenedSession> {
    let store = manager.store().as_ref();
    let identity_id = first_identity(store, account_id)?;
    if !may_open_grain(store, &Principal::identity(grain_id.clone(), identity_id.clone()))? {
        return Err(GrainhostError::permission_denied(
            "user is not authorized to open this grain",
        ));
    }
    open_session_internal(
        manager,
        grain_id,
        Some((account_id, &identity_id)),
        None,
        None,
        cached_salt,
    )
    .await
}

/// Open a session through a webkey.
///
/// A logged-in, non-incognito caller who is neither the sharer nor the owner
/// receives a user-owned child grant with full access, so the grain shows up
/// under their identity, and is told to open the grain normally. Everyone else
/// gets a session bound to the webkey.
pub async fn open_session_from_api_token(
    manager: &GrainManager,
    caller: Option<&AccountId>,
    secret: &str,
    incognito: bool,
    cached_salt: Option<String>,
) -> Result<WebkeySession> {
    let store = manager.store().as_ref();
    let now = Utc::now();
    let hashed = TokenId::from_secret(secret);
    let token = validate_webkey(store, &hashed, None, now)?;
    let grain = store
        .get_grain(&token.grain_id)?
        .ok_or_else(|| GrainhostError::not_found(format!("grain {}", token.grain_id)))?;
    let title = shared_title(store, &grain.owner_identity, &grain.title, &token)?;

    if let (Some(account_id), false) = (caller, incognito) {
        let identity_id = first_identity(store, account_id)?;
        let is_sharer = token.identity_id.as_ref() == Some(&identity_id);
        let already_redeemed = store.tokens_for_grain(&grain.id)?.iter().any(|existing| {
            existing.parent_token.as_ref() == Some(&hashed)
                && existing.recipient_identity() == Some(&identity_id)
        });
        if !is_sharer && identity_id != grain.owner_identity && !already_redeemed {
            let package = store.get_package(&grain.package_id)?;
            let mut child = ApiToken::new(TokenId::new(random_id(22)), grain.id.clone(), now);
            child.identity_id = token.identity_id.clone();
            child.parent_token = Some(hashed.clone());
            child.role_assignment = RoleAssignment::all_access();
            child.petname = token.petname.clone();
            child.owner = TokenOwner::User(UserOwner {
                identity_id: identity_id.clone(),
                title: title.clone().unwrap_or_default(),
                denormalized_grain_metadata: Some(denormalized_grain_metadata(&grain, package.as_ref())),
                last_used: Some(now),
            });
            store.insert_token(child)?;
            tracing::debug!(grain_id = %grain.id, identity_id = %identity_id, "webkey redeemed into identity");
        }
        return Ok(WebkeySession::RedirectToGrain(grain.id));
    }

    if !may_open_grain(store, &Principal::token(&token))? {
        return Err(GrainhostError::permission_denied(
            "user is not authorized to open this grain",
        ));
    }
    open_session_internal(manager, &grain.id, None, title, Some(&token), cached_salt)
        .await
        .map(WebkeySession::Opened)
}

/// Title of a shared grain as the sharer named it
fn shared_title(
    store: &dyn Store,
    owner_identity: &IdentityId,
    grain_title: &str,
    token: &ApiToken,
) -> Result<Option<String>> {
    let Some(sharer) = &token.identity_id else {
        return Ok(None);
    };
    if sharer == owner_identity {
        return Ok(Some(grain_title.to_string()));
    }
    Ok(store
        .tokens_for_grain(&token.grain_id)?
        .into_iter()
        .find_map(|received| match received.owner {
            TokenOwner::User(user) if &user.identity_id == sharer => Some(user.title),
            _ => None,
        }))
}

async fn open_session_internal(
    manager: &GrainManager,
    grain_id: &GrainId,
    user: Option<(&AccountId, &IdentityId)>,
    title: Option<String>,
    api_token: Option<&ApiToken>,
    cached_salt: Option<String>,
) -> Result<OpenedSession> {
    // Start early so the grain is warming up during the client's round trip.
    manager.open_grain(grain_id, false).await?;
    manager
        .update_last_active(grain_id, user.map(|(a, _)| a), user.map(|(_, i)| i))
        .await?;

    let store = manager.store();
    let salt = cached_salt.unwrap_or_else(|| random_id(22));
    let session_id = generate_session_id(grain_id, user.map(|(a, _)| a), &salt);

    if let Some(existing) = store.get_session(&session_id)? {
        let identity_mismatch = existing
            .identity_id
            .as_ref()
            .is_some_and(|existing| Some(existing) != user.map(|(_, i)| i));
        if identity_mismatch || &existing.grain_id != grain_id {
            tracing::error!(session_id = %session_id, grain_id = %grain_id, "duplicate session id");
            return Err(GrainhostError::internal("duplicate session id"));
        }
        return Ok(OpenedSession {
            session_id,
            host_id: existing.host_id,
            grain_id: grain_id.clone(),
            title,
            salt,
        });
    }

    let host_id = host_id_for_session(&session_id);
    let session = Session {
        id: session_id.clone(),
        grain_id: grain_id.clone(),
        host_id: host_id.clone(),
        identity_id: user.map(|(_, i)| i.clone()),
        account_id: user.map(|(a, _)| a.clone()),
        hashed_token: match user {
            Some(_) => None,
            None => api_token.map(|token| token.id.clone()),
        },
        timestamp: now_millis(),
        has_loaded: false,
        view_info: None,
        permissions: None,
    };
    store.insert_session(session)?;
    tracing::debug!(session_id = %session_id, grain_id = %grain_id, "session opened");

    Ok(OpenedSession {
        session_id,
        host_id,
        grain_id: grain_id.clone(),
        title,
        salt,
    })
}

/// Refresh a session's timestamp and keep its grain running.
///
/// Returns `false` if the session no longer exists.
pub async fn keep_session_alive(manager: &GrainManager, session_id: &SessionId) -> Result<bool> {
    let now = now_millis();
    let Some(session) = manager
        .store()
        .update_session(session_id, &mut |session: &mut Session| session.timestamp = now)?
    else {
        return Ok(false);
    };

    manager
        .use_grain(&session.grain_id, |supervisor| async move { supervisor.keep_alive().await })
        .await?;
    manager
        .update_last_active(
            &session.grain_id,
            session.account_id.as_ref(),
            session.identity_id.as_ref(),
        )
        .await?;
    Ok(true)
}

/// Remove sessions whose last keep-alive is older than `idle_timeout`
pub fn gc_sessions(store: &dyn Store, now: DateTime<Utc>, idle_timeout: Duration) -> Result<Vec<Session>> {
    let cutoff = (now - idle_timeout).timestamp_millis();
    let removed = store.remove_sessions_where(&|session: &Session| session.timestamp < cutoff)?;
    if !removed.is_empty() {
        tracing::debug!(count = removed.len(), "collected idle sessions");
    }
    Ok(removed)
}

/// Periodically collect idle sessions
pub fn spawn_session_gc(store: Arc<dyn Store>, idle_timeout: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(idle_timeout);
        let timeout = Duration::from_std(idle_timeout).unwrap_or_else(|_| Duration::days(365));
        loop {
            interval.tick().await;
            if let Err(err) = gc_sessions(store.as_ref(), Utc::now(), timeout) {
                tracing::error!(error = %err, "session collection failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_stable_hex() {
        let grain = GrainId::new("g");
        let account = AccountId::new("a");
        let id = generate_session_id(&grain, Some(&account), "salt");
        assert_eq!(id, generate_session_id(&grain, Some(&account), "salt"));
        assert_ne!(id, generate_session_id(&grain, None, "salt"));
        assert_eq!(id.as_str().len(), 64);
        assert_eq!(host_id_for_session(&id).as_str().len(), 32);
    }

    #[test]
    fn test_session_id_input_layout() {
        let id = generate_session_id(&GrainId::new("g"), None, "s");
        assert_eq!(id.as_str(), sha256_hex(b"g:s"));
        let id = generate_session_id(&GrainId::new("g"), Some(&AccountId::new("a")), "s");
        assert_eq!(id.as_str(), sha256_hex(b"g:s:a"));
    }
}
