//! Bearer webkey redemption checks

use chrono::{DateTime, Utc};
use grainhost_core::{ApiToken, GrainhostError, Result, Store, TokenId, TokenOwner};

/// Check that `token_id` names a usable UiView webkey.
///
/// A self-destructing webkey that is still valid has its `expiresIfUnused`
/// pushed back to `refreshed_expiration`, or cleared when none is given,
/// since it is now in use. Returns the grant as stored after that update.
pub fn validate_webkey(
    store: &dyn Store,
    token_id: &TokenId,
    refreshed_expiration: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<ApiToken> {
    let mut token = store
        .get_token(token_id)?
        .ok_or_else(|| GrainhostError::permission_denied("invalid authorization token"))?;

    if token.revoked {
        return Err(GrainhostError::revoked("authorization token has been revoked"));
    }
    if !matches!(token.owner, TokenOwner::Webkey) {
        return Err(GrainhostError::permission_denied(
            "unauthorized to open non-webkey token",
        ));
    }
    if token.is_expired(now) {
        return Err(GrainhostError::expired("authorization token expired"));
    }

    if let Some(expires_if_unused) = token.expires_if_unused {
        if expires_if_unused <= now {
            return Err(GrainhostError::expired("authorization token expired"));
        }
        if let Some(updated) = store.update_token(token_id, &mut |stored: &mut ApiToken| {
            stored.expires_if_unused = refreshed_expiration;
        })? {
            token = updated;
        }
    }

    if !token.is_ui_view() {
        return Err(GrainhostError::permission_denied(
            "token refers to a non-UiView capability",
        ));
    }
    Ok(token)
}

/// Delete self-destructing grants whose redemption window has passed.
/// Returns how many were removed.
pub fn cleanup_self_destructing(store: &dyn Store, now: DateTime<Utc>) -> Result<usize> {
    let removed = store.remove_tokens_where(&|token: &ApiToken| {
        token
            .expires_if_unused
            .is_some_and(|expires| expires < now)
    })?;
    if !removed.is_empty() {
        tracing::debug!(count = removed.len(), "removed unused self-destructing grants");
    }
    Ok(removed.len())
}
