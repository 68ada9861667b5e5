//! Revocation cascade

use crate::vertex::Principal;
use grainhost_core::{ApiToken, GrainId, IdentityId, Result, Store, TokenId};
use std::collections::{BTreeMap, BTreeSet};

/// Every live grant derived from `root` on its grain.
///
/// Follows chain-parent edges and re-shares by identities that received a
/// derived grant. Attenuation and membrane requirements are not considered.
/// Grains that are missing or legacy-public have no meaningful downstream set
/// and yield nothing; so does an anonymous root.
pub fn downstream_tokens(store: &dyn Store, root: &Principal) -> Result<Vec<ApiToken>> {
    match root {
        Principal::Token { token_id, grain_id } => {
            let recipient = store
                .get_token(token_id)?
                .and_then(|token| token.recipient_identity().cloned());
            traverse(store, grain_id, Some(token_id), recipient.as_ref())
        }
        Principal::Identity {
            grain_id,
            identity_id: Some(identity_id),
        } => traverse(store, grain_id, None, Some(identity_id)),
        Principal::Identity {
            identity_id: None, ..
        } => Ok(Vec::new()),
    }
}

/// Like [`downstream_tokens`] for a grant record that may already be deleted
pub fn downstream_of_grant(store: &dyn Store, grant: &ApiToken) -> Result<Vec<ApiToken>> {
    traverse(store, &grant.grain_id, Some(&grant.id), grant.recipient_identity())
}

fn traverse(
    store: &dyn Store,
    grain_id: &GrainId,
    root_token: Option<&TokenId>,
    root_sharer: Option<&IdentityId>,
) -> Result<Vec<ApiToken>> {
    match store.get_grain(grain_id)? {
        Some(grain) if grain.private => {}
        _ => return Ok(Vec::new()),
    }

    let mut by_parent: BTreeMap<TokenId, Vec<ApiToken>> = BTreeMap::new();
    let mut by_sharer: BTreeMap<IdentityId, Vec<ApiToken>> = BTreeMap::new();
    for token in store.tokens_for_grain(grain_id)? {
        if token.revoked {
            continue;
        }
        if let Some(parent) = &token.parent_token {
            by_parent.entry(parent.clone()).or_default().push(token);
        } else if let Some(identity_id) = &token.identity_id {
            by_sharer.entry(identity_id.clone()).or_default().push(token);
        }
    }

    let mut stacked: BTreeSet<TokenId> = BTreeSet::new();
    if let Some(root) = root_token {
        stacked.insert(root.clone());
    }
    let mut stack: Vec<ApiToken> = Vec::new();
    let mut push_all = |tokens: Option<&Vec<ApiToken>>, stack: &mut Vec<ApiToken>| {
        for token in tokens.into_iter().flatten() {
            if stacked.insert(token.id.clone()) {
                stack.push(token.clone());
            }
        }
    };

    if let Some(root) = root_token {
        push_all(by_parent.get(root), &mut stack);
    }
    if let Some(sharer) = root_sharer {
        push_all(by_sharer.get(sharer), &mut stack);
    }

    let mut result = Vec::new();
    while let Some(token) = stack.pop() {
        push_all(by_parent.get(&token.id), &mut stack);
        if let Some(recipient) = token.recipient_identity() {
            push_all(by_sharer.get(recipient), &mut stack);
        }
        result.push(token);
    }
    Ok(result)
}
