//! Race-safe permission queries
//!
//! [`grain_permissions`] proves a principal's permissions optimistically: it
//! first proves them against everything in the store, then re-proves them
//! against only the grants that underpinned the first proof, with a watch on
//! those grants registered before they are re-read. If the two proofs agree
//! the answer is consistent with the watched grants, and any later change to
//! them fires the returned [`TokenWatch`].

use crate::context::Context;
use crate::vertex::Principal;
use grainhost_core::config::PermissionsConfig;
use grainhost_core::{PermissionSet, Result, Store, TokenWatch, ViewInfo};
use std::time::Instant;

/// Result of [`grain_permissions`]
#[derive(Debug)]
pub struct GrainPermissions {
    /// Proven permissions, or `None` if the principal cannot open the grain
    pub permissions: Option<PermissionSet>,
    /// Fires when a grant justifying `permissions` changes; dropping it cancels the watch
    pub watch: Option<TokenWatch>,
}

/// Whether the principal may open its grain at all
pub fn may_open_grain(store: &dyn Store, principal: &Principal) -> Result<bool> {
    let mut context = Context::new();
    let proven = context.try_to_prove(
        principal.grain_id(),
        &principal.vertex(),
        &PermissionSet::new(),
        Some(store),
    )?;
    Ok(proven.is_some())
}

/// Compute the permissions a principal holds on its grain.
///
/// With `watch` set, the result carries a [`TokenWatch`] over the grants the
/// proof depends on. Verification is retried up to
/// `config.max_verify_attempts` times when grants change mid-computation;
/// after that the last, possibly reduced, result is returned.
pub fn grain_permissions(
    store: &dyn Store,
    principal: &Principal,
    view_info: &ViewInfo,
    watch: bool,
    config: &PermissionsConfig,
) -> Result<GrainPermissions> {
    let started = Instant::now();
    let grain_id = principal.grain_id();
    let vertex = principal.vertex();
    let all_permissions = view_info.all_permissions();

    let mut permissions = None;
    let mut handle = None;
    for attempt in 1..=config.max_verify_attempts.max(1) {
        handle = None;

        let mut context = Context::new();
        let Some(first_phase) = context.try_to_prove(grain_id, &vertex, &all_permissions, Some(store))?
        else {
            log_elapsed(started, principal, config);
            return Ok(GrainPermissions {
                permissions: None,
                watch: None,
            });
        };

        let needed = context.responsible_tokens(grain_id, &vertex);
        if watch {
            handle = Some(store.watch_tokens(&needed));
        }

        context.reset();
        for token in store.live_tokens_by_ids(&needed)? {
            context.add_token(token)?;
        }
        permissions = context.try_to_prove(grain_id, &vertex, &first_phase, None)?;

        let confirmed = permissions
            .as_ref()
            .is_some_and(|verified| first_phase.is_subset_of(verified));
        let invalidated = handle.as_ref().is_some_and(TokenWatch::is_invalidated);
        if confirmed && !invalidated {
            break;
        }
        tracing::debug!(
            grain_id = %grain_id,
            vertex = %vertex,
            attempt,
            "grants changed during permission verification"
        );
    }

    log_elapsed(started, principal, config);
    if permissions.is_none() {
        handle = None;
    }
    Ok(GrainPermissions {
        permissions,
        watch: handle,
    })
}

fn log_elapsed(started: Instant, principal: &Principal, config: &PermissionsConfig) {
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    if elapsed_ms > config.slow_query_warning_ms {
        tracing::warn!(
            grain_id = %principal.grain_id(),
            vertex = %principal.vertex(),
            elapsed_ms,
            "grain_permissions was slow"
        );
    }
}
