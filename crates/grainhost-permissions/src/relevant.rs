//! Relevant-token selection
//!
//! Bounds the grants a resolution considers to those lying on some path from
//! the grain owner to the target vertex. The graph is walked twice: backwards
//! from the target collecting every edge that might feed it, then forwards
//! from the owner's identities using only the edges found on the way back.
//!
//! Membrane requirements are ignored here. A grant whose requirements can
//! never hold may still be selected; the forward-chaining pass is what decides
//! whether it carries anything.

use crate::context::Context;
use crate::vertex::Vertex;
use grainhost_core::{ApiToken, GrainId, RoleAssignment, TokenId};
use std::collections::{BTreeMap, BTreeSet};

/// Implicit grant from the owner's account to a vertex
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerEdge {
    /// Receiving vertex
    pub vertex: Vertex,
    /// Role it receives
    pub role: RoleAssignment,
}

/// Output of [`compute_relevant_tokens`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelevantTokens {
    /// Grants on some owner-to-target path
    pub token_ids: Vec<TokenId>,
    /// Implicit owner grants discovered on the way
    pub owner_edges: Vec<OwnerEdge>,
}

/// Select the cached grants that could carry `grain_id` permissions to `target`.
///
/// Makes no store lookups: grants not cached in `context` are treated as
/// absent.
pub fn compute_relevant_tokens(context: &Context, grain_id: &GrainId, target: &Vertex) -> RelevantTokens {
    let Some(grain) = context.grain(grain_id) else {
        return RelevantTokens::default();
    };
    let owner_identities = context.owner_identities_of(grain);

    let mut owner_edges = Vec::new();
    let mut tokens_by_sharer: BTreeMap<Vertex, BTreeMap<TokenId, Vertex>> = BTreeMap::new();
    let mut visited: BTreeSet<Vertex> = BTreeSet::from([target.clone()]);
    let mut stack = vec![target.clone()];

    while let Some(vertex) = stack.pop() {
        let incoming: Vec<&ApiToken> = match &vertex {
            Vertex::Owner => Vec::new(),
            Vertex::Token(token_id) => context
                .token(token_id)
                .filter(|token| &token.grain_id == grain_id)
                .into_iter()
                .collect(),
            Vertex::Identity(identity_id) if owner_identities.contains(identity_id) => {
                owner_edges.push(OwnerEdge {
                    vertex: vertex.clone(),
                    role: RoleAssignment::all_access(),
                });
                Vec::new()
            }
            Vertex::Identity(_) | Vertex::Anonymous if !grain.private => {
                // Legacy public grain: anyone who knows the id gets the default role.
                owner_edges.push(OwnerEdge {
                    vertex: vertex.clone(),
                    role: RoleAssignment::none(),
                });
                Vec::new()
            }
            Vertex::Identity(identity_id) => context.tokens_received_by(grain_id, identity_id),
            Vertex::Anonymous => Vec::new(),
        };

        for token in incoming {
            let Ok(sharer) = Vertex::sharer_of(token) else {
                continue;
            };
            tokens_by_sharer
                .entry(sharer.clone())
                .or_default()
                .insert(token.id.clone(), Vertex::recipient_of(token));
            if visited.insert(sharer.clone()) {
                stack.push(sharer);
            }
        }
    }

    // Forward from the owner's identities only. On a legacy public grain the
    // default-role edges reach their vertex directly, but grants issued by
    // those vertices are not on any path from the owner.
    let mut relevant = BTreeSet::new();
    let mut seen: BTreeSet<Vertex> = owner_identities
        .iter()
        .map(|identity_id| Vertex::Identity(identity_id.clone()))
        .collect();
    let mut stack: Vec<Vertex> = seen.iter().cloned().collect();
    while let Some(sharer) = stack.pop() {
        let Some(tokens) = tokens_by_sharer.get(&sharer) else {
            continue;
        };
        for (token_id, recipient) in tokens {
            relevant.insert(token_id.clone());
            if seen.insert(recipient.clone()) {
                stack.push(recipient.clone());
            }
        }
    }

    RelevantTokens {
        token_ids: relevant.into_iter().collect(),
        owner_edges,
    }
}
