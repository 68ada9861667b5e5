//! Forward-chaining permission resolver
//!
//! Permission flow is framed as propositional Horn-SAT. There is one boolean
//! [`Variable`] per `(grain, vertex, permission)` triple, where the permission
//! is either the implicit "can access at all" bit or one app-defined bit. All
//! variables start false and are only set true when an edge of the sharing
//! graph forces it, so each is set at most once and the computation reaches
//! the minimal model.
//!
//! Variables live in an arena indexed by [`VarIdx`]; grants refer to the
//! variables they wait on through per-variable tail lists of grant ids, never
//! through references.
//!
//! A [`Context`] caches the grains and grants it has loaded. It only touches
//! the store from [`Context::try_to_prove`] when a store is supplied, and then
//! only for grains named by outstanding work.

use crate::relevant::{compute_relevant_tokens, OwnerEdge};
use crate::requirements::RequirementSet;
use crate::vertex::Vertex;
use grainhost_core::{
    AccountId, ApiToken, Grain, GrainId, GrainhostError, IdentityId, MembraneRequirement,
    PermissionSet, Result, Store, TokenId,
};
use std::collections::{BTreeSet, HashMap};
use std::mem;

/// One permission on one vertex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PermissionId {
    /// Access to the grain at all
    CanAccess,
    /// App-defined permission bit
    AppDefined(usize),
}

/// `CanAccess` followed by every bit set in `permissions`
pub fn permission_ids(permissions: &PermissionSet) -> impl Iterator<Item = PermissionId> + '_ {
    std::iter::once(PermissionId::CanAccess).chain(permissions.iter().map(PermissionId::AppDefined))
}

/// Index of a variable in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct VarIdx(usize);

#[derive(Debug, Default)]
struct Variable {
    value: bool,
    /// Grant whose edge set this variable, absent for owner edges
    responsible_token: Option<TokenId>,
    /// Grants whose edge fires once this variable is true
    direct_tail: Vec<TokenId>,
    /// Grants with a requirement satisfied once this variable is true
    requirements_tail: Vec<TokenId>,
}

#[derive(Debug, Default)]
struct VertexVariables {
    can_access: Option<VarIdx>,
    app_defined: Vec<VarIdx>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermissionStatus {
    /// Carried, not yet proven at the sharer
    Unmet,
    /// Carried and proven at the sharer
    Met,
    /// Not carried by this grant
    DoesNotCarry,
}

/// A grant admitted into the current computation
#[derive(Debug)]
struct ActiveToken {
    unmet_requirements: usize,
    can_access: PermissionStatus,
    app_defined: Vec<PermissionStatus>,
}

impl ActiveToken {
    fn new(unmet_requirements: usize, carried: &PermissionSet) -> Self {
        let app_defined = carried
            .as_slice()
            .iter()
            .map(|bit| {
                if *bit {
                    PermissionStatus::Unmet
                } else {
                    PermissionStatus::DoesNotCarry
                }
            })
            .collect();
        Self {
            unmet_requirements,
            can_access: PermissionStatus::Unmet,
            app_defined,
        }
    }

    fn requirements_met(&self) -> bool {
        self.unmet_requirements == 0
    }

    fn decrement_requirements(&mut self) {
        self.unmet_requirements = self.unmet_requirements.saturating_sub(1);
    }

    fn mark_met(&mut self, permission: PermissionId) {
        match permission {
            PermissionId::CanAccess => self.can_access = PermissionStatus::Met,
            PermissionId::AppDefined(index) => {
                if let Some(status) = self.app_defined.get_mut(index) {
                    *status = PermissionStatus::Met;
                }
            }
        }
    }

    fn statuses(&self) -> impl Iterator<Item = (PermissionId, PermissionStatus)> + '_ {
        std::iter::once((PermissionId::CanAccess, self.can_access)).chain(
            self.app_defined
                .iter()
                .enumerate()
                .map(|(index, status)| (PermissionId::AppDefined(index), *status)),
        )
    }
}

#[derive(Debug)]
struct Pending {
    grain_id: GrainId,
    vertex: Vertex,
    permission: PermissionId,
    responsible_token: Option<TokenId>,
}

/// An ongoing permission computation together with its cached store state
#[derive(Debug, Default)]
pub struct Context {
    grains: HashMap<GrainId, Grain>,
    owner_identities: HashMap<AccountId, Vec<IdentityId>>,
    tokens_by_id: HashMap<TokenId, ApiToken>,
    tokens_by_recipient: HashMap<(GrainId, IdentityId), Vec<TokenId>>,

    variables: Vec<Variable>,
    vertices: HashMap<(GrainId, Vertex), VertexVariables>,
    active_tokens: HashMap<TokenId, ActiveToken>,
    pending: Vec<Pending>,
    unmet_requirements: RequirementSet,
}

impl Context {
    /// A context with nothing loaded
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget grants and derived facts, keeping loaded grains and owner identities
    pub fn reset(&mut self) {
        self.tokens_by_id.clear();
        self.tokens_by_recipient.clear();
        self.variables.clear();
        self.vertices.clear();
        self.active_tokens.clear();
        self.pending.clear();
        self.unmet_requirements = RequirementSet::new();
    }

    /// Cache a grant without activating it
    pub fn add_token(&mut self, token: ApiToken) -> Result<()> {
        if self.tokens_by_id.contains_key(&token.id) {
            return Ok(());
        }
        // Reject edges without a source before they enter the graph.
        Vertex::sharer_of(&token)?;

        if let Some(recipient) = token.recipient_identity() {
            self.tokens_by_recipient
                .entry((token.grain_id.clone(), recipient.clone()))
                .or_default()
                .push(token.id.clone());
        }
        self.tokens_by_id.insert(token.id.clone(), token);
        Ok(())
    }

    /// Load grains, their owners' identities and their live grants
    pub fn add_grains(&mut self, store: &dyn Store, grain_ids: &[GrainId]) -> Result<()> {
        for grain_id in grain_ids {
            let Some(grain) = store.get_grain(grain_id)? else {
                continue;
            };
            if !self.owner_identities.contains_key(&grain.owner_account) {
                let identities = store
                    .get_account(&grain.owner_account)?
                    .map(|account| account.identity_ids)
                    .unwrap_or_default();
                self.owner_identities
                    .insert(grain.owner_account.clone(), identities);
            }
            let identities = self
                .owner_identities
                .entry(grain.owner_account.clone())
                .or_default();
            if !identities.contains(&grain.owner_identity) {
                identities.push(grain.owner_identity.clone());
            }
            self.grains.insert(grain_id.clone(), grain);
        }

        let tokens = store.live_tokens_for_grains(grain_ids)?;
        tracing::debug!(
            grains = grain_ids.len(),
            tokens = tokens.len(),
            "loaded grains into permission context"
        );
        for token in tokens {
            self.add_token(token)?;
        }
        Ok(())
    }

    pub(crate) fn grain(&self, grain_id: &GrainId) -> Option<&Grain> {
        self.grains.get(grain_id)
    }

    pub(crate) fn owner_identities_of<'a>(&'a self, grain: &'a Grain) -> &'a [IdentityId] {
        self.owner_identities
            .get(&grain.owner_account)
            .map(Vec::as_slice)
            .unwrap_or(std::slice::from_ref(&grain.owner_identity))
    }

    pub(crate) fn token(&self, token_id: &TokenId) -> Option<&ApiToken> {
        self.tokens_by_id.get(token_id)
    }

    pub(crate) fn tokens_received_by(&self, grain_id: &GrainId, identity_id: &IdentityId) -> Vec<&ApiToken> {
        self.tokens_by_recipient
            .get(&(grain_id.clone(), identity_id.clone()))
            .map(|ids| ids.iter().filter_map(|id| self.tokens_by_id.get(id)).collect())
            .unwrap_or_default()
    }

    fn variable(&mut self, grain_id: &GrainId, vertex: &Vertex, permission: PermissionId) -> VarIdx {
        let key = (grain_id.clone(), vertex.clone());
        let variables = &mut self.variables;
        let slots = self.vertices.entry(key).or_default();
        match permission {
            PermissionId::CanAccess => *slots.can_access.get_or_insert_with(|| {
                variables.push(Variable::default());
                VarIdx(variables.len() - 1)
            }),
            PermissionId::AppDefined(index) => {
                while slots.app_defined.len() <= index {
                    variables.push(Variable::default());
                    slots.app_defined.push(VarIdx(variables.len() - 1));
                }
                slots.app_defined[index]
            }
        }
    }

    fn is_true(&mut self, grain_id: &GrainId, vertex: &Vertex, permission: PermissionId) -> bool {
        let idx = self.variable(grain_id, vertex, permission);
        self.variables[idx.0].value
    }

    /// Permissions already proven for a vertex, or `None` if it cannot even access the grain
    pub fn permissions(&self, grain_id: &GrainId, vertex: &Vertex) -> Option<PermissionSet> {
        let slots = self.vertices.get(&(grain_id.clone(), vertex.clone()))?;
        let can_access = slots.can_access?;
        if !self.variables[can_access.0].value {
            return None;
        }
        Some(PermissionSet::from(
            slots
                .app_defined
                .iter()
                .map(|idx| self.variables[idx.0].value)
                .collect::<Vec<bool>>(),
        ))
    }

    fn activate_owner_edges(&mut self, grain_id: &GrainId, edges: Vec<OwnerEdge>) {
        let Some(grain) = self.grains.get(grain_id) else {
            return;
        };
        let view_info = grain.view_info();
        for edge in edges {
            let permissions = PermissionSet::from_role_assignment(&edge.role, &view_info);
            for permission in permission_ids(&permissions) {
                self.pending.push(Pending {
                    grain_id: grain_id.clone(),
                    vertex: edge.vertex.clone(),
                    permission,
                    responsible_token: None,
                });
            }
        }
    }

    /// Admit a cached grant into the computation. Returns false if it was already active.
    fn activate_token(&mut self, token_id: &TokenId) -> Result<bool> {
        if self.active_tokens.contains_key(token_id) {
            return Ok(false);
        }

        let token = self
            .tokens_by_id
            .get(token_id)
            .cloned()
            .ok_or_else(|| GrainhostError::internal(format!("token {token_id} is not loaded")))?;
        let view_info = self
            .grains
            .get(&token.grain_id)
            .ok_or_else(|| {
                GrainhostError::internal(format!("grain {} of token {token_id} is not loaded", token.grain_id))
            })?
            .view_info();
        let carried = PermissionSet::from_role_assignment(&token.role_assignment, &view_info);
        let sharer = Vertex::sharer_of(&token)?;
        let recipient = Vertex::recipient_of(&token);

        let mut unmet_requirements = 0;
        for requirement in &token.requirements {
            match requirement {
                MembraneRequirement::PermissionsHeld {
                    grain_id,
                    identity_id,
                    permissions,
                } => {
                    let vertex = Vertex::Identity(identity_id.clone());
                    for permission in permission_ids(permissions) {
                        let idx = self.variable(grain_id, &vertex, permission);
                        let variable = &mut self.variables[idx.0];
                        if !variable.value {
                            unmet_requirements += 1;
                            variable.requirements_tail.push(token_id.clone());
                        }
                    }
                }
            }
        }

        let mut active = ActiveToken::new(unmet_requirements, &carried);
        let carried_ids: Vec<PermissionId> = active
            .statuses()
            .filter(|(_, status)| *status != PermissionStatus::DoesNotCarry)
            .map(|(permission, _)| permission)
            .collect();

        let mut need_to_explore_unmet = false;
        for permission in carried_ids {
            if self.is_true(&token.grain_id, &recipient, permission) {
                continue;
            }
            let sharer_idx = self.variable(&token.grain_id, &sharer, permission);
            if !self.variables[sharer_idx.0].value {
                self.variables[sharer_idx.0]
                    .direct_tail
                    .push(token_id.clone());
            } else {
                active.mark_met(permission);
                if unmet_requirements == 0 {
                    self.pending.push(Pending {
                        grain_id: token.grain_id.clone(),
                        vertex: recipient.clone(),
                        permission,
                        responsible_token: Some(token_id.clone()),
                    });
                } else {
                    need_to_explore_unmet = true;
                }
            }
        }

        if need_to_explore_unmet {
            self.unmet_requirements
                .add_requirements(&token.requirements);
        }
        self.active_tokens.insert(token_id.clone(), active);
        Ok(true)
    }

    /// Drain the pending stack to a fixpoint and report the vertex's proven permissions
    fn run_forward_chaining(
        &mut self,
        grain_id: &GrainId,
        vertex: &Vertex,
        wanted: &PermissionSet,
    ) -> Result<Option<PermissionSet>> {
        if let Some(last) = wanted.len().checked_sub(1) {
            // Give the result a full-length vector even where bits stay false.
            self.variable(grain_id, vertex, PermissionId::AppDefined(last));
        }

        while let Some(current) = self.pending.pop() {
            let idx = self.variable(&current.grain_id, &current.vertex, current.permission);
            let variable = &mut self.variables[idx.0];
            if variable.value {
                continue;
            }
            variable.value = true;
            variable.responsible_token = current.responsible_token.clone();
            let direct_tail = mem::take(&mut variable.direct_tail);
            let requirements_tail = mem::take(&mut variable.requirements_tail);

            for token_id in direct_tail {
                let (active, token) =
                    active_entry(&mut self.active_tokens, &self.tokens_by_id, &token_id)?;
                active.mark_met(current.permission);
                if active.requirements_met() {
                    self.pending.push(Pending {
                        grain_id: token.grain_id.clone(),
                        vertex: Vertex::recipient_of(token),
                        permission: current.permission,
                        responsible_token: Some(token_id),
                    });
                } else {
                    self.unmet_requirements
                        .add_requirements(&token.requirements);
                }
            }

            for token_id in requirements_tail {
                let (active, token) =
                    active_entry(&mut self.active_tokens, &self.tokens_by_id, &token_id)?;
                active.decrement_requirements();
                if active.requirements_met() {
                    let recipient = Vertex::recipient_of(token);
                    for (permission, status) in active.statuses() {
                        if status == PermissionStatus::Met {
                            self.pending.push(Pending {
                                grain_id: token.grain_id.clone(),
                                vertex: recipient.clone(),
                                permission,
                                responsible_token: Some(token_id.clone()),
                            });
                        }
                    }
                }
            }
        }

        Ok(self.permissions(grain_id, vertex))
    }

    /// Activate the grants that may carry permissions to the vertex.
    /// Returns whether more computation might make progress.
    fn activate_relevant_tokens(&mut self, grain_id: &GrainId, vertex: &Vertex) -> Result<bool> {
        let relevant = compute_relevant_tokens(self, grain_id, vertex);
        let mut progress = !relevant.owner_edges.is_empty();
        self.activate_owner_edges(grain_id, relevant.owner_edges);
        for token_id in &relevant.token_ids {
            if self.activate_token(token_id)? {
                progress = true;
            }
        }
        Ok(progress)
    }

    fn process_unmet_requirements(&mut self, store: Option<&dyn Store>) -> Result<bool> {
        if let Some(store) = store {
            let missing: Vec<GrainId> = self
                .unmet_requirements
                .grain_ids()
                .into_iter()
                .filter(|grain_id| !self.grains.contains_key(grain_id))
                .collect();
            if !missing.is_empty() {
                self.add_grains(store, &missing)?;
            }
        }

        let mut progress = false;
        while let Some((grain_id, identity_id, _)) = self.unmet_requirements.pop() {
            if self.activate_relevant_tokens(&grain_id, &Vertex::Identity(identity_id))? {
                progress = true;
            }
        }
        Ok(progress)
    }

    /// Try to prove that `vertex` holds `wanted` on `grain_id`.
    ///
    /// Returns the permissions proven, which may be a strict subset of
    /// `wanted`, or `None` if the vertex cannot access the grain at all. With
    /// no store only already-cached grains and grants are considered.
    pub fn try_to_prove(
        &mut self,
        grain_id: &GrainId,
        vertex: &Vertex,
        wanted: &PermissionSet,
        store: Option<&dyn Store>,
    ) -> Result<Option<PermissionSet>> {
        if let Some(store) = store {
            self.add_grains(store, std::slice::from_ref(grain_id))?;
        }

        self.activate_relevant_tokens(grain_id, vertex)?;
        loop {
            let result = self.run_forward_chaining(grain_id, vertex, wanted)?;
            if result
                .as_ref()
                .is_some_and(|proven| wanted.is_subset_of(proven))
            {
                return Ok(result);
            }
            if !self.process_unmet_requirements(store)? {
                return Ok(result);
            }
        }
    }

    /// Grants underpinning the permissions already proven for a vertex.
    ///
    /// Walks back along each proven fact's responsible grant, including the
    /// grants that proved that grant's membrane requirements.
    pub fn responsible_tokens(&mut self, grain_id: &GrainId, vertex: &Vertex) -> Vec<TokenId> {
        let Some(proven) = self.permissions(grain_id, vertex) else {
            return Vec::new();
        };

        let mut stack: Vec<(GrainId, Vertex, PermissionId)> = permission_ids(&proven)
            .map(|permission| (grain_id.clone(), vertex.clone(), permission))
            .collect();
        let mut visited: BTreeSet<(GrainId, Vertex, PermissionId)> = stack.iter().cloned().collect();
        let mut needed: BTreeSet<TokenId> = BTreeSet::new();

        while let Some((grain, at, permission)) = stack.pop() {
            let idx = self.variable(&grain, &at, permission);
            let Some(token_id) = self.variables[idx.0].responsible_token.clone() else {
                continue;
            };
            let Some(token) = self.tokens_by_id.get(&token_id) else {
                continue;
            };

            let mut next = Vec::new();
            if let Ok(sharer) = Vertex::sharer_of(token) {
                next.push((token.grain_id.clone(), sharer, permission));
            }
            if needed.insert(token_id.clone()) {
                for requirement in &token.requirements {
                    match requirement {
                        MembraneRequirement::PermissionsHeld {
                            grain_id,
                            identity_id,
                            permissions,
                        } => {
                            let vertex = Vertex::Identity(identity_id.clone());
                            for permission in permission_ids(permissions) {
                                next.push((grain_id.clone(), vertex.clone(), permission));
                            }
                        }
                    }
                }
            }

            for entry in next {
                if visited.insert(entry.clone()) {
                    stack.push(entry);
                }
            }
        }

        needed.into_iter().collect()
    }
}

fn active_entry<'a>(
    active_tokens: &'a mut HashMap<TokenId, ActiveToken>,
    tokens_by_id: &'a HashMap<TokenId, ApiToken>,
    token_id: &TokenId,
) -> Result<(&'a mut ActiveToken, &'a ApiToken)> {
    let active = active_tokens
        .get_mut(token_id)
        .ok_or_else(|| GrainhostError::internal(format!("token {token_id} is not active")))?;
    let token = tokens_by_id
        .get(token_id)
        .ok_or_else(|| GrainhostError::internal(format!("token {token_id} is not loaded")))?;
    Ok((active, token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use grainhost_core::store::{GrainStore, TokenStore};
    use grainhost_core::{
        Account, AppId, MemoryStore, PackageId, PermissionDef, RoleAssignment, RoleDef,
        TokenOwner, UserOwner, ViewInfo,
    };

    fn view_info() -> ViewInfo {
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

    fn store_with_grain(private: bool) -> MemoryStore {
        let store = MemoryStore::new();
        store
            .put_account(Account::new(
                AccountId::new("owner-account"),
                vec![IdentityId::new("owner")],
            ))
            .unwrap();
        store
            .put_grain(Grain {
                id: GrainId::new("g"),
                owner_account: AccountId::new("owner-account"),
                owner_identity: IdentityId::new("owner"),
                private,
                cached_view_info: Some(view_info()),
                package_id: PackageId::new("pkg"),
                app_id: AppId::new("app"),
                title: "Notes".into(),
                last_used: None,
            })
            .unwrap();
        store
    }

    fn share(store: &MemoryStore, id: &str, from: &str, to: &str, role: RoleAssignment) {
        let mut token = ApiToken::new(TokenId::new(id), GrainId::new("g"), Utc::now());
        token.identity_id = Some(IdentityId::new(from));
        token.role_assignment = role;
        token.owner = TokenOwner::User(UserOwner {
            identity_id: IdentityId::new(to),
            title: String::new(),
            denormalized_grain_metadata: None,
            last_used: None,
        });
        store.insert_token(token).unwrap();
    }

    #[test]
    fn test_owner_holds_everything() {
        let store = store_with_grain(true);
        let mut context = Context::new();
        let proven = context
            .try_to_prove(
                &GrainId::new("g"),
                &Vertex::Identity("owner".into()),
                &PermissionSet::full(2),
                Some(&store),
            )
            .unwrap();
        assert_eq!(proven, Some(PermissionSet::full(2)));
        assert!(context
            .responsible_tokens(&GrainId::new("g"), &Vertex::Identity("owner".into()))
            .is_empty());
    }

    #[test]
    fn test_stranger_denied_on_private_grain() {
        let store = store_with_grain(true);
        let mut context = Context::new();
        let proven = context
            .try_to_prove(
                &GrainId::new("g"),
                &Vertex::Identity("stranger".into()),
                &PermissionSet::new(),
                Some(&store),
            )
            .unwrap();
        assert_eq!(proven, None);
    }

    #[test]
    fn test_public_grain_grants_default_role() {
        let store = store_with_grain(false);
        let mut context = Context::new();
        let proven = context
            .try_to_prove(
                &GrainId::new("g"),
                &Vertex::Anonymous,
                &PermissionSet::full(2),
                Some(&store),
            )
            .unwrap();
        assert_eq!(proven, Some(PermissionSet::from_indices([0])));
    }

    #[test]
    fn test_share_and_responsible_tokens() {
        let store = store_with_grain(true);
        share(&store, "t1", "owner", "alice", RoleAssignment::role(1));
        let mut context = Context::new();
        let vertex = Vertex::Identity("alice".into());
        let proven = context
            .try_to_prove(&GrainId::new("g"), &vertex, &PermissionSet::full(2), Some(&store))
            .unwrap();
        assert_eq!(proven, Some(PermissionSet::from_indices([0])));
        assert_eq!(
            context.responsible_tokens(&GrainId::new("g"), &vertex),
            vec![TokenId::new("t1")]
        );
    }

    #[test]
    fn test_repeat_proof_is_stable() {
        let store = store_with_grain(true);
        share(&store, "t1", "owner", "alice", RoleAssignment::role(0));
        let vertex = Vertex::Identity("alice".into());
        let mut context = Context::new();
        let first = context
            .try_to_prove(&GrainId::new("g"), &vertex, &PermissionSet::full(2), Some(&store))
            .unwrap();
        let second = context
            .try_to_prove(&GrainId::new("g"), &vertex, &PermissionSet::full(2), Some(&store))
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first, Some(PermissionSet::full(2)));
    }

    #[test]
    fn test_token_without_sharer_rejected() {
        let mut context = Context::new();
        let token = ApiToken::new(TokenId::new("orphan"), GrainId::new("g"), Utc::now());
        assert!(matches!(
            context.add_token(token),
            Err(GrainhostError::Invalid { .. })
        ));
    }
}
