//! Conjunctions of membrane requirements

use grainhost_core::{GrainId, IdentityId, MembraneRequirement, PermissionSet};
use std::collections::BTreeMap;

/// Permissions that must be held, keyed by `(grain, identity)`
///
/// Used by the resolver to remember requirements it has not proven yet. It
/// may overestimate: an entry proven after insertion is harmless.
#[derive(Debug, Clone, Default)]
pub struct RequirementSet {
    held: BTreeMap<(GrainId, IdentityId), PermissionSet>,
}

impl RequirementSet {
    /// An empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// No requirement remains
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Fold a grant's requirements into the set
    pub fn add_requirements(&mut self, requirements: &[MembraneRequirement]) {
        for requirement in requirements {
            match requirement {
                MembraneRequirement::PermissionsHeld {
                    grain_id,
                    identity_id,
                    permissions,
                } => {
                    self.held
                        .entry((grain_id.clone(), identity_id.clone()))
                        .or_default()
                        .add(permissions);
                }
            }
        }
    }

    /// Distinct grains mentioned
    pub fn grain_ids(&self) -> Vec<GrainId> {
        let mut ids: Vec<GrainId> = self.held.keys().map(|(grain, _)| grain.clone()).collect();
        ids.dedup();
        ids
    }

    /// Remove and return one entry
    pub fn pop(&mut self) -> Option<(GrainId, IdentityId, PermissionSet)> {
        let key = self.held.keys().next().cloned()?;
        let permissions = self.held.remove(&key)?;
        Some((key.0, key.1, permissions))
    }
}
