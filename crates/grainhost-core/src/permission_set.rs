//! Boolean permission vectors
//!
//! A [`PermissionSet`] is indexed by the permission bits a grain's
//! [`ViewInfo`] declares. Permissions are independent: "write" without "read"
//! is a valid set. Roles are only aliases for sets of bits.
//!
//! Every operation is total over sets of different lengths; an index past the
//! end of a vector reads as `false`. The mutating combinators report whether
//! any bit changed so the resolver can skip redundant work.

use crate::view_info::{RoleAssignment, RoleBase, ViewInfo};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Set of app-defined permission bits
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet {
    bits: Vec<bool>,
}

impl PermissionSet {
    /// The empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// A set of `len` bits, all cleared
    pub fn with_len(len: usize) -> Self {
        Self {
            bits: vec![false; len],
        }
    }

    /// A set of `len` bits, all set
    pub fn full(len: usize) -> Self {
        Self {
            bits: vec![true; len],
        }
    }

    /// Build a set with exactly the given bit indices set
    pub fn from_indices(indices: impl IntoIterator<Item = usize>) -> Self {
        let mut set = Self::new();
        for index in indices {
            set.insert(index);
        }
        set
    }

    /// Permissions carried by a role assignment under a grain's declared roles.
    ///
    /// `None` selects the default role (empty if none is declared),
    /// `AllAccess` sets every declared bit, `RoleId` selects that role's bits
    /// (empty for an unknown role). The explicit add list is applied next,
    /// then the remove list.
    pub fn from_role_assignment(assignment: &RoleAssignment, view_info: &ViewInfo) -> Self {
        let mut result = match assignment.role {
            RoleBase::None => view_info
                .default_role()
                .map(|role| role.permissions.clone())
                .unwrap_or_default(),
            RoleBase::AllAccess => Self::full(view_info.permission_count()),
            RoleBase::RoleId(role_id) => usize::try_from(role_id)
                .ok()
                .and_then(|index| view_info.roles.get(index))
                .map(|role| role.permissions.clone())
                .unwrap_or_default(),
        };

        result.add(&assignment.add_permissions);
        result.remove(&assignment.remove_permissions);
        result
    }

    /// Length of the underlying vector, including trailing cleared bits
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Whether a bit is set; out of range reads as `false`
    pub fn contains(&self, index: usize) -> bool {
        self.bits.get(index).copied().unwrap_or(false)
    }

    /// Set one bit, growing the vector as needed. Returns whether it changed.
    pub fn insert(&mut self, index: usize) -> bool {
        if index >= self.bits.len() {
            self.bits.resize(index + 1, false);
        }
        let changed = !self.bits[index];
        self.bits[index] = true;
        changed
    }

    /// Indices of the set bits, ascending
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter_map(|(index, bit)| bit.then_some(index))
    }

    /// The raw vector
    pub fn as_slice(&self) -> &[bool] {
        &self.bits
    }

    /// No bit is set
    pub fn is_empty(&self) -> bool {
        !self.bits.iter().any(|bit| *bit)
    }

    /// Every bit set here is also set in `other`
    pub fn is_subset_of(&self, other: &PermissionSet) -> bool {
        self.iter().all(|index| other.contains(index))
    }

    /// Union `other` into `self`. Returns whether any bit changed.
    pub fn add(&mut self, other: &PermissionSet) -> bool {
        let mut changed = false;
        for index in other.iter() {
            changed |= self.insert(index);
        }
        changed
    }

    /// Clear every bit of `other` from `self`. Returns whether any bit changed.
    pub fn remove(&mut self, other: &PermissionSet) -> bool {
        let mut changed = false;
        for (index, bit) in self.bits.iter_mut().enumerate() {
            if *bit && other.contains(index) {
                *bit = false;
                changed = true;
            }
        }
        changed
    }

    /// Keep only bits also set in `other`. Returns whether any bit changed.
    pub fn intersect(&mut self, other: &PermissionSet) -> bool {
        let mut changed = false;
        for (index, bit) in self.bits.iter_mut().enumerate() {
            if *bit && !other.contains(index) {
                *bit = false;
                changed = true;
            }
        }
        changed
    }

    /// Pack into a little-endian bitfield: bit `i` lands in byte `i / 8` at bit `i % 8`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.bits.len().div_ceil(8)];
        for index in self.iter() {
            bytes[index / 8] |= 1 << (index % 8);
        }
        bytes
    }
}

impl PartialEq for PermissionSet {
    fn eq(&self, other: &Self) -> bool {
        self.is_subset_of(other) && other.is_subset_of(self)
    }
}

impl Eq for PermissionSet {}

impl From<Vec<bool>> for PermissionSet {
    fn from(bits: Vec<bool>) -> Self {
        Self { bits }
    }
}

impl From<&[bool]> for PermissionSet {
    fn from(bits: &[bool]) -> Self {
        Self {
            bits: bits.to_vec(),
        }
    }
}

impl fmt::Debug for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
