//! Per-grain permission vocabulary
//!
//! A grain's app declares an ordered list of permissions and a list of roles,
//! each role naming a subset of those permissions. Grants refer to roles
//! through a [`RoleAssignment`].

use crate::permission_set::PermissionSet;
use serde::{Deserialize, Serialize};

/// One app-defined permission bit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PermissionDef {
    /// Stable machine name, e.g. `"write"`
    pub name: String,
    /// Human readable title
    #[serde(default)]
    pub title: String,
    /// Hidden permissions are not offered in sharing UIs
    #[serde(default)]
    pub obsolete: bool,
}

/// A named alias for a set of permissions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RoleDef {
    /// Human readable title, e.g. `"editor"`
    pub title: String,
    /// Permission bits this role carries
    #[serde(default)]
    pub permissions: PermissionSet,
    /// Role assigned when a grant does not name one
    #[serde(default)]
    pub default: bool,
}

/// Roles and permissions declared by a grain's app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ViewInfo {
    /// Ordered app-defined permissions; index is the permission bit
    #[serde(default)]
    pub permissions: Vec<PermissionDef>,
    /// Declared roles; index is the role id
    #[serde(default)]
    pub roles: Vec<RoleDef>,
}

impl ViewInfo {
    /// Number of app-defined permission bits
    pub fn permission_count(&self) -> usize {
        self.permissions.len()
    }

    /// The role marked as default, if any
    pub fn default_role(&self) -> Option<&RoleDef> {
        self.roles.iter().find(|role| role.default)
    }

    /// Every declared bit set
    pub fn all_permissions(&self) -> PermissionSet {
        PermissionSet::from_role_assignment(&RoleAssignment::all_access(), self)
    }
}

/// Base role chosen by a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum RoleBase {
    /// No role chosen; the grain's default role applies
    #[default]
    None,
    /// Every declared permission
    AllAccess,
    /// The role at this index of [`ViewInfo::roles`]
    RoleId(u32),
}

/// Permissions passed along one edge of the sharing graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RoleAssignment {
    /// Base role
    #[serde(default)]
    pub role: RoleBase,
    /// Bits added on top of the base role
    #[serde(default, skip_serializing_if = "PermissionSet::is_empty")]
    pub add_permissions: PermissionSet,
    /// Bits removed from the base role
    #[serde(default, skip_serializing_if = "PermissionSet::is_empty")]
    pub remove_permissions: PermissionSet,
}

impl RoleAssignment {
    /// Default role, no adjustments
    pub fn none() -> Self {
        Self::default()
    }

    /// All declared permissions
    pub fn all_access() -> Self {
        Self {
            role: RoleBase::AllAccess,
            ..Self::default()
        }
    }

    /// A declared role by index
    pub fn role(role_id: u32) -> Self {
        Self {
            role: RoleBase::RoleId(role_id),
            ..Self::default()
        }
    }

    /// Add extra bits to this assignment
    pub fn with_added(mut self, permissions: PermissionSet) -> Self {
        self.add_permissions = permissions;
        self
    }

    /// Strip bits from this assignment
    pub fn with_removed(mut self, permissions: PermissionSet) -> Self {
        self.remove_permissions = permissions;
        self
    }
}
