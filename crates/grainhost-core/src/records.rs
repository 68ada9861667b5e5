//! Document-store records read and written by the kernel
//!
//! Only the fields the permission resolver, connection manager and proxy
//! touch are modelled here.

use crate::grant::{GrainMetadata, LocalizedText};
use crate::identifiers::{AccountId, AppId, GrainId, HostId, IdentityId, PackageId, SessionId, TokenId};
use crate::permission_set::PermissionSet;
use crate::view_info::ViewInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A grain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grain {
    /// Grain id
    #[serde(rename = "_id")]
    pub id: GrainId,
    /// Owning account
    #[serde(rename = "userId")]
    pub owner_account: AccountId,
    /// Owning identity
    #[serde(rename = "identityId")]
    pub owner_identity: IdentityId,
    /// Legacy grains are public: anyone holding the id gets the default role
    #[serde(default)]
    pub private: bool,
    /// Last ViewInfo reported by the app
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_view_info: Option<ViewInfo>,
    /// Installed package backing this grain
    pub package_id: PackageId,
    /// App the package belongs to
    pub app_id: AppId,
    /// Owner's title for the grain
    #[serde(default)]
    pub title: String,
    /// Last time any session used the grain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

impl Grain {
    /// Cached ViewInfo, or an empty one when the app has not reported any
    pub fn view_info(&self) -> ViewInfo {
        self.cached_view_info.clone().unwrap_or_default()
    }
}

/// A user account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Account id
    #[serde(rename = "_id")]
    pub id: AccountId,
    /// Identities linked to this account
    #[serde(default)]
    pub identity_ids: Vec<IdentityId>,
    /// Bytes of grain storage in use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_usage: Option<u64>,
    /// Plan name; the configured default plan applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    /// Admins are exempt from quota
    #[serde(default)]
    pub is_admin: bool,
    /// Last activity on any grain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active: Option<DateTime<Utc>>,
}

impl Account {
    /// An account with the given linked identities
    pub fn new(id: AccountId, identity_ids: Vec<IdentityId>) -> Self {
        Self {
            id,
            identity_ids,
            storage_usage: None,
            plan: None,
            is_admin: false,
            last_active: None,
        }
    }

    /// Whether `identity_id` is linked to this account
    pub fn has_identity(&self, identity_id: &IdentityId) -> bool {
        self.identity_ids.contains(identity_id)
    }
}

/// A browser or API session on a grain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session id
    #[serde(rename = "_id")]
    pub id: SessionId,
    /// Grain the session is bound to
    pub grain_id: GrainId,
    /// Per-session host label
    pub host_id: HostId,
    /// Logged-in identity, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<IdentityId>,
    /// Logged-in account, if any
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "userId")]
    pub account_id: Option<AccountId>,
    /// Grant the session was opened through, for anonymous sessions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashed_token: Option<TokenId>,
    /// Last keep-alive, milliseconds since the epoch
    pub timestamp: i64,
    /// The app has produced at least one response
    #[serde(default)]
    pub has_loaded: bool,
    /// ViewInfo the session's permissions were computed against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_info: Option<ViewInfo>,
    /// Permissions granted when the session was established
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<PermissionSet>,
}

/// An environment variable of a grain command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Name
    pub key: String,
    /// Value
    pub value: String,
}

/// How the supervisor launches the app inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Argument vector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argv: Option<Vec<String>>,
    /// Environment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environ: Vec<EnvVar>,
    /// Executable for packages predating `argv`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated_executable_path: Option<String>,
    /// Legacy spelling of `argv`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// Legacy spelling of `deprecated_executable_path`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_path: Option<String>,
}

impl Command {
    /// Fold legacy fields into their current names.
    ///
    /// A current field that is already set wins; legacy fields are always cleared.
    pub fn normalized(mut self) -> Self {
        if let Some(args) = self.args.take() {
            self.argv.get_or_insert(args);
        }
        if let Some(path) = self.executable_path.take() {
            self.deprecated_executable_path.get_or_insert(path);
        }
        self
    }
}

/// Package manifest fields the kernel reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// App title
    #[serde(default)]
    pub app_title: LocalizedText,
    /// Command used to resume an existing grain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_command: Option<Command>,
    /// Icon asset id shown for grains of this app
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grain_icon: Option<String>,
}

/// An installed package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    /// Package id
    #[serde(rename = "_id")]
    pub id: PackageId,
    /// App this package is a version of
    pub app_id: AppId,
    /// Manifest
    pub manifest: Manifest,
}

/// An app under development, overriding installed packages with the same app id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevApp {
    /// App id being overridden
    #[serde(rename = "_id")]
    pub id: AppId,
    /// Package id of the dev build
    pub package_id: PackageId,
    /// Manifest of the dev build
    pub manifest: Manifest,
}

/// Snapshot stored on user-owned grants when they are minted
pub fn denormalized_grain_metadata(grain: &Grain, package: Option<&Package>) -> GrainMetadata {
    let manifest = package.map(|pkg| &pkg.manifest);
    let icon = manifest.and_then(|m| m.grain_icon.clone());
    GrainMetadata {
        app_title: manifest.map(|m| m.app_title.clone()).unwrap_or_default(),
        app_id: icon.is_none().then(|| grain.app_id.clone()),
        icon,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_command_fields_normalized() {
        let command = Command {
            args: Some(vec!["/start.sh".into()]),
            executable_path: Some("/bin/sh".into()),
            ..Default::default()
        }
        .normalized();
        assert_eq!(command.argv, Some(vec!["/start.sh".to_string()]));
        assert_eq!(command.deprecated_executable_path.as_deref(), Some("/bin/sh"));
        assert!(command.args.is_none());
        assert!(command.executable_path.is_none());
    }

    #[test]
    fn test_current_command_fields_win() {
        let command = Command {
            argv: Some(vec!["new".into()]),
            args: Some(vec!["old".into()]),
            ..Default::default()
        }
        .normalized();
        assert_eq!(command.argv, Some(vec!["new".to_string()]));
        assert!(command.args.is_none());
    }
}
