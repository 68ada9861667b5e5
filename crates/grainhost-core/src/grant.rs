//! Capability grant records
//!
//! An [`ApiToken`] is one edge of the sharing graph: it carries the
//! permissions named by its [`RoleAssignment`] from its sharer (the issuing
//! identity, or the parent token when chained) to its recipient (the
//! [`TokenOwner`]). Membrane requirements make the edge conditional.

use crate::identifiers::{AccountId, AppId, GrainId, IdentityId, TokenId};
use crate::permission_set::PermissionSet;
use crate::view_info::RoleAssignment;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// base64(SHA-256(input)), the hashing used for token and host ids
pub fn sha256_base64(input: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(input))
}

/// hex(SHA-256(input))
pub fn sha256_hex(input: &[u8]) -> String {
    hex::encode(Sha256::digest(input))
}

impl TokenId {
    /// The id under which the grant for a bearer secret is stored
    pub fn from_secret(secret: &str) -> Self {
        Self::new(sha256_base64(secret.as_bytes()))
    }
}

/// Key of the [`ApiHost`] record describing unauthenticated access for a secret
pub fn api_host_id_for_secret(secret: &str) -> String {
    sha256_base64(format!("api-host:{secret}").as_bytes())
}

/// Text with optional translations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LocalizedText {
    /// Text shown when no localization matches
    pub default_text: String,
    /// Per-locale overrides
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub localizations: Vec<Localization>,
}

impl LocalizedText {
    /// Untranslated text
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            default_text: text.into(),
            localizations: Vec::new(),
        }
    }
}

/// One translated string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Localization {
    /// BCP 47 locale tag
    pub locale: String,
    /// Translated text
    pub text: String,
}

/// Display snapshot of a grain stored on user-owned grants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GrainMetadata {
    /// Title of the grain's app
    pub app_title: LocalizedText,
    /// Icon asset id, when the package ships one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// App id for identicon rendering when there is no icon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<AppId>,
}

/// Grant delivered to a specific identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOwner {
    /// Recipient identity
    pub identity_id: IdentityId,
    /// Title the recipient sees for the grain
    #[serde(default)]
    pub title: String,
    /// Display snapshot taken when the grant was minted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denormalized_grain_metadata: Option<GrainMetadata>,
    /// Last time the recipient opened the grain through this grant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

/// Grant embedded into another grain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrainOwner {
    /// Grain holding the capability
    pub grain_id: GrainId,
    /// Label shown when auditing the grain's saved capabilities
    pub save_label: LocalizedText,
    /// Identity that introduced the capability, for audit
    pub introducer_identity: IdentityId,
}

/// Recipient of a grant. Unknown variants fail to deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum TokenOwner {
    /// Bearer secret usable by anyone holding it
    #[default]
    Webkey,
    /// Bound to one identity
    User(UserOwner),
    /// Saved inside another grain
    Grain(GrainOwner),
    /// Implemented outside any grain
    Frontend,
}

/// Condition a grant depends on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MembraneRequirement {
    /// `identity_id` must hold `permissions` on `grain_id`
    #[serde(rename_all = "camelCase")]
    PermissionsHeld {
        /// Grain the permissions are held on
        grain_id: GrainId,
        /// Identity that must hold them
        identity_id: IdentityId,
        /// Required bits; access to the grain itself is always required
        #[serde(default)]
        permissions: PermissionSet,
    },
}

/// A capability grant as persisted in the token store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiToken {
    /// base64(SHA-256(bearer secret))
    #[serde(rename = "_id")]
    pub id: TokenId,
    /// Grain this grant applies to
    pub grain_id: GrainId,
    /// Issuing identity; inherited from the parent on chained grants
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<IdentityId>,
    /// Account of the issuing identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
    /// Attenuation applied along this edge
    #[serde(default)]
    pub role_assignment: RoleAssignment,
    /// Grant this one was derived from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_token: Option<TokenId>,
    /// Recipient
    #[serde(default)]
    pub owner: TokenOwner,
    /// All must hold or the grant carries nothing
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<MembraneRequirement>,
    /// Revoked grants are ignored by the resolver
    #[serde(default)]
    pub revoked: bool,
    /// Absolute expiry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    /// Expiry cleared or pushed back on use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_if_unused: Option<DateTime<Utc>>,
    /// Whether recipients may reshare through child webkeys
    #[serde(default)]
    pub for_sharing: bool,
    /// Set on capabilities to objects other than the grain's main view
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<serde_json::Value>,
    /// Set on capabilities implemented by the front end
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend_ref: Option<serde_json::Value>,
    /// An [`ApiHost`] record exists for this grant's secret
    #[serde(default)]
    pub has_api_host: bool,
    /// Label chosen by the issuer
    #[serde(default)]
    pub petname: String,
    /// Creation time
    pub created: DateTime<Utc>,
}

impl ApiToken {
    /// A webkey grant with the default role and no issuer
    pub fn new(id: TokenId, grain_id: GrainId, created: DateTime<Utc>) -> Self {
        Self {
            id,
            grain_id,
            identity_id: None,
            account_id: None,
            role_assignment: RoleAssignment::none(),
            parent_token: None,
            owner: TokenOwner::Webkey,
            requirements: Vec::new(),
            revoked: false,
            expires: None,
            expires_if_unused: None,
            for_sharing: false,
            object_id: None,
            frontend_ref: None,
            has_api_host: false,
            petname: String::new(),
            created,
        }
    }

    /// Identity receiving this grant, for user-owned grants
    pub fn recipient_identity(&self) -> Option<&IdentityId> {
        match &self.owner {
            TokenOwner::User(user) => Some(&user.identity_id),
            _ => None,
        }
    }

    /// Capability to the grain's main view rather than to some other object
    pub fn is_ui_view(&self) -> bool {
        self.object_id.is_none() && self.frontend_ref.is_none()
    }

    /// Eligible to carry permissions in the sharing graph at `now`
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && !self.is_expired(now) && self.is_ui_view()
    }

    /// Whether `expires` has passed at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.map_or(false, |expires| expires <= now)
    }

    /// Whether a field the resolver depends on differs between two versions
    pub fn authority_changed(&self, other: &ApiToken) -> bool {
        self.role_assignment != other.role_assignment
            || self.revoked != other.revoked
            || self.expires != other.expires
    }
}

/// Static resource served to unauthenticated API clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticResource {
    /// MIME type
    #[serde(rename = "type")]
    pub mime_type: String,
    /// Content-Language
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Content-Encoding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    /// Body
    pub body: String,
}

/// Protocol options advertised to unauthenticated clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ApiHostOptions {
    /// WebDAV compliance classes
    #[serde(default)]
    pub dav: Vec<String>,
}

/// Unauthenticated access descriptor supplied when minting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UnauthenticatedAccess {
    /// Protocol options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ApiHostOptions>,
    /// Path to resource map
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<BTreeMap<String, StaticResource>>,
}

/// Record serving unauthenticated requests for a grant's API host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiHost {
    /// [`api_host_id_for_secret`] of the bearer secret
    #[serde(rename = "_id")]
    pub id: String,
    /// base64(SHA-256(token id)), binding the host to its grant
    pub hash2: String,
    /// Protocol options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ApiHostOptions>,
    /// Path to resource map
    #[serde(default)]
    pub resources: BTreeMap<String, StaticResource>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_owner_variant_rejected() {
        let json = serde_json::json!({
            "_id": "t1",
            "grainId": "g1",
            "owner": { "mailbox": { "address": "x" } },
            "created": "2024-01-01T00:00:00Z",
        });
        let parsed: std::result::Result<ApiToken, _> = serde_json::from_value(json);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_unknown_requirement_rejected() {
        let json = serde_json::json!({
            "_id": "t1",
            "grainId": "g1",
            "requirements": [{ "userIsAdmin": "someone" }],
            "created": "2024-01-01T00:00:00Z",
        });
        let parsed: std::result::Result<ApiToken, _> = serde_json::from_value(json);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_owner_wire_shape() {
        let json = serde_json::json!({
            "_id": "t1",
            "grainId": "g1",
            "identityId": "alice",
            "owner": { "user": { "identityId": "bob", "title": "Notes" } },
            "requirements": [{
                "permissionsHeld": { "grainId": "g2", "identityId": "alice", "permissions": [true] }
            }],
            "created": "2024-01-01T00:00:00Z",
        });
        let token: ApiToken = serde_json::from_value(json).unwrap();
        assert_eq!(token.recipient_identity(), Some(&IdentityId::new("bob")));
        assert_eq!(token.requirements.len(), 1);
        assert!(token.is_live(Utc::now()));
    }

    #[test]
    fn test_expired_grants_are_not_live() {
        let now = Utc::now();
        let mut token = ApiToken::new(TokenId::new("t1"), GrainId::new("g1"), now);
        token.expires = Some(now + chrono::Duration::hours(1));
        assert!(token.is_live(now));
        assert!(!token.is_live(now + chrono::Duration::hours(2)));

        let mut moved = token.clone();
        moved.expires = Some(now - chrono::Duration::hours(1));
        assert!(token.authority_changed(&moved));
    }

    #[test]
    fn test_token_id_from_secret() {
        let id = TokenId::from_secret("secret");
        assert_eq!(id.as_str(), "K7gNU3sdo+OL0wNhqoVWhr3g6s1xYv72ol/pe/Unols=");
    }
}
