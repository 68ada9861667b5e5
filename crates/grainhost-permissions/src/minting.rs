//! Grant minting and editing

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use grainhost_core::config::MintingConfig;
use grainhost_core::records::denormalized_grain_metadata;
use grainhost_core::{
    api_host_id_for_secret, sha256_base64, AccountId, ApiHost, ApiToken, GrainId, GrainOwner,
    GrainhostError, IdentityId, Result, RoleAssignment, Store, TokenId, TokenOwner,
    UnauthenticatedAccess, UserOwner,
};
use rand::RngCore;

/// Who is issuing a new grant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    /// A logged-in identity sharing directly
    Identity {
        /// Issuing identity
        identity_id: IdentityId,
        /// Account the identity belongs to
        account_id: AccountId,
    },
    /// Holder of an existing bearer secret deriving a child grant
    ParentSecret(String),
}

/// Requested recipient of a new grant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerRequest {
    /// A bearer webkey
    Webkey {
        /// Recipients may reshare
        for_sharing: bool,
        /// Self-destruct if not redeemed within this long
        expires_if_unused_after: Option<Duration>,
    },
    /// A specific identity
    User {
        /// Recipient
        identity_id: IdentityId,
        /// Title the recipient sees
        title: String,
    },
    /// Another grain
    Grain(GrainOwner),
    /// The front end
    Frontend,
}

/// Parameters of [`create_new_api_token`]
#[derive(Debug, Clone)]
pub struct MintRequest {
    /// Issuer
    pub provider: Provider,
    /// Grain being shared
    pub grain_id: GrainId,
    /// Issuer's label for the grant
    pub petname: String,
    /// Permissions to pass
    pub role_assignment: RoleAssignment,
    /// Recipient
    pub owner: OwnerRequest,
    /// Optional unauthenticated access descriptor
    pub unauthenticated: Option<UnauthenticatedAccess>,
}

/// A freshly minted grant
#[derive(Debug, Clone)]
pub struct NewApiToken {
    /// Stored id, the hash of `token`
    pub id: TokenId,
    /// Bearer secret; never stored
    pub token: String,
    /// Parent grant when derived from a bearer secret
    pub parent: Option<ApiToken>,
}

/// Generate an unguessable bearer secret
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Mint a UiView grant on a grain.
///
/// Fails with `PayloadTooLarge` if the unauthenticated descriptor exceeds
/// the configured limit, `Invalid` if it is malformed, `NotFound` if the
/// grain does not exist and `PermissionDenied` if a parent secret does not
/// name a UiView grant on the same grain.
pub fn create_new_api_token(
    store: &dyn Store,
    request: MintRequest,
    config: &MintingConfig,
    now: DateTime<Utc>,
) -> Result<NewApiToken> {
    if let Some(unauthenticated) = &request.unauthenticated {
        validate_unauthenticated(unauthenticated)?;
        let size = serde_json::to_string(unauthenticated)?.len();
        if size > config.unauthenticated_limit_bytes {
            return Err(GrainhostError::payload_too_large(format!(
                "unauthenticated params are {size} bytes; limit {}",
                config.unauthenticated_limit_bytes
            )));
        }
    }

    let grain = store
        .get_grain(&request.grain_id)?
        .ok_or_else(|| GrainhostError::not_found(format!("no grain {}", request.grain_id)))?;

    let secret = generate_secret();
    let mut token = ApiToken::new(TokenId::from_secret(&secret), grain.id.clone(), now);
    token.role_assignment = request.role_assignment;
    token.petname = request.petname;

    let mut parent = None;
    let mut parent_for_sharing = false;
    match request.provider {
        Provider::ParentSecret(raw_parent) => {
            let parent_id = TokenId::from_secret(&raw_parent);
            let parent_token = store
                .get_token(&parent_id)?
                .filter(|p| p.grain_id == grain.id && p.object_id.is_none())
                .ok_or_else(|| GrainhostError::permission_denied("no such parent token"))?;
            parent_for_sharing = parent_token.for_sharing;
            token.identity_id = parent_token.identity_id.clone();
            token.account_id = parent_token.account_id.clone();
            token.parent_token = Some(parent_id);
            parent = Some(parent_token);
        }
        Provider::Identity {
            identity_id,
            account_id,
        } => {
            token.identity_id = Some(identity_id);
            token.account_id = Some(account_id);
        }
    }

    token.owner = match request.owner {
        OwnerRequest::Webkey {
            for_sharing,
            expires_if_unused_after,
        } => {
            token.for_sharing = parent_for_sharing || for_sharing;
            token.expires_if_unused = expires_if_unused_after.map(|after| now + after);
            TokenOwner::Webkey
        }
        OwnerRequest::User { identity_id, title } => {
            let package = store.get_package(&grain.package_id)?;
            TokenOwner::User(UserOwner {
                identity_id,
                title,
                denormalized_grain_metadata: Some(denormalized_grain_metadata(
                    &grain,
                    package.as_ref(),
                )),
                last_used: None,
            })
        }
        OwnerRequest::Grain(owner) => TokenOwner::Grain(owner),
        OwnerRequest::Frontend => TokenOwner::Frontend,
    };

    let api_host = request.unauthenticated.map(|unauthenticated| ApiHost {
        id: api_host_id_for_secret(&secret),
        hash2: sha256_base64(token.id.as_str().as_bytes()),
        options: unauthenticated.options,
        resources: unauthenticated.resources.unwrap_or_default(),
    });
    token.has_api_host = api_host.is_some();

    let id = token.id.clone();
    store.insert_token(token)?;
    if let Some(api_host) = api_host {
        // Neither record may outlive a failed mint.
        if let Err(err) = store.insert_api_host(api_host) {
            store.remove_token(&id)?;
            return Err(err);
        }
    }
    tracing::debug!(grain_id = %grain.id, token_id = %id, "minted grant");

    Ok(NewApiToken {
        id,
        token: secret,
        parent,
    })
}

fn header_safe(value: &str) -> bool {
    value.bytes().all(|b| (0x20..=0x7e).contains(&b))
}

fn dav_class(value: &str) -> bool {
    const TCHAR: &[u8] = b"!#$%&'*+.^_`|~-";
    let token = !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || TCHAR.contains(&b));
    let url = value.len() >= 2
        && value.starts_with('<')
        && value.ends_with('>')
        && value.bytes().all(|b| (0x21..=0x7e).contains(&b));
    token || url
}

fn validate_unauthenticated(access: &UnauthenticatedAccess) -> Result<()> {
    if let Some(options) = &access.options {
        if let Some(bad) = options.dav.iter().find(|class| !dav_class(class)) {
            return Err(GrainhostError::invalid(format!("bad DAV class {bad:?}")));
        }
    }
    for (path, resource) in access.resources.iter().flatten() {
        let path_ok = path.starts_with('/') && path.bytes().all(|b| (0x21..=0x7e).contains(&b));
        if !path_ok {
            return Err(GrainhostError::invalid(format!("bad resource path {path:?}")));
        }
        let headers = [
            Some(resource.mime_type.as_str()),
            resource.language.as_deref(),
            resource.encoding.as_deref(),
        ];
        if !headers.into_iter().flatten().all(header_safe) {
            return Err(GrainhostError::invalid(format!(
                "resource {path:?} has a header value that is not printable ASCII"
            )));
        }
    }
    Ok(())
}

/// Editable grant fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenUpdate {
    /// New label
    pub petname: Option<String>,
    /// New attenuation
    pub role_assignment: Option<RoleAssignment>,
    /// Revoke or un-revoke
    pub revoked: Option<bool>,
}

/// Edit a grant on behalf of the account owning its issuing identity
pub fn update_api_token(
    store: &dyn Store,
    caller: &AccountId,
    token_id: &TokenId,
    update: TokenUpdate,
) -> Result<ApiToken> {
    let token = store
        .get_token(token_id)?
        .ok_or_else(|| GrainhostError::not_found(format!("no token {token_id}")))?;
    let account = store.get_account(caller)?;
    let authorized = match (&account, &token.identity_id) {
        (Some(account), Some(identity_id)) => account.has_identity(identity_id),
        _ => false,
    };
    if !authorized {
        return Err(GrainhostError::permission_denied(
            "user not authorized to modify this token",
        ));
    }

    store
        .update_token(token_id, &mut |token: &mut ApiToken| {
            if let Some(petname) = &update.petname {
                token.petname = petname.clone();
            }
            if let Some(role_assignment) = &update.role_assignment {
                token.role_assignment = role_assignment.clone();
            }
            if let Some(revoked) = update.revoked {
                token.revoked = revoked;
            }
        })?
        .ok_or_else(|| GrainhostError::gone(format!("token {token_id} was removed concurrently")))
}
