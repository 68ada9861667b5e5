//! # Grainhost Core
//!
//! Shared vocabulary of the grain hosting kernel:
//!
//! - **Identifiers** ([`GrainId`], [`TokenId`], ...) as string newtypes
//! - **Errors**: one [`GrainhostError`] enum with a [`Result`] alias
//! - **Permissions**: [`PermissionSet`] algebra and per-grain [`ViewInfo`]
//! - **Records**: capability grants ([`ApiToken`]), grains, accounts, sessions
//! - **Store**: the document-store traits, an in-memory implementation,
//!   change events and token watches
//! - **Config**: [`GrainhostConfig`] loaded from TOML and the environment

#![forbid(unsafe_code)]

pub mod config;
pub mod errors;
pub mod grant;
pub mod identifiers;
pub mod permission_set;
pub mod records;
pub mod store;
pub mod view_info;

pub use config::{Config, GrainhostConfig, Plan};
pub use errors::{GrainhostError, Result, RpcError, RpcErrorKind};
pub use grant::{
    api_host_id_for_secret, sha256_base64, sha256_hex, ApiHost, ApiHostOptions, ApiToken,
    GrainMetadata, GrainOwner, LocalizedText, MembraneRequirement, StaticResource, TokenOwner,
    UnauthenticatedAccess, UserOwner,
};
pub use identifiers::{AccountId, AppId, GrainId, HostId, IdentityId, PackageId, SessionId, TokenId};
pub use permission_set::PermissionSet;
pub use records::{Account, Command, DevApp, Grain, Manifest, Package, Session};
pub use store::{MemoryStore, Store, StoreEvent, TokenWatch};
pub use view_info::{PermissionDef, RoleAssignment, RoleBase, RoleDef, ViewInfo};

/// Milliseconds since the Unix epoch, the unit of session timestamps
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
