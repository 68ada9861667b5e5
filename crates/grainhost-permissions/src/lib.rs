//! # Grainhost Permissions
//!
//! Computes which permissions a principal holds on a grain by forward
//! chaining over the sharing graph of capability grants.
//!
//! - [`Vertex`] / [`Principal`]: nodes of the sharing graph and the askers
//! - [`Context`]: resolution-scoped cache and Horn-SAT worklist resolver
//! - [`compute_relevant_tokens`]: prunes the graph to owner-to-target paths
//! - [`grain_permissions`] / [`may_open_grain`]: race-safe queries with a
//!   [`TokenWatch`](grainhost_core::TokenWatch) over the justifying grants
//! - [`create_new_api_token`] / [`update_api_token`]: grant minting and editing
//! - [`downstream_tokens`] / [`downstream_of_grant`]: revocation cascade
//! - [`validate_webkey`] / [`cleanup_self_destructing`]: webkey lifecycle
//!
//! Resolution is synchronous and touches the store only through
//! [`Store`](grainhost_core::Store) lookups keyed by the grains involved.

#![forbid(unsafe_code)]

pub mod context;
pub mod downstream;
pub mod minting;
pub mod relevant;
pub mod requirements;
pub mod verify;
pub mod vertex;
pub mod webkey;

pub use context::{permission_ids, Context, PermissionId};
pub use downstream::{downstream_of_grant, downstream_tokens};
pub use minting::{
    create_new_api_token, generate_secret, update_api_token, MintRequest, NewApiToken,
    OwnerRequest, Provider, TokenUpdate,
};
pub use relevant::{compute_relevant_tokens, OwnerEdge, RelevantTokens};
pub use requirements::RequirementSet;
pub use verify::{grain_permissions, may_open_grain, GrainPermissions};
pub use vertex::{Principal, Vertex};
pub use webkey::{cleanup_self_destructing, validate_webkey};
