//! Grainhost Testing Infrastructure
//!
//! Shared setup for the integration tests of the other crates: a [`World`]
//! that seeds a [`MemoryStore`](grainhost_core::MemoryStore) with accounts,
//! grains and grants, and [`MockBackend`], an in-process grain backend whose
//! apps echo requests and can be told to disconnect or to predate optional
//! methods.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! grainhost-testkit = { path = "../grainhost-testkit" }
//! ```
//!
//! ```rust,no_run
//! use grainhost_testkit::*;
//!
//! let world = World::new();
//! let (_, alice) = world.add_user("alice");
//! let grain = world.add_grain("g", "alice", true);
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

pub mod mocks;
pub mod store;
pub mod world;

pub use mocks::*;
pub use store::HookedStore;
pub use world::*;

/// Route `tracing` output to the test harness, filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
