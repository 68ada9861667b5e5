//! # Grainhost Proxy
//!
//! HTTP front end of the kernel. Every grain session is served on a host of
//! its own, bound to the client by a cookie; machine clients share one API
//! host and authenticate with bearer tokens.
//!
//! - [`Proxy`]: lazily opens the app session for one binding, proving the
//!   caller's permissions first, and forwards requests with one
//!   reconnect-and-retry when the grain dies
//! - [`ProxyRegistry`]: proxies by session host and by API token, closed as
//!   grants are revoked or grains change privacy
//! - [`router`] / [`serve`]: axum dispatch by `Host`
//! - [`http`] / [`websocket`]: request parsing, response translation and the
//!   raw WebSocket byte pump

#![forbid(unsafe_code)]

pub mod http;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod websocket;

pub use proxy::{Proxy, ProxyBinding};
pub use registry::ProxyRegistry;
pub use router::{router, serve};
